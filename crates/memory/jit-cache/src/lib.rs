//! Code and data cache admission for the JIT runtime
//!
//! - [`sizing`]: turns cache options and platform defaults into segment sizes
//! - [`code_cache`]: one segment with warm/cold cursors and a free list
//! - [`manager`]: reservation, growth, occupancy back-pressure, GC-end
//!   reclamation
//! - [`data_cache`]: metadata segments

pub mod code_cache;
pub mod data_cache;
pub mod error;
pub mod manager;
pub mod sizing;

pub use code_cache::{CodeAllocation, CodeCache};
pub use data_cache::{DataAllocation, DataCacheManager};
pub use error::{CacheError, CacheResult};
pub use manager::{CacheReservation, CodeCacheManager, CodeCacheStats, ReclaimSource, ReclaimStats};
pub use sizing::{CacheSizing, MAX_CODE_CACHE_KB, MIN_CODE_CACHE_KB};
