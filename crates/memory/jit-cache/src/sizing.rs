//! Code/data cache sizing
//!
//! Turns the user's cache options plus platform defaults into the concrete
//! segment sizes, totals and counts the managers are built from.

use jit_core::{CacheConfig, JitError, RemoteCompilationMode};
use tracing::{info, warn};

/// Smallest code cache segment the runtime can work with.
pub const MIN_CODE_CACHE_KB: usize = 128;
/// Largest code cache segment outside AOT-only mode.
pub const MAX_CODE_CACHE_KB: usize = 32 * 1024;

const DEFAULT_CODE_CACHE_KB: usize = 2048;
const DEFAULT_DATA_CACHE_KB: usize = 2048;
const SERVER_CACHE_KB: usize = 1024;

const CODE_TOTAL_KB_64: usize = 256 * 1024;
const DATA_TOTAL_KB_64: usize = 384 * 1024;
const CODE_TOTAL_KB_32: usize = 64 * 1024;
const DATA_TOTAL_KB_32: usize = 192 * 1024;
const CODE_TOTAL_KB_AOT: usize = 128 * 1024;
const DATA_TOTAL_KB_AOT: usize = 64 * 1024;

const STARTUP_CACHES_64: usize = 4;
const STARTUP_CACHES_32: usize = 1;

/// Final cache geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizing {
    pub code_cache_kb: usize,
    pub data_cache_kb: usize,
    pub code_cache_total_kb: usize,
    pub data_cache_total_kb: usize,
    pub max_number_of_code_caches: usize,
    pub num_code_caches_at_startup: usize,
    pub high_occupancy_threshold_bytes: usize,
    pub low_code_cache_threshold_bytes: usize,
    pub consolidated: bool,
    pub allow_grow: bool,
}

impl CacheSizing {
    /// Compute the geometry for `config` on a node playing `role`.
    ///
    /// `free_physical_memory` (bytes) shrinks the code cache total on
    /// memory-starved machines.
    pub fn compute(
        config: &CacheConfig,
        role: RemoteCompilationMode,
        free_physical_memory: Option<u64>,
    ) -> Result<Self, JitError> {
        let server = role == RemoteCompilationMode::Server;

        let mut code_cache_kb = config.code_cache_kb.unwrap_or(if server {
            SERVER_CACHE_KB
        } else {
            DEFAULT_CODE_CACHE_KB
        });
        let mut data_cache_kb = config.data_cache_kb.unwrap_or(if server {
            SERVER_CACHE_KB
        } else {
            DEFAULT_DATA_CACHE_KB
        });
        let mut code_cache_total_kb = config.code_cache_total_kb.unwrap_or(if config.aot_only {
            CODE_TOTAL_KB_AOT
        } else if config.is_64bit {
            CODE_TOTAL_KB_64
        } else {
            CODE_TOTAL_KB_32
        });
        let data_cache_total_kb = config.data_cache_total_kb.unwrap_or(if config.aot_only {
            DATA_TOTAL_KB_AOT
        } else if config.is_64bit {
            DATA_TOTAL_KB_64
        } else {
            DATA_TOTAL_KB_32
        });

        if let Some(free_bytes) = free_physical_memory {
            let free_kb = usize::try_from(free_bytes / 1024).unwrap_or(usize::MAX);
            if free_kb < MIN_CODE_CACHE_KB {
                return Err(JitError::CodeCacheUnavailable {
                    requested_kb: code_cache_kb,
                    minimum_kb: MIN_CODE_CACHE_KB,
                });
            }
            let low_kb = usize::try_from(config.low_physical_memory_mb * 1024).unwrap_or(usize::MAX);
            if free_kb < low_kb {
                let shrunk = (free_kb / 2).max(MIN_CODE_CACHE_KB);
                if shrunk < code_cache_total_kb {
                    warn!(
                        target: "jit::codecache",
                        free_kb,
                        from_kb = code_cache_total_kb,
                        to_kb = shrunk,
                        "low physical memory, shrinking code cache total"
                    );
                    code_cache_total_kb = shrunk;
                }
            }
        }

        if data_cache_kb < 1 {
            return Err(JitError::DataCacheTooSmall(data_cache_kb));
        }

        code_cache_kb = code_cache_kb.max(MIN_CODE_CACHE_KB);
        if !config.aot_only {
            code_cache_kb = code_cache_kb.min(MAX_CODE_CACHE_KB);
        }
        code_cache_kb = code_cache_kb.min(code_cache_total_kb);
        data_cache_kb = data_cache_kb.min(data_cache_total_kb);

        if code_cache_kb < MIN_CODE_CACHE_KB {
            return Err(JitError::CodeCacheUnavailable {
                requested_kb: code_cache_kb,
                minimum_kb: MIN_CODE_CACHE_KB,
            });
        }
        if data_cache_kb < 1 {
            return Err(JitError::DataCacheTooSmall(data_cache_kb));
        }

        let (max_number_of_code_caches, num_code_caches_at_startup) = if config.consolidated {
            (1, 1)
        } else {
            let max = if config.aot_only {
                1
            } else {
                (code_cache_total_kb / code_cache_kb).max(1)
            };
            let requested = config.num_code_caches_at_startup.unwrap_or(if config.is_64bit {
                STARTUP_CACHES_64
            } else {
                STARTUP_CACHES_32
            });
            (max, requested.clamp(1, max))
        };

        let total_bytes = code_cache_total_kb * 1024;
        let pct = config.high_code_cache_occupancy_pct.min(100) as usize;
        let sizing = CacheSizing {
            code_cache_kb,
            data_cache_kb,
            code_cache_total_kb,
            data_cache_total_kb,
            max_number_of_code_caches,
            num_code_caches_at_startup,
            high_occupancy_threshold_bytes: pct * (total_bytes / 100),
            low_code_cache_threshold_bytes: config.low_code_cache_threshold_kb * 1024,
            consolidated: config.consolidated,
            allow_grow: config.allow_grow,
        };
        info!(
            target: "jit::codecache",
            code_cache_kb,
            data_cache_kb,
            code_cache_total_kb,
            data_cache_total_kb,
            max = sizing.max_number_of_code_caches,
            startup = sizing.num_code_caches_at_startup,
            "cache sizing computed"
        );
        Ok(sizing)
    }

    pub fn code_cache_bytes(&self) -> usize {
        self.code_cache_kb * 1024
    }

    /// Size of one code cache segment. A consolidated cache is a single
    /// segment spanning the whole total.
    pub fn segment_bytes(&self) -> usize {
        if self.consolidated {
            self.code_cache_total_kb * 1024
        } else {
            self.code_cache_bytes()
        }
    }

    pub fn data_cache_bytes(&self) -> usize {
        self.data_cache_kb * 1024
    }

    /// Each compilation thread needs its own code cache, so the thread count
    /// cannot exceed the number of caches. A server treats that as fatal.
    pub fn cap_compilation_threads(
        &self,
        requested: usize,
        role: RemoteCompilationMode,
    ) -> Result<usize, JitError> {
        if requested <= self.max_number_of_code_caches {
            return Ok(requested);
        }
        if role == RemoteCompilationMode::Server {
            return Err(JitError::Init(format!(
                "{requested} compilation threads requested but at most {} code caches can exist",
                self.max_number_of_code_caches
            )));
        }
        warn!(
            target: "jit::codecache",
            requested,
            max = self.max_number_of_code_caches,
            "reducing compilation threads to the number of code caches"
        );
        Ok(self.max_number_of_code_caches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            is_64bit: true,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_64bit_defaults() {
        let sizing = CacheSizing::compute(&config(), RemoteCompilationMode::None, None).unwrap();
        assert_eq!(sizing.code_cache_kb, 2048);
        assert_eq!(sizing.data_cache_kb, 2048);
        assert_eq!(sizing.code_cache_total_kb, 256 * 1024);
        assert_eq!(sizing.max_number_of_code_caches, 128);
        assert_eq!(sizing.num_code_caches_at_startup, 4);
        assert_eq!(sizing.high_occupancy_threshold_bytes, 80 * (256 * 1024 * 1024 / 100));
    }

    #[test]
    fn test_server_defaults() {
        let sizing = CacheSizing::compute(&config(), RemoteCompilationMode::Server, None).unwrap();
        assert_eq!(sizing.code_cache_kb, 1024);
        assert_eq!(sizing.data_cache_kb, 1024);
    }

    #[test]
    fn test_small_request_raised_to_minimum() {
        let cfg = CacheConfig {
            code_cache_kb: Some(16),
            ..config()
        };
        let sizing = CacheSizing::compute(&cfg, RemoteCompilationMode::None, None).unwrap();
        assert_eq!(sizing.code_cache_kb, MIN_CODE_CACHE_KB);
    }

    #[test]
    fn test_large_request_capped_unless_aot() {
        let cfg = CacheConfig {
            code_cache_kb: Some(65536),
            ..config()
        };
        let sizing = CacheSizing::compute(&cfg, RemoteCompilationMode::None, None).unwrap();
        assert_eq!(sizing.code_cache_kb, MAX_CODE_CACHE_KB);

        let aot = CacheConfig {
            code_cache_kb: Some(65536),
            aot_only: true,
            ..config()
        };
        let sizing = CacheSizing::compute(&aot, RemoteCompilationMode::None, None).unwrap();
        assert_eq!(sizing.code_cache_kb, 65536);
        assert_eq!(sizing.max_number_of_code_caches, 1);
        assert_eq!(sizing.num_code_caches_at_startup, 1);
    }

    #[test]
    fn test_zero_data_cache_is_fatal() {
        let cfg = CacheConfig {
            data_cache_kb: Some(0),
            ..config()
        };
        assert_eq!(
            CacheSizing::compute(&cfg, RemoteCompilationMode::None, None),
            Err(JitError::DataCacheTooSmall(0))
        );
    }

    #[test]
    fn test_total_below_minimum_is_fatal() {
        let cfg = CacheConfig {
            code_cache_total_kb: Some(64),
            ..config()
        };
        assert!(matches!(
            CacheSizing::compute(&cfg, RemoteCompilationMode::None, None),
            Err(JitError::CodeCacheUnavailable { .. })
        ));
    }

    #[test]
    fn test_low_physical_memory_shrinks_total() {
        let free = 32 * 1024 * 1024;
        let sizing =
            CacheSizing::compute(&config(), RemoteCompilationMode::None, Some(free)).unwrap();
        assert_eq!(sizing.code_cache_total_kb, 16 * 1024);
        assert_eq!(sizing.max_number_of_code_caches, 8);
    }

    #[test]
    fn test_consolidated_single_cache() {
        let cfg = CacheConfig {
            consolidated: true,
            code_cache_total_kb: Some(8192),
            ..config()
        };
        let sizing = CacheSizing::compute(&cfg, RemoteCompilationMode::None, None).unwrap();
        assert_eq!(sizing.code_cache_kb, 2048);
        assert_eq!(sizing.max_number_of_code_caches, 1);
        assert_eq!(sizing.num_code_caches_at_startup, 1);
        assert_eq!(sizing.segment_bytes(), 8192 * 1024);
    }

    #[test]
    fn test_consolidated_keeps_segment_clamp() {
        let cfg = CacheConfig {
            consolidated: true,
            ..config()
        };
        let sizing = CacheSizing::compute(&cfg, RemoteCompilationMode::None, None).unwrap();
        assert!(sizing.code_cache_kb <= MAX_CODE_CACHE_KB);
        assert_eq!(sizing.code_cache_total_kb, 256 * 1024);
        assert_eq!(sizing.segment_bytes(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_thread_cap() {
        let cfg = CacheConfig {
            code_cache_total_kb: Some(4096),
            ..config()
        };
        let sizing = CacheSizing::compute(&cfg, RemoteCompilationMode::None, None).unwrap();
        assert_eq!(sizing.max_number_of_code_caches, 2);
        assert_eq!(sizing.cap_compilation_threads(7, RemoteCompilationMode::None), Ok(2));
        assert!(sizing.cap_compilation_threads(7, RemoteCompilationMode::Server).is_err());
        assert_eq!(sizing.cap_compilation_threads(1, RemoteCompilationMode::Server), Ok(1));
    }
}
