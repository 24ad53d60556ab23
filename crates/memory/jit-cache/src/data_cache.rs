//! Data cache for compiled-body metadata
//!
//! Segments of `data_cache_kb` are added on demand until the data cache total
//! is reached. Allocation bumps within the newest segment that fits; a
//! segment whose live bytes drop to zero is reset and reused.

use crate::error::{CacheError, CacheResult};
use crate::sizing::CacheSizing;
use parking_lot::Mutex;
use tracing::{debug, warn};

const DATA_ALIGNMENT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAllocation {
    pub segment: usize,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug)]
struct DataSegment {
    size: usize,
    bump: usize,
    live: usize,
}

#[derive(Debug)]
pub struct DataCacheManager {
    segment_bytes: usize,
    max_segments: usize,
    segments: Mutex<Vec<DataSegment>>,
}

impl DataCacheManager {
    pub fn new(sizing: &CacheSizing) -> Self {
        let segment_bytes = sizing.data_cache_bytes();
        let max_segments = (sizing.data_cache_total_kb / sizing.data_cache_kb.max(1)).max(1);
        Self {
            segment_bytes,
            max_segments,
            segments: Mutex::new(vec![DataSegment {
                size: segment_bytes,
                bump: 0,
                live: 0,
            }]),
        }
    }

    pub fn allocate(&self, size: usize) -> CacheResult<DataAllocation> {
        let size = size.max(1).div_ceil(DATA_ALIGNMENT) * DATA_ALIGNMENT;
        if size > self.segment_bytes {
            warn!(target: "jit::codecache", size, "metadata larger than a data cache segment");
            return Err(CacheError::DataCacheFull { requested: size });
        }
        let mut segments = self.segments.lock();
        let found = segments
            .iter()
            .position(|s| s.size - s.bump >= size);
        let index = match found {
            Some(index) => index,
            None if segments.len() < self.max_segments => {
                segments.push(DataSegment {
                    size: self.segment_bytes,
                    bump: 0,
                    live: 0,
                });
                debug!(target: "jit::codecache", segments = segments.len(), "data cache grown");
                segments.len() - 1
            }
            None => {
                warn!(target: "jit::codecache", size, "data cache exhausted");
                return Err(CacheError::DataCacheFull { requested: size });
            }
        };
        let segment = &mut segments[index];
        let offset = segment.bump;
        segment.bump += size;
        segment.live += size;
        Ok(DataAllocation {
            segment: index,
            offset,
            size,
        })
    }

    pub fn free(&self, allocation: &DataAllocation) {
        let mut segments = self.segments.lock();
        if let Some(segment) = segments.get_mut(allocation.segment) {
            segment.live = segment.live.saturating_sub(allocation.size);
            if segment.live == 0 {
                segment.bump = 0;
            }
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.segments.lock().iter().map(|s| s.live).sum()
    }

    pub fn num_segments(&self) -> usize {
        self.segments.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizing(segment_kb: usize, total_kb: usize) -> CacheSizing {
        CacheSizing {
            code_cache_kb: 128,
            data_cache_kb: segment_kb,
            code_cache_total_kb: 128,
            data_cache_total_kb: total_kb,
            max_number_of_code_caches: 1,
            num_code_caches_at_startup: 1,
            high_occupancy_threshold_bytes: 0,
            low_code_cache_threshold_bytes: 0,
            consolidated: false,
            allow_grow: true,
        }
    }

    #[test]
    fn test_grows_then_exhausts() {
        let data = DataCacheManager::new(&sizing(1, 2));
        data.allocate(1000).unwrap();
        let second = data.allocate(1000).unwrap();
        assert_eq!(second.segment, 1);
        assert_eq!(data.num_segments(), 2);
        assert_eq!(
            data.allocate(1000),
            Err(CacheError::DataCacheFull { requested: 1000 })
        );
    }

    #[test]
    fn test_empty_segment_reused() {
        let data = DataCacheManager::new(&sizing(1, 1));
        let a = data.allocate(512).unwrap();
        let b = data.allocate(512).unwrap();
        data.free(&a);
        assert!(data.allocate(512).is_err());
        data.free(&b);
        assert_eq!(data.used_bytes(), 0);
        assert_eq!(data.allocate(1024).unwrap().offset, 0);
    }
}
