//! Property tests for cache sizing and segment accounting

use jit_cache::{CacheSizing, CodeCache, MAX_CODE_CACHE_KB, MIN_CODE_CACHE_KB};
use jit_core::{CacheConfig, RemoteCompilationMode};
use proptest::prelude::*;

fn config(
    code_kb: Option<usize>,
    data_kb: Option<usize>,
    total_kb: Option<usize>,
    startup: Option<usize>,
    aot_only: bool,
) -> CacheConfig {
    CacheConfig {
        code_cache_kb: code_kb,
        data_cache_kb: data_kb,
        code_cache_total_kb: total_kb,
        num_code_caches_at_startup: startup,
        aot_only,
        is_64bit: true,
        ..CacheConfig::default()
    }
}

proptest! {
    #[test]
    fn sizing_respects_clamps(
        code_kb in proptest::option::of(1usize..200_000),
        data_kb in proptest::option::of(1usize..100_000),
        total_kb in proptest::option::of(128usize..1_000_000),
        startup in proptest::option::of(1usize..64),
        aot_only in any::<bool>(),
    ) {
        let cfg = config(code_kb, data_kb, total_kb, startup, aot_only);
        let sizing = CacheSizing::compute(&cfg, RemoteCompilationMode::None, None).unwrap();

        prop_assert!(sizing.code_cache_kb >= MIN_CODE_CACHE_KB);
        prop_assert!(sizing.code_cache_kb <= sizing.code_cache_total_kb);
        if !aot_only {
            prop_assert!(sizing.code_cache_kb <= MAX_CODE_CACHE_KB);
            prop_assert_eq!(
                sizing.max_number_of_code_caches,
                (sizing.code_cache_total_kb / sizing.code_cache_kb).max(1)
            );
        } else {
            prop_assert_eq!(sizing.max_number_of_code_caches, 1);
        }
        prop_assert!(sizing.data_cache_kb <= sizing.data_cache_total_kb);
        prop_assert!(sizing.num_code_caches_at_startup >= 1);
        prop_assert!(sizing.num_code_caches_at_startup <= sizing.max_number_of_code_caches);
        prop_assert_eq!(
            sizing.high_occupancy_threshold_bytes,
            80 * (sizing.code_cache_total_kb * 1024 / 100)
        );
    }

    #[test]
    fn code_cache_accounting_is_consistent(
        sizes in proptest::collection::vec((1usize..2048, 0usize..512), 1..40),
        free_mask in proptest::collection::vec(any::<bool>(), 40),
    ) {
        let mut cache = CodeCache::new(0, 0x1_0000_0000, 64 * 1024);
        let mut live = Vec::new();
        for (warm, cold) in sizes {
            if let Some(allocation) = cache.allocate(warm, cold) {
                live.push(allocation);
            }
        }
        let mut expected: usize = live.iter().map(|a| a.total_size()).sum();
        prop_assert_eq!(cache.used_bytes(), expected);

        for (allocation, free) in live.iter().zip(free_mask) {
            if free {
                cache.free(allocation);
                expected -= allocation.total_size();
            }
        }
        prop_assert_eq!(cache.used_bytes(), expected);
        prop_assert!(cache.gap_bytes() <= cache.free_bytes());
    }
}
