//! Runtime configuration
//!
//! Every section has defaults, so a TOML file only needs to name what it
//! overrides:
//!
//! ```toml
//! [cache]
//! code_cache_kb = 4096
//!
//! [remote]
//! mode = "client"
//! address = "jit-server.internal"
//! ```

use crate::error::ConfigError;
use crate::hotness::OptLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Role of this process with respect to remote compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteCompilationMode {
    #[default]
    None,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JitConfig {
    pub cache: CacheConfig,
    pub compilation: CompilationConfig,
    pub sampler: SamplerConfig,
    pub remote: RemoteConfig,
}

/// Code and data cache sizing. `None` means "platform default".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub code_cache_kb: Option<usize>,
    pub data_cache_kb: Option<usize>,
    pub code_cache_total_kb: Option<usize>,
    pub data_cache_total_kb: Option<usize>,
    pub num_code_caches_at_startup: Option<usize>,
    /// One code cache spanning the whole total
    pub consolidated: bool,
    pub allow_grow: bool,
    /// Percentage of the code cache total above which low-priority
    /// compilations are declined
    pub high_code_cache_occupancy_pct: u32,
    /// Free space below which the code cache counts as almost exhausted
    pub low_code_cache_threshold_kb: usize,
    /// Below this much free physical memory the code cache total is shrunk
    pub low_physical_memory_mb: u64,
    /// Only ahead-of-time code is produced
    pub aot_only: bool,
    pub is_64bit: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            code_cache_kb: None,
            data_cache_kb: None,
            code_cache_total_kb: None,
            data_cache_total_kb: None,
            num_code_caches_at_startup: None,
            consolidated: false,
            allow_grow: true,
            high_code_cache_occupancy_pct: 80,
            low_code_cache_threshold_kb: 256,
            low_physical_memory_mb: 64,
            aot_only: false,
            is_64bit: cfg!(target_pointer_width = "64"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationConfig {
    /// Defaults to the number of CPUs minus one, clamped to `[1, 7]`
    pub num_compilation_threads: Option<usize>,
    pub max_queue_size: usize,
    pub async_compilation: bool,
    pub initial_opt_level: OptLevel,
    /// Initial level for methods with backward branches
    pub initial_opt_level_loopy: OptLevel,
    /// Allow profiling bodies for very hot methods
    pub enable_profiling: bool,
    /// First-time compilations are deferred until this many seconds after
    /// startup
    pub compilation_delay_time_secs: u64,
    pub plan_pool_capacity: usize,
    /// Samples in a compiled body that trigger an upgrade
    pub jitted_sample_recompile_threshold: u32,
    pub interpreter_sample_threshold: i32,
    pub interpreter_sample_divisor: i32,
    pub interpreter_sample_threshold_startup: i32,
    pub interpreter_sample_divisor_startup: i32,
    /// Divisor applied to sampled methods with loops above the threshold
    pub loopy_method_division_factor: i32,
    /// Startup hints also drive the class-load phase
    pub strict_startup_hints: bool,
    pub enable_diagnostic_thread: bool,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            num_compilation_threads: None,
            max_queue_size: 10_000,
            async_compilation: true,
            initial_opt_level: OptLevel::Warm,
            initial_opt_level_loopy: OptLevel::Warm,
            enable_profiling: true,
            compilation_delay_time_secs: 0,
            plan_pool_capacity: 4096,
            jitted_sample_recompile_threshold: 30,
            interpreter_sample_threshold: 300,
            interpreter_sample_divisor: 16,
            interpreter_sample_threshold_startup: 3000,
            interpreter_sample_divisor_startup: 16,
            loopy_method_division_factor: 16,
            strict_startup_hints: false,
            enable_diagnostic_thread: true,
        }
    }
}

impl CompilationConfig {
    pub fn compilation_threads(&self) -> usize {
        self.num_compilation_threads
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1).clamp(1, 7))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub enabled: bool,
    pub sampling_frequency_ms: u64,
    pub idle_sampling_frequency_ms: u64,
    pub deep_idle_sampling_frequency_ms: u64,
    pub wait_time_to_enter_idle_ms: u64,
    pub wait_time_to_enter_deep_idle_ms: u64,
    /// First-time compilations in one sampling interval that pull the
    /// sampler out of IDLE
    pub first_time_compilations_to_exit_idle: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_frequency_ms: 10,
            idle_sampling_frequency_ms: 1_000,
            deep_idle_sampling_frequency_ms: 100_000,
            wait_time_to_enter_idle_ms: 5_000,
            wait_time_to_enter_deep_idle_ms: 50_000,
            first_time_compilations_to_exit_idle: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Roots used by the client to verify the server
    pub ca_path: Option<PathBuf>,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub mode: RemoteCompilationMode,
    pub address: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub metrics_port: Option<u16>,
    pub statistics_interval_secs: Option<u64>,
    pub use_aot_cache: bool,
    pub aot_cache_file: Option<PathBuf>,
    pub rom_class_sharing: bool,
    /// Compile locally when the server cannot be reached
    pub local_fallback: bool,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Client sessions idle for longer are purged by the server
    pub old_session_purge_secs: u64,
    pub tls: Option<TlsConfig>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            mode: RemoteCompilationMode::None,
            address: "localhost".to_string(),
            port: 38400,
            timeout_ms: 30_000,
            metrics_port: None,
            statistics_interval_secs: None,
            use_aot_cache: false,
            aot_cache_file: None,
            rom_class_sharing: true,
            local_fallback: true,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
            old_session_purge_secs: 90 * 60,
            tls: None,
        }
    }
}

impl JitConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: JitConfig = toml::from_str(text)
            .map_err(|e| ConfigError::Parse(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.high_code_cache_occupancy_pct > 100 {
            return Err(ConfigError::OutOfRange {
                field: "cache.high_code_cache_occupancy_pct",
                reason: format!("{} > 100", self.cache.high_code_cache_occupancy_pct),
            });
        }
        if self.compilation.num_compilation_threads == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "compilation.num_compilation_threads",
                reason: "at least one compilation thread is required".to_string(),
            });
        }
        if self.compilation.interpreter_sample_divisor < 1
            || self.compilation.interpreter_sample_divisor_startup < 1
            || self.compilation.loopy_method_division_factor < 1
        {
            return Err(ConfigError::OutOfRange {
                field: "compilation.interpreter_sample_divisor",
                reason: "divisor must be positive".to_string(),
            });
        }
        let frequencies = [
            ("sampler.sampling_frequency_ms", self.sampler.sampling_frequency_ms),
            ("sampler.idle_sampling_frequency_ms", self.sampler.idle_sampling_frequency_ms),
            (
                "sampler.deep_idle_sampling_frequency_ms",
                self.sampler.deep_idle_sampling_frequency_ms,
            ),
        ];
        if let Some((field, _)) = frequencies.into_iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::OutOfRange {
                field,
                reason: "must be positive".to_string(),
            });
        }
        if self.remote.retry_base_ms > self.remote.retry_max_ms {
            return Err(ConfigError::OutOfRange {
                field: "remote.retry_base_ms",
                reason: "must not exceed remote.retry_max_ms".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_server(&self) -> bool {
        self.remote.mode == RemoteCompilationMode::Server
    }

    pub fn is_client(&self) -> bool {
        self.remote.mode == RemoteCompilationMode::Client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = JitConfig::from_toml(
            r#"
            [cache]
            code_cache_kb = 4096

            [remote]
            mode = "client"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.code_cache_kb, Some(4096));
        assert!(config.cache.allow_grow);
        assert!(config.is_client());
        assert_eq!(config.sampler.first_time_compilations_to_exit_idle, 25);
    }

    #[test]
    fn test_validate_rejects_bad_percentage() {
        let mut config = JitConfig::default();
        config.cache.high_code_cache_occupancy_pct = 150;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "cache.high_code_cache_occupancy_pct", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_idle_frequencies() {
        let mut config = JitConfig::default();
        config.sampler.idle_sampling_frequency_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "sampler.idle_sampling_frequency_ms", .. })
        ));

        let mut config = JitConfig::default();
        config.sampler.deep_idle_sampling_frequency_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "sampler.deep_idle_sampling_frequency_ms", .. })
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = JitConfig::default();
        config.compilation.num_compilation_threads = Some(3);
        let text = config.to_toml().unwrap();
        assert_eq!(JitConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jit.toml");
        std::fs::write(&path, "[sampler]\nsampling_frequency_ms = 20\n").unwrap();
        let config = JitConfig::from_file(&path).unwrap();
        assert_eq!(config.sampler.sampling_frequency_ms, 20);
        assert!(JitConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_default_thread_count_bounds() {
        let threads = CompilationConfig::default().compilation_threads();
        assert!((1..=7).contains(&threads));
    }
}
