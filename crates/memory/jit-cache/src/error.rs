use jit_core::CompilationErrorCode;
use thiserror::Error;

/// Cache admission failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The reserved code cache cannot fit the body. `recoverable` is set when
    /// another cache is (or became) available, so a retry may succeed.
    #[error("code cache {cache_id} cannot fit {requested} bytes (recoverable: {recoverable})")]
    CodeCacheFull {
        cache_id: usize,
        requested: usize,
        recoverable: bool,
    },

    #[error("no code cache available for reservation")]
    ReservationFailure,

    #[error("data cache exhausted allocating {requested} bytes")]
    DataCacheFull { requested: usize },

    #[error("reservation for cache {0} is not held")]
    NotReserved(usize),
}

impl From<&CacheError> for CompilationErrorCode {
    fn from(error: &CacheError) -> Self {
        match error {
            CacheError::CodeCacheFull {
                recoverable: true, ..
            } => CompilationErrorCode::RecoverableCodeCacheError,
            CacheError::CodeCacheFull { .. } => CompilationErrorCode::CodeCacheError,
            CacheError::ReservationFailure => CompilationErrorCode::CodeReservationFailure,
            CacheError::DataCacheFull { .. } => CompilationErrorCode::DataCacheError,
            CacheError::NotReserved(_) => CompilationErrorCode::IllegalCodeCacheSwitch,
        }
    }
}

impl From<CacheError> for CompilationErrorCode {
    fn from(error: CacheError) -> Self {
        CompilationErrorCode::from(&error)
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
