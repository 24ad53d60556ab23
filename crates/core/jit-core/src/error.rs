//! Compilation outcome codes and runtime error types
//!
//! Every compile attempt ends with exactly one [`CompilationErrorCode`]. The
//! enum is closed: the remote-compilation variants are always present so that
//! callers can match exhaustively regardless of how the runtime is configured.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat outcome code of a single compilation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompilationErrorCode {
    Ok = 0,
    Failure = 1,
    RestrictionIlNodes = 2,
    RestrictionRecDepth = 3,
    RestrictedMethod = 4,
    ExcessiveComplexity = 5,
    NotNeeded = 6,
    Suspended = 7,
    ExcessiveSize = 8,
    Interrupted = 9,
    MetaDataFailure = 10,
    InProgress = 11,
    ChTableCommitFailure = 12,
    MaxCallerIndexExceeded = 13,
    KilledByClassReplacement = 14,
    HeapLimitExceeded = 15,
    NeededAtHigherLevel = 16,
    AotTrampolineReloFailure = 17,
    AotPicTrampolineReloFailure = 18,
    AotCacheFullReloFailure = 19,
    CodeReservationFailure = 20,
    AotHasInvokehandle = 21,
    TrampolineFailure = 22,
    RecoverableTrampolineFailure = 23,
    IlGenFailure = 24,
    IllegalCodeCacheSwitch = 25,
    NullSubstituteCodeCache = 26,
    CodeMemoryExhausted = 27,
    GcrPatchFailure = 28,
    LambdaEnforceScorching = 29,
    InternalPointerExceedLimit = 30,
    AotRelocationInterrupted = 31,
    AotClassChainPersistenceFailure = 32,
    LowPhysicalMemory = 33,
    DataCacheError = 34,
    CodeCacheError = 35,
    RecoverableCodeCacheError = 36,
    AotHasInvokeVarHandle = 37,
    FsdHasInvokeHandle = 38,
    VirtualAddressExhaustion = 39,
    EnforceProfiling = 40,
    SymbolValidationManagerFailure = 41,
    AotNoSupportForAotFailure = 42,
    IlGenUnsupportedValueTypeOperationFailure = 43,
    AotRelocationRecordGenerationFailure = 44,
    AotPatchedCpConstant = 45,
    AotHasInvokeSpecialInterface = 46,
    RelocationFailure = 47,
    AotThunkPersistenceFailure = 48,
    StreamFailure = 49,
    StreamLostMessage = 50,
    StreamMessageTypeMismatch = 51,
    StreamVersionIncompatible = 52,
    StreamInterrupted = 53,
    AotCacheDeserializationFailure = 54,
    AotDeserializerReset = 55,
    AotCachePersistenceFailure = 56,
}

impl CompilationErrorCode {
    /// First code reserved for remote-compilation failures.
    pub const FIRST_REMOTE_FAILURE: u8 = 49;

    pub const ALL: [CompilationErrorCode; 57] = [
        Self::Ok,
        Self::Failure,
        Self::RestrictionIlNodes,
        Self::RestrictionRecDepth,
        Self::RestrictedMethod,
        Self::ExcessiveComplexity,
        Self::NotNeeded,
        Self::Suspended,
        Self::ExcessiveSize,
        Self::Interrupted,
        Self::MetaDataFailure,
        Self::InProgress,
        Self::ChTableCommitFailure,
        Self::MaxCallerIndexExceeded,
        Self::KilledByClassReplacement,
        Self::HeapLimitExceeded,
        Self::NeededAtHigherLevel,
        Self::AotTrampolineReloFailure,
        Self::AotPicTrampolineReloFailure,
        Self::AotCacheFullReloFailure,
        Self::CodeReservationFailure,
        Self::AotHasInvokehandle,
        Self::TrampolineFailure,
        Self::RecoverableTrampolineFailure,
        Self::IlGenFailure,
        Self::IllegalCodeCacheSwitch,
        Self::NullSubstituteCodeCache,
        Self::CodeMemoryExhausted,
        Self::GcrPatchFailure,
        Self::LambdaEnforceScorching,
        Self::InternalPointerExceedLimit,
        Self::AotRelocationInterrupted,
        Self::AotClassChainPersistenceFailure,
        Self::LowPhysicalMemory,
        Self::DataCacheError,
        Self::CodeCacheError,
        Self::RecoverableCodeCacheError,
        Self::AotHasInvokeVarHandle,
        Self::FsdHasInvokeHandle,
        Self::VirtualAddressExhaustion,
        Self::EnforceProfiling,
        Self::SymbolValidationManagerFailure,
        Self::AotNoSupportForAotFailure,
        Self::IlGenUnsupportedValueTypeOperationFailure,
        Self::AotRelocationRecordGenerationFailure,
        Self::AotPatchedCpConstant,
        Self::AotHasInvokeSpecialInterface,
        Self::RelocationFailure,
        Self::AotThunkPersistenceFailure,
        Self::StreamFailure,
        Self::StreamLostMessage,
        Self::StreamMessageTypeMismatch,
        Self::StreamVersionIncompatible,
        Self::StreamInterrupted,
        Self::AotCacheDeserializationFailure,
        Self::AotDeserializerReset,
        Self::AotCachePersistenceFailure,
    ];

    /// Numeric value used on the wire and in verbose logs.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    /// Name as printed in verbose compilation logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "compilationOK",
            Self::Failure => "compilationFailure",
            Self::RestrictionIlNodes => "compilationRestrictionILNodes",
            Self::RestrictionRecDepth => "compilationRestrictionRecDepth",
            Self::RestrictedMethod => "compilationRestrictedMethod",
            Self::ExcessiveComplexity => "compilationExcessiveComplexity",
            Self::NotNeeded => "compilationNotNeeded",
            Self::Suspended => "compilationSuspended",
            Self::ExcessiveSize => "compilationExcessiveSize",
            Self::Interrupted => "compilationInterrupted",
            Self::MetaDataFailure => "compilationMetaDataFailure",
            Self::InProgress => "compilationInProgress",
            Self::ChTableCommitFailure => "compilationCHTableCommitFailure",
            Self::MaxCallerIndexExceeded => "compilationMaxCallerIndexExceeded",
            Self::KilledByClassReplacement => "compilationKilledByClassReplacement",
            Self::HeapLimitExceeded => "compilationHeapLimitExceeded",
            Self::NeededAtHigherLevel => "compilationNeededAtHigherLevel",
            Self::AotTrampolineReloFailure => "compilationAotTrampolineReloFailure",
            Self::AotPicTrampolineReloFailure => "compilationAotPicTrampolineReloFailure",
            Self::AotCacheFullReloFailure => "compilationAotCacheFullReloFailure",
            Self::CodeReservationFailure => "compilationCodeReservationFailure",
            Self::AotHasInvokehandle => "compilationAotHasInvokehandle",
            Self::TrampolineFailure => "compilationTrampolineFailure",
            Self::RecoverableTrampolineFailure => "compilationRecoverableTrampolineFailure",
            Self::IlGenFailure => "compilationILGenFailure",
            Self::IllegalCodeCacheSwitch => "compilationIllegalCodeCacheSwitch",
            Self::NullSubstituteCodeCache => "compilationNullSubstituteCodeCache",
            Self::CodeMemoryExhausted => "compilationCodeMemoryExhausted",
            Self::GcrPatchFailure => "compilationGCRPatchFailure",
            Self::LambdaEnforceScorching => "compilationLambdaEnforceScorching",
            Self::InternalPointerExceedLimit => "compilationInternalPointerExceedLimit",
            Self::AotRelocationInterrupted => "compilationAotRelocationInterrupted",
            Self::AotClassChainPersistenceFailure => "compilationAotClassChainPersistenceFailure",
            Self::LowPhysicalMemory => "compilationLowPhysicalMemory",
            Self::DataCacheError => "compilationDataCacheError",
            Self::CodeCacheError => "compilationCodeCacheError",
            Self::RecoverableCodeCacheError => "compilationRecoverableCodeCacheError",
            Self::AotHasInvokeVarHandle => "compilationAotHasInvokeVarHandle",
            Self::FsdHasInvokeHandle => "compilationFSDHasInvokeHandle",
            Self::VirtualAddressExhaustion => "compilationVirtualAddressExhaustion",
            Self::EnforceProfiling => "compilationEnforceProfiling",
            Self::SymbolValidationManagerFailure => "compilationSymbolValidationManagerFailure",
            Self::AotNoSupportForAotFailure => "compilationAOTNoSupportForAOTFailure",
            Self::IlGenUnsupportedValueTypeOperationFailure => {
                "compilationILGenUnsupportedValueTypeOperationFailure"
            }
            Self::AotRelocationRecordGenerationFailure => {
                "compilationAOTRelocationRecordGenerationFailure"
            }
            Self::AotPatchedCpConstant => "compilationAotPatchedCPConstant",
            Self::AotHasInvokeSpecialInterface => "compilationAotHasInvokeSpecialInterface",
            Self::RelocationFailure => "compilationRelocationFailure",
            Self::AotThunkPersistenceFailure => "compilationAOTThunkPersistenceFailure",
            Self::StreamFailure => "compilationStreamFailure",
            Self::StreamLostMessage => "compilationStreamLostMessage",
            Self::StreamMessageTypeMismatch => "compilationStreamMessageTypeMismatch",
            Self::StreamVersionIncompatible => "compilationStreamVersionIncompatible",
            Self::StreamInterrupted => "compilationStreamInterrupted",
            Self::AotCacheDeserializationFailure => "aotCacheDeserializationFailure",
            Self::AotDeserializerReset => "aotDeserializerReset",
            Self::AotCachePersistenceFailure => "compilationAOTCachePersistenceFailure",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Failures that are worth one more attempt with a fresh code cache
    /// reservation or, for remote compiles, a fresh connection.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::RecoverableCodeCacheError
                | Self::RecoverableTrampolineFailure
                | Self::AotDeserializerReset
        ) || self.is_stream_failure()
    }

    /// Transport failures of a remote compilation.
    pub fn is_stream_failure(self) -> bool {
        matches!(
            self,
            Self::StreamFailure
                | Self::StreamLostMessage
                | Self::StreamMessageTypeMismatch
                | Self::StreamVersionIncompatible
                | Self::StreamInterrupted
        )
    }

    /// Outcomes after which no further compilation is attempted process-wide.
    pub fn disables_compilation(self) -> bool {
        matches!(
            self,
            Self::CodeCacheError | Self::DataCacheError | Self::CodeMemoryExhausted
        )
    }
}

impl std::fmt::Display for CompilationErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors surfaced by runtime initialization and administrative operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("JIT initialization failed: {0}")]
    Init(String),

    #[error("code cache of {requested_kb} KB cannot be allocated (minimum {minimum_kb} KB)")]
    CodeCacheUnavailable { requested_kb: usize, minimum_kb: usize },

    #[error("data cache size must be at least 1 KB, got {0} KB")]
    DataCacheTooSmall(usize),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("sampler thread failed to start: {0}")]
    SamplerStart(String),

    #[error("compilation thread {id} failed to start: {reason}")]
    WorkerStart { id: usize, reason: String },

    #[error("runtime is shut down")]
    ShutDown,
}

/// Configuration loading and validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

pub type JitResult<T> = Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminants_match_table_position() {
        for (index, code) in CompilationErrorCode::ALL.iter().enumerate() {
            assert_eq!(usize::from(code.as_u8()), index, "{code}");
            assert_eq!(CompilationErrorCode::from_u8(code.as_u8()), Some(*code));
        }
        assert_eq!(CompilationErrorCode::from_u8(57), None);
    }

    #[test]
    fn test_remote_range() {
        for code in CompilationErrorCode::ALL {
            let remote = code.as_u8() >= CompilationErrorCode::FIRST_REMOTE_FAILURE;
            if code.is_stream_failure() {
                assert!(remote);
            }
        }
        assert_eq!(
            CompilationErrorCode::StreamFailure.as_u8(),
            CompilationErrorCode::FIRST_REMOTE_FAILURE
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(CompilationErrorCode::RecoverableCodeCacheError.is_recoverable());
        assert!(CompilationErrorCode::StreamFailure.is_recoverable());
        assert!(!CompilationErrorCode::CodeCacheError.is_recoverable());
        assert!(CompilationErrorCode::CodeCacheError.disables_compilation());
        assert!(!CompilationErrorCode::Ok.disables_compilation());
    }

    #[test]
    fn test_names() {
        assert_eq!(CompilationErrorCode::Ok.to_string(), "compilationOK");
        assert_eq!(
            CompilationErrorCode::AotCachePersistenceFailure.name(),
            "compilationAOTCachePersistenceFailure"
        );
    }
}
