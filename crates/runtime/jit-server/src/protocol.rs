//! Wire protocol between compilation clients and the compilation server
//!
//! Every frame is a fixed header followed by a bincode payload:
//!
//! ```text
//! +-------+-------+-------+----------+-------------+-----------------+
//! | major | minor | patch | msg type | payload len | payload         |
//! |  u16  |  u16  |  u16  |   u16    |  u32 (BE)   | bincode (serde) |
//! +-------+-------+-------+----------+-------------+-----------------+
//! ```
//!
//! Peers must agree on major and minor; patch differences are tolerated.

use jit_core::{CompilationErrorCode, CompiledCode, OptLevel, OptimizationPlan, StartPc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAJOR_NUMBER: u16 = 1;
pub const MINOR_NUMBER: u16 = 2;
pub const PATCH_NUMBER: u16 = 0;

pub const HEADER_LEN: usize = 12;
/// Frames above this size are treated as a corrupt stream.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Configuration bits both peers must agree on.
pub mod flags {
    pub const IS_64BIT: u64 = 1 << 0;
    pub const ROM_CLASS_SHARING: u64 = 1 << 1;
    pub const AOT_CACHE: u64 = 1 << 2;

    /// Bits whose values must match between client and server.
    pub const MUST_MATCH: u64 = IS_64BIT;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion {
        major: MAJOR_NUMBER,
        minor: MINOR_NUMBER,
        patch: PATCH_NUMBER,
    };

    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageType {
    ClientGetVersion = 1,
    ServerVersion = 2,
    CompilationRequest = 3,
    CompilationCode = 4,
    CompilationFailure = 5,
    ClientSessionTerminate = 6,
    ConnectionTerminate = 7,
    GetUnloadedClasses = 8,
    AotCacheCatalog = 9,
    Error = 10,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::ClientGetVersion,
            2 => Self::ServerVersion,
            3 => Self::CompilationRequest,
            4 => Self::CompilationCode,
            5 => Self::CompilationFailure,
            6 => Self::ClientSessionTerminate,
            7 => Self::ConnectionTerminate,
            8 => Self::GetUnloadedClasses,
            9 => Self::AotCacheCatalog,
            10 => Self::Error,
            _ => return None,
        })
    }
}

/// Fixed part of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub message_type: u16,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.version.major.to_be_bytes());
        out[2..4].copy_from_slice(&self.version.minor.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.patch.to_be_bytes());
        out[6..8].copy_from_slice(&self.message_type.to_be_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        FrameHeader {
            version: ProtocolVersion {
                major: u16_at(0),
                minor: u16_at(2),
                patch: u16_at(4),
            },
            message_type: u16_at(6),
            payload_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

/// Client greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_id: Uuid,
    pub flags: u64,
}

/// Server reply to [`ClientHello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub version: ProtocolVersion,
    pub flags: u64,
    /// Changes whenever the server (and with it the AOT cache) restarts
    pub server_uid: u64,
}

/// Method identity sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteMethodRef {
    pub class_name: String,
    pub name: String,
    pub signature: String,
    pub has_backward_branches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationRequest {
    pub client_id: Uuid,
    pub seq_no: u32,
    pub method: RemoteMethodRef,
    pub plan: OptimizationPlan,
    pub old_start_pc: Option<StartPc>,
    /// Classes unloaded (or illegally modified) since the previous request
    pub unloaded_classes: Vec<String>,
    pub use_aot_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationResponse {
    pub code: CompiledCode,
    pub opt_level: OptLevel,
    /// Shared AOT cache record the code came from or was stored as
    pub aot_record: Option<u64>,
    pub server_uid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationFailure {
    pub error: CompilationErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: CompilationErrorCode,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTerminate {
    pub client_id: Uuid,
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
}

pub fn decode_payload<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map(|(value, _)| value)
}
