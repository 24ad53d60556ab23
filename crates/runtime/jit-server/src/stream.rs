//! Framed message stream over a byte transport
//!
//! Used by both ends of a connection. Any transport failure surfaces as a
//! [`StreamError`], which callers turn into a retry signal for the
//! compilation (see the `From` impl into [`CompilationErrorCode`]).

use crate::protocol::{
    FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN, MessageType, ProtocolVersion, decode_payload,
    encode_payload,
};
use jit_core::CompilationErrorCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream failure: {0}")]
    Io(String),

    #[error("stream timed out or was interrupted")]
    Interrupted,

    #[error("message lost or received out of order")]
    LostMessage,

    #[error("expected {expected:?}, received {received:?}")]
    TypeMismatch {
        expected: MessageType,
        received: MessageType,
    },

    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("incompatible protocol version: local {local}, remote {remote}")]
    VersionIncompatible {
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },

    #[error("peer closed the connection")]
    ConnectionTerminated,

    #[error("client session terminated")]
    ClientSessionTerminated,

    #[error("payload encoding failed: {0}")]
    Codec(String),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl From<std::io::Error> for StreamError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
                StreamError::Interrupted
            }
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                StreamError::ConnectionTerminated
            }
            _ => StreamError::Io(error.to_string()),
        }
    }
}

impl From<&StreamError> for CompilationErrorCode {
    fn from(error: &StreamError) -> Self {
        match error {
            StreamError::Interrupted => CompilationErrorCode::StreamInterrupted,
            StreamError::LostMessage => CompilationErrorCode::StreamLostMessage,
            StreamError::TypeMismatch { .. } | StreamError::UnknownMessageType(_) => {
                CompilationErrorCode::StreamMessageTypeMismatch
            }
            StreamError::VersionIncompatible { .. } => {
                CompilationErrorCode::StreamVersionIncompatible
            }
            StreamError::Io(_)
            | StreamError::ConnectionTerminated
            | StreamError::ClientSessionTerminated
            | StreamError::Codec(_)
            | StreamError::FrameTooLarge(_)
            | StreamError::Tls(_) => CompilationErrorCode::StreamFailure,
        }
    }
}

impl From<StreamError> for CompilationErrorCode {
    fn from(error: StreamError) -> Self {
        CompilationErrorCode::from(&error)
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Byte transport a stream runs over.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: ProtocolVersion,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn decode<T: DeserializeOwned>(&self) -> StreamResult<T> {
        decode_payload(&self.payload).map_err(|e| StreamError::Codec(e.to_string()))
    }
}

pub struct MessageStream {
    transport: Box<dyn Transport>,
    messages_sent: u64,
    messages_received: u64,
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("messages_sent", &self.messages_sent)
            .field("messages_received", &self.messages_received)
            .finish()
    }
}

impl MessageStream {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Plain TCP stream with read/write timeouts applied.
    pub fn from_tcp(stream: TcpStream, timeout: Option<Duration>) -> StreamResult<Self> {
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(Box::new(stream)))
    }

    pub fn write_message<T: Serialize>(
        &mut self,
        message_type: MessageType,
        body: &T,
    ) -> StreamResult<()> {
        let payload = encode_payload(body).map_err(|e| StreamError::Codec(e.to_string()))?;
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| StreamError::FrameTooLarge(u32::MAX))?;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(StreamError::FrameTooLarge(payload_len));
        }
        let header = FrameHeader {
            version: ProtocolVersion::CURRENT,
            message_type: message_type as u16,
            payload_len,
        };
        self.transport.write_all(&header.encode())?;
        self.transport.write_all(&payload)?;
        self.transport.flush()?;
        self.messages_sent += 1;
        trace!(target: "jit::server", ?message_type, payload_len, "message sent");
        Ok(())
    }

    /// Read the next frame. A major/minor version mismatch is reported
    /// before the payload is interpreted.
    pub fn read_frame(&mut self) -> StreamResult<Frame> {
        let mut header = [0u8; HEADER_LEN];
        self.transport.read_exact(&mut header)?;
        let header = FrameHeader::decode(&header);
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(StreamError::FrameTooLarge(header.payload_len));
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        self.transport.read_exact(&mut payload)?;
        if !ProtocolVersion::CURRENT.is_compatible(&header.version) {
            return Err(StreamError::VersionIncompatible {
                local: ProtocolVersion::CURRENT,
                remote: header.version,
            });
        }
        let message_type = MessageType::from_u16(header.message_type)
            .ok_or(StreamError::UnknownMessageType(header.message_type))?;
        self.messages_received += 1;
        trace!(target: "jit::server", ?message_type, len = header.payload_len, "message received");
        Ok(Frame {
            version: header.version,
            message_type,
            payload,
        })
    }

    /// Read a frame that must be of type `expected`. Termination messages
    /// from the peer are reported as such rather than as mismatches.
    pub fn read_expect<T: DeserializeOwned>(&mut self, expected: MessageType) -> StreamResult<T> {
        let frame = self.read_frame()?;
        match frame.message_type {
            received if received == expected => frame.decode(),
            MessageType::ConnectionTerminate => Err(StreamError::ConnectionTerminated),
            MessageType::ClientSessionTerminate => Err(StreamError::ClientSessionTerminated),
            received => Err(StreamError::TypeMismatch { expected, received }),
        }
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{CompilationFailure, FrameHeader};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use parking_lot::Mutex;

    /// In-memory duplex pipe end.
    #[derive(Clone, Default)]
    pub(crate) struct Pipe {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<VecDeque<u8>>>,
    }

    impl Pipe {
        pub(crate) fn pair() -> (Pipe, Pipe) {
            let a = Arc::new(Mutex::new(VecDeque::new()));
            let b = Arc::new(Mutex::new(VecDeque::new()));
            (
                Pipe {
                    inbound: Arc::clone(&a),
                    outbound: Arc::clone(&b),
                },
                Pipe {
                    inbound: b,
                    outbound: a,
                },
            )
        }
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut inbound = self.inbound.lock();
            let n = buf.len().min(inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.lock().extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_then_read_expected() {
        let (a, b) = Pipe::pair();
        let mut client = MessageStream::new(Box::new(a));
        let mut server = MessageStream::new(Box::new(b));
        let failure = CompilationFailure {
            error: CompilationErrorCode::ExcessiveComplexity,
        };
        client
            .write_message(MessageType::CompilationFailure, &failure)
            .unwrap();
        let got: CompilationFailure = server.read_expect(MessageType::CompilationFailure).unwrap();
        assert_eq!(got, failure);
        assert_eq!(client.messages_sent(), 1);
        assert_eq!(server.messages_received(), 1);
    }

    #[test]
    fn test_type_mismatch() {
        let (a, b) = Pipe::pair();
        let mut client = MessageStream::new(Box::new(a));
        let mut server = MessageStream::new(Box::new(b));
        client.write_message(MessageType::GetUnloadedClasses, &()).unwrap();
        let err = server
            .read_expect::<()>(MessageType::CompilationRequest)
            .unwrap_err();
        assert_eq!(
            CompilationErrorCode::from(&err),
            CompilationErrorCode::StreamMessageTypeMismatch
        );
    }

    #[test]
    fn test_version_mismatch() {
        let (mut a, b) = Pipe::pair();
        let header = FrameHeader {
            version: ProtocolVersion {
                major: 0,
                minor: 1,
                patch: 0,
            },
            message_type: MessageType::CompilationRequest as u16,
            payload_len: 0,
        };
        a.write_all(&header.encode()).unwrap();
        let mut server = MessageStream::new(Box::new(b));
        let err = server.read_frame().unwrap_err();
        assert!(matches!(err, StreamError::VersionIncompatible { .. }));
        assert_eq!(
            CompilationErrorCode::from(err),
            CompilationErrorCode::StreamVersionIncompatible
        );
    }

    #[test]
    fn test_truncated_stream_is_failure() {
        let (mut a, b) = Pipe::pair();
        a.write_all(&[0, 1, 0]).unwrap();
        let mut server = MessageStream::new(Box::new(b));
        let err = server.read_frame().unwrap_err();
        assert_eq!(err, StreamError::ConnectionTerminated);
        assert!(CompilationErrorCode::from(&err).is_stream_failure());
    }

    #[test]
    fn test_termination_reported() {
        let (a, b) = Pipe::pair();
        let mut client = MessageStream::new(Box::new(a));
        let mut server = MessageStream::new(Box::new(b));
        client.write_message(MessageType::ConnectionTerminate, &()).unwrap();
        assert_eq!(
            server.read_expect::<()>(MessageType::CompilationRequest),
            Err(StreamError::ConnectionTerminated)
        );
    }
}
