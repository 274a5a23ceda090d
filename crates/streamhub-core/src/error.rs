//! Status codes and error types.

use core::fmt;

/// Status codes carried in `ResponseWithError` and client-result error frames.
///
/// The numbering is identical to gRPC status codes, since peers surface them
/// verbatim to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Map a wire value to a status code. Unrecognized values become `Unknown`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unknown => write!(f, "unknown"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Aborted => write!(f, "aborted"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::DataLoss => write!(f, "data loss"),
            Self::Unauthenticated => write!(f, "unauthenticated"),
        }
    }
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer completed the stream.
    CompletedNormally,
    /// A heartbeat went unacknowledged past its timeout.
    TimedOut,
    /// The read loop hit a transport or framing error.
    Faulted(String),
    /// The local side disposed the session.
    Disposed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompletedNormally => write!(f, "completed normally"),
            Self::TimedOut => write!(f, "heartbeat timed out"),
            Self::Faulted(msg) => write!(f, "faulted: {msg}"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(std::io::Error),
    FrameTooLarge { len: usize, max: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Encoding errors.
#[derive(Debug)]
pub enum EncodeError {
    /// The payload serializer rejected the value.
    Serialize(String),
    /// Writing a message header failed.
    Header(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize(msg) => write!(f, "serialize failed: {msg}"),
            Self::Header(msg) => write!(f, "header encode failed: {msg}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Decoding errors. Any of these on an inbound frame is fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    /// Array length or subtype that no message kind uses.
    UnknownMessage { len: u32, kind: Option<i64> },
    InvalidData(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of input"),
            Self::UnknownMessage {
                len,
                kind: Some(kind),
            } => write!(f, "unknown message: array({len}) with type {kind:#x}"),
            Self::UnknownMessage { len, kind: None } => {
                write!(f, "unknown message: array({len})")
            }
            Self::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised while establishing a session.
#[derive(Debug)]
pub enum HandshakeError {
    /// The first frame carried no protocol version; the server predates this protocol.
    VersionMissing,
    VersionMismatch { expected: String, actual: String },
    /// The stream failed or closed before the marker arrived.
    ConnectFailed(TransportError),
    /// The marker did not arrive within the connect timeout.
    TimedOut,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMissing => write!(
                f,
                "server did not send a protocol version; it may predate this protocol"
            ),
            Self::VersionMismatch { expected, actual } => write!(
                f,
                "protocol version mismatch: expected {expected}, server sent {actual}"
            ),
            Self::ConnectFailed(e) => write!(f, "server rejected the connection: {e}"),
            Self::TimedOut => write!(f, "timed out waiting for the server handshake"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// High-level RPC errors.
#[derive(Debug)]
pub enum RpcError {
    Transport(TransportError),
    /// The remote method failed; carried by a `ResponseWithError` frame.
    Status {
        code: StatusCode,
        detail: String,
        message: Option<String>,
    },
    /// The connection went away while the call was pending.
    Disconnected(DisconnectReason),
    /// The session was already disposed when the call was made.
    Disposed,
    DeadlineExceeded,
    Encode(EncodeError),
    Decode(DecodeError),
    Handshake(HandshakeError),
}

impl RpcError {
    pub fn status(code: StatusCode, detail: impl Into<String>) -> Self {
        Self::Status {
            code,
            detail: detail.into(),
            message: None,
        }
    }

    /// The status code a caller or peer would observe for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::Status { code, .. } => *code,
            Self::Disconnected(_) => StatusCode::Cancelled,
            Self::Disposed | Self::Transport(_) => StatusCode::Unavailable,
            Self::DeadlineExceeded => StatusCode::DeadlineExceeded,
            Self::Encode(_) | Self::Decode(_) => StatusCode::Internal,
            Self::Handshake(_) => StatusCode::Internal,
        }
    }

    /// True when the whole connection died rather than this one call failing.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Disconnected(_) | Self::Disposed | Self::Transport(_)
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Status {
                code,
                detail,
                message: Some(message),
            } => write!(f, "{code}: {detail}\n{message}"),
            Self::Status { code, detail, .. } => write!(f, "{code}: {detail}"),
            Self::Disconnected(reason) => write!(f, "connection lost: {reason}"),
            Self::Disposed => write!(f, "session is already disposed"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Handshake(e) => write!(f, "handshake failed: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Handshake(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<EncodeError> for RpcError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<DecodeError> for RpcError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<HandshakeError> for RpcError {
    fn from(e: HandshakeError) -> Self {
        Self::Handshake(e)
    }
}
