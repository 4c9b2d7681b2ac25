use std::error::Error;
use std::fmt;
use std::io;

/// Cause of a fatal network error. Any of these ends the session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// Unrecoverable socket error.
    Io,
    /// The peer closed the stream mid-frame.
    PeerClosed,
    /// A frame length prefix exceeded the protocol maximum.
    FrameTooLarge,
    /// A known opcode ended before all of its fields were read.
    TruncatedPacket,
    /// A write would have run past the end of a packet buffer.
    Overflow,
    /// A length-prefixed array was longer than one byte can describe.
    OversizeArray,
    /// A wire string was not valid UTF-8.
    MalformedText,
    /// An identifier exceeded the maximum identifier length.
    IdTooLong,
    /// An inbound channel message named a channel this session is not in.
    UnknownChannel,
}

/// Outcome of a network operation. `Wait` is not a failure: it means the
/// operation cannot progress until the socket signals readiness again.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            _ => NetworkError::Fatal(ErrorType::Io),
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ErrorType::Io => "socket error",
            ErrorType::PeerClosed => "peer closed the stream",
            ErrorType::FrameTooLarge => "frame exceeds maximum size",
            ErrorType::TruncatedPacket => "packet truncated",
            ErrorType::Overflow => "packet buffer overflow",
            ErrorType::OversizeArray => "array exceeds one-byte length",
            ErrorType::MalformedText => "malformed utf-8 string",
            ErrorType::IdTooLong => "identifier too long",
            ErrorType::UnknownChannel => "message for unknown channel",
        };
        write!(f, "{}", text)
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkError::Wait => write!(f, "operation must wait for socket readiness"),
            NetworkError::Fatal(err) => write!(f, "fatal network error: {}", err),
        }
    }
}

impl Error for NetworkError {}

/// Folding helpers for results carrying a `NetworkError`.
pub trait ErrorUtils {
    /// True in case the result is a fatal error. `Wait` outcomes are the
    /// normal idle state of a non-blocking socket and do not count.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        matches!(self, Err(NetworkError::Fatal(_)))
    }
}
