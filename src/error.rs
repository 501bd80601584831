use std::io;
use thiserror::Error;

/// Coarse classification of [S3tpError]s, deciding where an error is handled: structural,
///  integrity and protocol state errors are dropped at the layer that detects them, resource
///  exhaustion and connectivity errors are returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Structural,
    Integrity,
    ProtocolState,
    ResourceExhaustion,
    Connectivity,
}

#[derive(Error, Debug)]
pub enum S3tpError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("CRC mismatch: packet carries {received:04x}, calculated {calculated:04x}")]
    IntegrityError { received: u16, calculated: u16 },

    #[error("redundant length record has no majority")]
    CorruptLength,

    #[error("packet inconsistent with connection state: {0}")]
    InvalidPacket(String),

    #[error("port {0} is not connected")]
    NotConnected(u8),

    /// A send or receive queue is at its capacity. This is the retryable 'buffer full' condition.
    #[error("queue is full")]
    QueueFull,

    #[error("port {0} is busy")]
    PortBusy(u8),

    #[error("port {0} has no open connection")]
    PortNotOpen(u8),

    #[error("port {0} has no bound application")]
    PortNotBound(u8),

    #[error("connection on port {0} is already closing")]
    AlreadyClosing(u8),

    #[error("port {0} is outside the 7 bit port space")]
    InvalidPort(u8),

    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("link is unavailable")]
    LinkUnavailable,

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol engine is stopped")]
    Stopped,
}

pub type S3tpResult<T> = std::result::Result<T, S3tpError>;

impl S3tpError {
    pub fn class(&self) -> ErrorClass {
        match self {
            S3tpError::MalformedPacket(_) => ErrorClass::Structural,
            S3tpError::InvalidPort(_) => ErrorClass::Structural,
            S3tpError::MessageTooLarge { .. } => ErrorClass::Structural,
            S3tpError::IntegrityError { .. } => ErrorClass::Integrity,
            S3tpError::CorruptLength => ErrorClass::Integrity,
            S3tpError::InvalidPacket(_) => ErrorClass::ProtocolState,
            S3tpError::NotConnected(_) => ErrorClass::ProtocolState,
            S3tpError::PortBusy(_) => ErrorClass::ProtocolState,
            S3tpError::PortNotOpen(_) => ErrorClass::ProtocolState,
            S3tpError::PortNotBound(_) => ErrorClass::ProtocolState,
            S3tpError::AlreadyClosing(_) => ErrorClass::ProtocolState,
            S3tpError::QueueFull => ErrorClass::ResourceExhaustion,
            S3tpError::LinkUnavailable => ErrorClass::Connectivity,
            S3tpError::Link(_) => ErrorClass::Connectivity,
            S3tpError::Io(_) => ErrorClass::Connectivity,
            S3tpError::Stopped => ErrorClass::Connectivity,
        }
    }

    /// Retryable errors leave all state intact, so the same call may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(self, S3tpError::QueueFull | S3tpError::LinkUnavailable)
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        S3tpError::MalformedPacket(msg.into())
    }

    pub(crate) fn invalid_packet(msg: impl Into<String>) -> Self {
        S3tpError::InvalidPacket(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link is down")]
    Unavailable,

    #[error("frame of {0} bytes exceeds the link's frame size")]
    FrameTooLarge(usize),

    #[error("IO error on link: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::malformed(S3tpError::MalformedPacket("x".to_string()), ErrorClass::Structural, false)]
    #[case::crc(S3tpError::IntegrityError { received: 1, calculated: 2 }, ErrorClass::Integrity, false)]
    #[case::corrupt_length(S3tpError::CorruptLength, ErrorClass::Integrity, false)]
    #[case::state(S3tpError::InvalidPacket("x".to_string()), ErrorClass::ProtocolState, false)]
    #[case::queue_full(S3tpError::QueueFull, ErrorClass::ResourceExhaustion, true)]
    #[case::link_down(S3tpError::LinkUnavailable, ErrorClass::Connectivity, true)]
    #[case::link_error(S3tpError::Link(LinkError::Unavailable), ErrorClass::Connectivity, false)]
    fn test_class(#[case] error: S3tpError, #[case] expected_class: ErrorClass, #[case] expected_retryable: bool) {
        assert_eq!(error.class(), expected_class);
        assert_eq!(error.is_retryable(), expected_retryable);
    }
}
