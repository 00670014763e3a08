//! Network and protocol error taxonomy.

use thiserror::Error;

/// Errors surfaced by the socket layer, the framed codec and the remote-agent
/// machinery.
///
/// Transient and permanent network errors are consumed by the agent retry
/// loop; protocol errors terminate the attempt immediately.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("query timed out")]
    QueryTimeout,

    #[error("operation timed out")]
    Timeout,

    #[error("interrupted")]
    Interrupted,

    #[error("connection reset by peer")]
    Reset,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("failed to resolve address '{0}'")]
    Unresolvable(String),

    #[error("short header: got {got} of {expected} bytes")]
    ShortHeader { got: usize, expected: usize },

    #[error("packet too large: {len} bytes exceeds max_packet_size {max}")]
    OversizedPacket { len: usize, max: usize },

    #[error("unsupported protocol version {0}")]
    BadVersion(u32),

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether the agent retry loop may consume this error by trying again
    /// against the same or another mirror. Protocol violations never retry.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            NetError::ShortHeader { .. }
                | NetError::OversizedPacket { .. }
                | NetError::BadVersion(_)
                | NetError::MalformedReply(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_terminal() {
        assert!(NetError::QueryTimeout.is_retriable());
        assert!(NetError::Reset.is_retriable());
        assert!(NetError::UnexpectedEof.is_retriable());
        assert!(!NetError::BadVersion(0).is_retriable());
        assert!(!NetError::OversizedPacket { len: 10, max: 1 }.is_retriable());
        assert!(!NetError::MalformedReply("x".into()).is_retriable());
    }
}
