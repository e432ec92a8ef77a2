//! Error types for the rpc transport and fabric operations.
//!
//! Callers need to tell apart a dead transport (reconnect next time), a
//! reply that never came (correlation), and a well-formed `rpc-error` from
//! the controller (never retried, sometimes benign).

use std::{io, time::Duration};

use thiserror::Error;

/// Top-level error type for the netconf crate.
#[derive(Debug, Error)]
pub enum NetconfError {
    /// io failure on the underlying stream
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// connection or channel level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// every configured credential was rejected or unusable
    #[error("authentication failed for user {user}")]
    Auth { user: String },

    /// connecting plus the greeting exchange took too long
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// the greeting exchange failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// the controller answered with an `rpc-error`
    #[error("rpc-error ({tag}): {message}")]
    Protocol { tag: String, message: String },

    /// no reply within the request timeout
    #[error("timeout on reply for session-id {session_id} message-id {message_id}")]
    Timeout { session_id: String, message_id: u64 },

    /// the receive loop hit end of stream or a read error while the
    /// request was pending
    #[error("receiver terminated before a reply arrived")]
    ReceiverTerminated,

    /// a waiter is already registered for this id
    #[error("message-id {0} already has a pending request")]
    DuplicateMessageId(u64),

    /// a frame that isn't well-formed xml
    #[error("malformed xml: {0}")]
    Xml(String),

    /// no terminator within the frame size limit
    #[error("frame exceeds {max} bytes without a terminator")]
    FrameTooLarge { max: usize },

    /// a reply that parsed but isn't what the request expects
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl NetconfError {
    /// the transport can't be used anymore and the next call reconnects
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NetconfError::Io(_)
                | NetconfError::Transport(_)
                | NetconfError::Auth { .. }
                | NetconfError::ConnectTimeout(_)
                | NetconfError::Handshake(_)
                | NetconfError::ReceiverTerminated
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            NetconfError::Timeout { .. } | NetconfError::ConnectTimeout(_)
        )
    }

    /// the request may or may not have been applied: no reply was matched
    pub fn is_correlation(&self) -> bool {
        matches!(
            self,
            NetconfError::Timeout { .. }
                | NetconfError::ReceiverTerminated
                | NetconfError::DuplicateMessageId(_)
        )
    }

    /// the object being created is already there
    pub fn is_already_exists(&self) -> bool {
        match self {
            NetconfError::Protocol { tag, message } => {
                let message = message.to_ascii_lowercase();
                tag == "data-exists"
                    || message.contains("unique duplicate constraint")
                    || message.contains("already exists")
                    || message.contains("already attached")
            }
            _ => false,
        }
    }

    /// the object being removed is already gone
    pub fn is_missing(&self) -> bool {
        match self {
            NetconfError::Protocol { tag, message } => {
                let message = message.to_ascii_lowercase();
                tag == "data-missing"
                    || message.contains("not found")
                    || message.contains("does not exist")
                    || message.contains("not attached")
            }
            _ => false,
        }
    }
}

/// Shorthand result alias for netconf operations.
pub type NetconfResult<T> = Result<T, NetconfError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn proto(tag: &str, message: &str) -> NetconfError {
        NetconfError::Protocol {
            tag: tag.into(),
            message: message.into(),
        }
    }

    #[test]
    fn test_error_classification() {
        let io = NetconfError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(io.is_transport());
        assert!(!io.is_correlation());

        let timeout = NetconfError::Timeout {
            session_id: "12".into(),
            message_id: 3,
        };
        assert!(timeout.is_timeout());
        assert!(timeout.is_correlation());
        assert!(!timeout.is_transport());

        let terminated = NetconfError::ReceiverTerminated;
        assert!(terminated.is_transport());
        assert!(terminated.is_correlation());

        let p = proto("operation-failed", "bad value");
        assert!(!p.is_transport());
        assert!(!p.is_correlation());
        assert!(!p.is_already_exists());
        assert!(!p.is_missing());
    }

    #[test]
    fn test_idempotent_conflicts() {
        assert!(proto("data-exists", "").is_already_exists());
        assert!(
            proto(
                "operation-failed",
                "Unique duplicate constraint violated on tp-id"
            )
            .is_already_exists()
        );
        assert!(proto("data-missing", "").is_missing());
        assert!(proto("operation-failed", "termination point not found").is_missing());
        assert!(!NetconfError::ReceiverTerminated.is_missing());
    }

    #[test]
    fn test_error_display() {
        let err = NetconfError::Timeout {
            session_id: "42".into(),
            message_id: 7,
        };
        let msg = format!("{err}");
        assert!(msg.contains("session-id 42"));
        assert!(msg.contains("message-id 7"));
    }
}
