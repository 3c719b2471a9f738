use std::io;

use thiserror::Error;

/// Errors produced while discovering or talking to a bulb.
#[derive(Debug, Error)]
pub enum BulbError {
    /// A socket could not be opened, written or read.
    #[error("network error: {context}")]
    Network {
        context: String,
        #[source]
        source: io::Error,
    },

    /// No reply (or no discovery datagram) arrived in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The bulb does not advertise the method in its support list.
    #[error("method not supported by bulb: {0}")]
    UnsupportedMethod(String),

    /// A guarded method was attempted while the bulb is known to be off.
    #[error("tried to execute {0} on a bulb that is powered off")]
    DeviceOff(String),

    /// The bulb answered the command with an error object.
    #[error("{method} failed on the bulb: {message} ({code})")]
    Device {
        method: String,
        code: i64,
        message: String,
    },

    /// A discovery reply or protocol line could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// The control connection was closed while the session was still in use.
    #[error("connection to the bulb was closed")]
    ConnectionClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl BulbError {
    pub(crate) fn network(context: impl Into<String>, source: io::Error) -> Self {
        BulbError::Network {
            context: context.into(),
            source,
        }
    }

    /// Whether the error means the control connection can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BulbError::ConnectionClosed | BulbError::Network { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BulbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = BulbError::Device {
            method: "set_bright".to_string(),
            code: -1,
            message: "unsupported method".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "set_bright failed on the bulb: unsupported method (-1)"
        );
    }

    #[test]
    fn test_is_terminal() {
        assert!(BulbError::ConnectionClosed.is_terminal());
        assert!(BulbError::network("read", io::Error::from(io::ErrorKind::ConnectionReset))
            .is_terminal());
        assert!(!BulbError::Timeout("get_prop".to_string()).is_terminal());
        assert!(!BulbError::Cancelled.is_terminal());
    }
}
