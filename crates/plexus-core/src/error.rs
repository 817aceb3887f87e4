//! Transport and session errors for Plexus.
//!
//! These are the synchronous failures of connection and lifecycle operations.
//! They are disjoint from the in-band RPC outcomes in [`crate::rpc`]: a handler
//! answering with an error is data, not an [`Error`].

use crate::rpc::RpcError;
use thiserror::Error;

/// Main error type for Plexus transport operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Channel or socket is disconnected")]
    Disconnected,

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON parsing error: {message}")]
    JsonParsing {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Frame payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("RPC is already finished or cancelled")]
    RpcDone,

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Nested call depth {depth} exceeds maximum {max}")]
    CallDepthExceeded { depth: u32, max: u32 },

    /// The call finished with an in-band error where a value was expected.
    #[error("RPC failed: {}", .0.kind)]
    Rpc(RpcError),

    #[error("No handler accepted the call")]
    NotHandled,

    #[error("Result does not match the expected type: {message}")]
    UnexpectedResult {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for Plexus operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonParsing {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl Error {
    /// Create an IO error without an underlying source.
    pub fn io(message: impl Into<String>) -> Self {
        Error::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Whether this error means the session is gone for good.
    ///
    /// Framing errors count as fatal: once a frame is corrupt the byte stream
    /// cannot be resynchronized.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Disconnected
                | Error::Io { .. }
                | Error::JsonParsing { .. }
                | Error::InvalidUtf8(_)
                | Error::FrameTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ErrorKind;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::RpcDone.to_string(),
            "RPC is already finished or cancelled"
        );
        let err = Error::FrameTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "Frame size 10 exceeds maximum 4");
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::JsonParsing { source: Some(_), .. }));
    }

    #[test]
    fn test_utf8_error_conversion() {
        let utf8_err = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        let err: Error = utf8_err.into();
        assert!(matches!(err, Error::InvalidUtf8(_)));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::Disconnected.is_fatal());
        assert!(Error::io("broken pipe").is_fatal());
        assert!(!Error::RpcDone.is_fatal());
        assert!(!Error::CallDepthExceeded { depth: 9, max: 8 }.is_fatal());
        assert!(!Error::NotHandled.is_fatal());
        assert!(!Error::Rpc(RpcError::new(ErrorKind::UnknownRpc)).is_fatal());
    }

    #[test]
    fn test_rpc_error_display_names_kind() {
        let err = Error::Rpc(RpcError::new(ErrorKind::UnknownRpc));
        assert_eq!(err.to_string(), "RPC failed: UnknownRpc");
    }
}
