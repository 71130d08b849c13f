//! Error types shared across the relay and the tunnel client.

use thiserror::Error;

/// Failure decoding traffic from the control connection.
///
/// Only [`FrameError::Json`] is recoverable: the offending message is dropped
/// and the connection stays up. Every other variant means the binary byte
/// stream can no longer be trusted and the connection must be closed.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad chunk magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("chunk id length {len} exceeds limit of {max} bytes")]
    IdTooLong { len: usize, max: usize },

    #[error("chunk frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("chunk id is not valid UTF-8")]
    InvalidId,
}

impl FrameError {
    /// Whether the connection that produced this error has to be closed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Json(_))
    }
}

/// Failure loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure in the tunnel client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client.relay_url is not configured")]
    MissingRelayUrl,

    /// The relay closed the control connection with the unauthorized code.
    /// Retrying with the same token cannot succeed.
    #[error("relay rejected the tunnel token")]
    Unauthorized,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid backend request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("backend request failed: {0}")]
    Backend(#[from] hyper_util::client::legacy::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_errors_are_recoverable() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!FrameError::Json(err).is_fatal());
    }

    #[test]
    fn test_framing_errors_are_fatal() {
        assert!(FrameError::BadMagic(*b"XXXX").is_fatal());
        assert!(FrameError::InvalidId.is_fatal());
        assert!(FrameError::FrameTooLarge { len: 10, max: 5 }.is_fatal());
        assert!(FrameError::IdTooLong { len: 300, max: 256 }.is_fatal());
    }

    #[test]
    fn test_bad_magic_display() {
        let msg = FrameError::BadMagic(*b"ABCD").to_string();
        assert!(msg.contains("41"), "{msg}");
    }
}
