//! Error types for the voxlink client

use thiserror::Error;

/// Result type alias for voxlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, bad value)
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Socket could not be opened or dropped unexpectedly
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected protocol frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Send attempted while the session is not open
    #[error("session is not connected")]
    NotConnected,

    /// Reconnection budget used up
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Failed attempts since the last successful open
        attempts: u32,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error should end the process rather than be recovered locally
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ReconnectExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Config("missing key".to_string()).is_fatal());
        assert!(Error::ReconnectExhausted { attempts: 5 }.is_fatal());
        assert!(!Error::Connection("reset".to_string()).is_fatal());
        assert!(!Error::Protocol("bad frame".to_string()).is_fatal());
        assert!(!Error::NotConnected.is_fatal());
    }

    #[test]
    fn exhausted_message_names_attempts() {
        let err = Error::ReconnectExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "reconnection failed after 3 attempts");
    }
}
