//! Error types for the Bitfinex websocket client

use thiserror::Error;

use crate::websocket::{ConnectionState, StreamId};

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the websocket client
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation attempted while the connection is not open (or is paused)
    #[error("Connection not ready: {0}")]
    ConnectionNotReady(ConnectionState),

    /// Private operation attempted without credentials or an authenticated session
    #[error("No credentials: {0}")]
    NoCredentials(String),

    /// No acknowledgement arrived within the wait window.
    ///
    /// The request may still have been applied by the exchange.
    #[error("No confirmation received: {0}")]
    NoConfirmation(String),

    /// The exchange explicitly rejected the request
    #[error("Rejected by server: {0}")]
    ServerRejected(String),

    /// Inbound frame did not line up with local state
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// Transport layer failure (connect, send, receive)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Invalid parameter error
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Unsubscribe for a stream id that is not registered
    #[error("No subscription found for stream {0}")]
    NoSubscription(StreamId),

    /// A subscription with the same key is already registered
    #[error("Already subscribed: {0}")]
    DuplicateSubscription(String),

    /// The client has been closed permanently
    #[error("Client has been closed")]
    Closed,
}

impl Error {
    /// Whether the failure may clear up on its own once the connection recovers
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionNotReady(_) | Error::NoConfirmation(_) | Error::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_connection_not_ready() {
        let err = Error::ConnectionNotReady(ConnectionState::Paused);
        assert_eq!(err.to_string(), "Connection not ready: Paused");
    }

    #[test]
    fn test_error_display_no_credentials() {
        let err = Error::NoCredentials("api key not set".to_string());
        assert_eq!(err.to_string(), "No credentials: api key not set");
    }

    #[test]
    fn test_error_display_server_rejected() {
        let err = Error::ServerRejected("Invalid order: minimum size".to_string());
        assert_eq!(
            err.to_string(),
            "Rejected by server: Invalid order: minimum size"
        );
    }

    #[test]
    fn test_error_display_no_subscription() {
        let err = Error::NoSubscription(StreamId::new(-4));
        assert_eq!(err.to_string(), "No subscription found for stream -4");
    }

    #[test]
    fn test_error_display_invalid_parameter() {
        let err = Error::InvalidParameter("amount must be non-zero".to_string());
        assert_eq!(err.to_string(), "Invalid parameter: amount must be non-zero");
    }

    #[test]
    fn test_error_display_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(err.to_string().starts_with("JSON error:"));
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::ConnectionNotReady(ConnectionState::Disconnected).is_retryable());
        assert!(Error::NoConfirmation("subscribe".to_string()).is_retryable());
        assert!(Error::Transport("reset".to_string()).is_retryable());
        assert!(!Error::ServerRejected("dup".to_string()).is_retryable());
        assert!(!Error::NoCredentials("missing".to_string()).is_retryable());
        assert!(!Error::Closed.is_retryable());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(Error::Closed)
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
