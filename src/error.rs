//! Error types for bus operations.

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Envelope encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Envelope decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Payload conversion failed: {0}")]
    Payload(#[from] rmpv::ext::Error),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Unicast emit requires a target instance id")]
    MissingTarget,

    #[error("Bus is not initialized")]
    NotInitialized,

    #[error("Bus is already initialized")]
    AlreadyInitialized,

    #[error("Bus is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BusError::Connection("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = BusError::Closed;
        assert_eq!(err.to_string(), "Bus is closed");

        let err = BusError::Handler("boom".to_string());
        assert!(err.to_string().contains("boom"));
    }
}
