//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while parsing identifiers or encoding messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// An identifier string was not a 128-bit hex value.
    #[error("invalid identifier {input:?}: {reason}")]
    InvalidId {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Encoding a message failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding a message failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The content type is not one the codec understands.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

impl ProtocolError {
    /// Creates an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode(message.into())
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnsupportedContentType("text/plain".into());
        assert_eq!(err.to_string(), "unsupported content type: text/plain");

        let err = ProtocolError::decode("truncated input");
        assert!(err.to_string().contains("truncated input"));
    }
}
