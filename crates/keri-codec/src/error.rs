//! Codec error types

use keri_core::KeriError;
use thiserror::Error;

/// Errors raised while parsing or serializing messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Not enough buffered bytes; the caller should wait for more input
    #[error("Short input: need {need} more bytes")]
    Short {
        /// Additional bytes required, when known
        need: usize,
    },

    /// Version marker names an unknown protocol or version
    #[error("Unsupported version: {0}")]
    Version(String),

    /// Version marker names an unknown serialization kind
    #[error("Unsupported serialization kind: {0}")]
    Kind(String),

    /// Event body could not be decoded or failed field validation
    #[error("Malformed body: {0}")]
    Body(String),

    /// Attachment groups could not be decoded
    #[error("Malformed attachment: {0}")]
    Attachment(String),

    /// Serialization of an outgoing message failed
    #[error("Serialization failed: {0}")]
    Serialize(String),

    /// Primitive decoding failed
    #[error(transparent)]
    Primitive(#[from] KeriError),
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    /// Create a short-input error
    pub fn short(need: usize) -> Self {
        Self::Short { need }
    }

    /// Create a body error
    pub fn body(message: impl Into<String>) -> Self {
        Self::Body(message.into())
    }

    /// Create an attachment error
    pub fn attachment(message: impl Into<String>) -> Self {
        Self::Attachment(message.into())
    }

    /// Whether more input could resolve this error
    pub fn is_short(&self) -> bool {
        match self {
            CodecError::Short { .. } => true,
            CodecError::Primitive(inner) => inner.is_short(),
            _ => false,
        }
    }
}
