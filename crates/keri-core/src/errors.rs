//! Unified error type for KERI core primitives
//!
//! Everything below the codec layer reports failures through a single error
//! enum. Higher layers wrap it into their own taxonomies.

use serde::{Deserialize, Serialize};

/// Error type for primitive, hashing, signature and threshold operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum KeriError {
    /// Unknown or unsupported derivation code
    #[error("Unknown derivation code: {code}")]
    UnknownCode {
        /// The offending code text
        code: String,
    },

    /// Qualified material could not be decoded
    #[error("Invalid encoding: {message}")]
    Encoding {
        /// Description of the decoding failure
        message: String,
    },

    /// Not enough input to decode a complete primitive
    #[error("Short input: need {need} more bytes")]
    Short {
        /// Number of additional bytes required
        need: usize,
    },

    /// Signature or key material failed verification
    #[error("Crypto error: {message}")]
    Crypto {
        /// Description of the cryptographic failure
        message: String,
    },

    /// Threshold specification is malformed or inconsistent with its key set
    #[error("Invalid threshold: {message}")]
    Threshold {
        /// Description of the threshold problem
        message: String,
    },

    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },
}

impl KeriError {
    /// Create an unknown-code error
    pub fn unknown_code(code: impl Into<String>) -> Self {
        Self::UnknownCode { code: code.into() }
    }

    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a short-input error
    pub fn short(need: usize) -> Self {
        Self::Short { need }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a threshold error
    pub fn threshold(message: impl Into<String>) -> Self {
        Self::Threshold {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Whether more input bytes could resolve this error
    pub fn is_short(&self) -> bool {
        matches!(self, Self::Short { .. })
    }
}

/// Standard Result type for KERI core operations
pub type Result<T> = std::result::Result<T, KeriError>;
