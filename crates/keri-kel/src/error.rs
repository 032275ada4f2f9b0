//! KEL error taxonomy
//!
//! Every failure carries a [`ErrorCategory`] deciding its fate: malformed,
//! unauthorized and misconfigured events are rejected outright, deferred ones
//! go to the matching escrow, duplicity is recorded.

use crate::escrow::EscrowCategory;
use keri_codec::CodecError;
use keri_core::KeriError;
use thiserror::Error;

/// Errors raised while validating and applying key events
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KelError {
    /// Message could not be decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Declared SAID is not the digest of the body
    #[error("Invalid SAID {said}")]
    InvalidSaid {
        /// Declared SAID
        said: String,
    },

    /// Signatures, commitments or identifier derivation do not authorize the event
    #[error("Unauthorized event {prefix}:{sn}: {reason}")]
    Unauthorized {
        /// Identifier
        prefix: String,
        /// Sequence number
        sn: u64,
        /// What failed
        reason: String,
    },

    /// Thresholds or witness configuration are internally inconsistent
    #[error("Invalid configuration in {prefix}:{sn}: {reason}")]
    Configuration {
        /// Identifier
        prefix: String,
        /// Sequence number
        sn: u64,
        /// What is inconsistent
        reason: String,
    },

    /// Prior event not yet seen
    #[error("Out of order event {prefix}:{sn}")]
    OutOfOrder {
        /// Identifier
        prefix: String,
        /// Sequence number
        sn: u64,
    },

    /// Some but not enough valid controller signatures
    #[error("Partially signed event {prefix}:{sn}")]
    PartiallySigned {
        /// Identifier
        prefix: String,
        /// Sequence number
        sn: u64,
    },

    /// Delegator KEL or anchoring seal not yet seen
    #[error("Missing delegation for {prefix}:{sn}")]
    MissingDelegation {
        /// Identifier
        prefix: String,
        /// Sequence number
        sn: u64,
    },

    /// Receipted event not yet seen
    #[error("Receipt for unknown event {prefix}:{said}")]
    UnknownReceipted {
        /// Receipted identifier
        prefix: String,
        /// Receipted SAID
        said: String,
    },

    /// Receiptor establishment event not yet seen
    #[error("Receipt from unknown establishment event {receiptor}:{sn}")]
    UnknownReceiptor {
        /// Receiptor identifier
        receiptor: String,
        /// Receiptor establishment sequence number
        sn: u64,
    },

    /// A different event already holds this sequence number
    #[error("Duplicitous event {prefix}:{sn}")]
    Duplicitous {
        /// Identifier
        prefix: String,
        /// Sequence number
        sn: u64,
    },

    /// Storage collaborator failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Settings could not be loaded
    #[error("Invalid settings: {0}")]
    Settings(String),
}

/// Result type for KEL operations
pub type Result<T> = std::result::Result<T, KelError>;

/// Disposition of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Undecodable input, rejected
    Malformed,
    /// Authorization failed, rejected
    Unauthorized,
    /// Prerequisite missing, escrowed in the given category
    Deferred(EscrowCategory),
    /// Conflicting event, recorded
    Duplicitous,
    /// Internally inconsistent event, rejected
    Configuration,
    /// Collaborator failure
    Storage,
}

impl KelError {
    /// Create an unauthorized error
    pub fn unauthorized(prefix: impl ToString, sn: u64, reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            prefix: prefix.to_string(),
            sn,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(prefix: impl ToString, sn: u64, reason: impl Into<String>) -> Self {
        Self::Configuration {
            prefix: prefix.to_string(),
            sn,
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// How this failure is handled
    pub fn category(&self) -> ErrorCategory {
        match self {
            KelError::Codec(_) | KelError::InvalidSaid { .. } => ErrorCategory::Malformed,
            KelError::Unauthorized { .. } => ErrorCategory::Unauthorized,
            KelError::Configuration { .. } | KelError::Settings(_) => {
                ErrorCategory::Configuration
            }
            KelError::OutOfOrder { .. } => ErrorCategory::Deferred(EscrowCategory::OutOfOrder),
            KelError::PartiallySigned { .. } => {
                ErrorCategory::Deferred(EscrowCategory::PartiallySigned)
            }
            KelError::MissingDelegation { .. } => {
                ErrorCategory::Deferred(EscrowCategory::PartiallyDelegated)
            }
            KelError::UnknownReceipted { .. } => {
                ErrorCategory::Deferred(EscrowCategory::UnverifiedReceipt)
            }
            KelError::UnknownReceiptor { .. } => {
                ErrorCategory::Deferred(EscrowCategory::UnverifiedTransReceipt)
            }
            KelError::Duplicitous { .. } => ErrorCategory::Duplicitous,
            KelError::Storage(_) => ErrorCategory::Storage,
        }
    }

    /// Whether the failure may resolve once more information arrives
    pub fn is_deferred(&self) -> bool {
        matches!(self.category(), ErrorCategory::Deferred(_))
    }
}

impl From<KeriError> for KelError {
    fn from(err: KeriError) -> Self {
        KelError::Codec(CodecError::from(err))
    }
}

impl From<serde_cbor::Error> for KelError {
    fn from(err: serde_cbor::Error) -> Self {
        KelError::Storage(format!("record encoding: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            KelError::Codec(CodecError::body("x")).category(),
            ErrorCategory::Malformed
        );
        assert_eq!(
            KelError::unauthorized("Epre", 1, "bad sigs").category(),
            ErrorCategory::Unauthorized
        );
        assert_eq!(
            KelError::OutOfOrder {
                prefix: "Epre".into(),
                sn: 4
            }
            .category(),
            ErrorCategory::Deferred(EscrowCategory::OutOfOrder)
        );
        assert!(KelError::MissingDelegation {
            prefix: "Epre".into(),
            sn: 0
        }
        .is_deferred());
        assert!(!KelError::storage("disk").is_deferred());
    }

    #[test]
    fn test_display() {
        let err = KelError::configuration("Epre", 2, "toad 3 exceeds 2 witnesses");
        assert_eq!(
            err.to_string(),
            "Invalid configuration in Epre:2: toad 3 exceeds 2 witnesses"
        );
    }
}
