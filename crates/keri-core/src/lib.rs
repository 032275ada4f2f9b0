//! KERI Core - primitives for self-certifying key event logs
//!
//! This crate holds the pure building blocks the key event engine is made of.
//! Nothing here touches storage or performs I/O.
//!
//! # Contents
//!
//! - [`matter`]: derivation codes and qb64/qb2 framing of qualified material
//! - [`primitives`]: typed keys, digests, prefixes, signatures and ordinals
//! - [`hash`]: digest algorithms addressable by derivation code
//! - [`signing`]: Ed25519 signers
//! - [`threshold`]: the signing-threshold evaluator (integer, fractional,
//!   weighted and multi-clause thresholds)
//! - [`time`]: the injected clock

#![forbid(unsafe_code)]

/// Unified error handling
pub mod errors;

/// Digest algorithms
pub mod hash;

/// Qualified material encoding
pub mod matter;

/// Typed qualified primitives
pub mod primitives;

/// Ed25519 signing keys
pub mod signing;

/// Signing threshold evaluation
pub mod threshold;

/// Injected clock
pub mod time;

pub use errors::{KeriError, Result};
pub use hash::{DigestAlgorithm, DEFAULT_DIGEST};
pub use matter::{Matter, MatterCode};
pub use primitives::{Cigar, Dater, Diger, Prefixer, Seqner, Siger, Verfer};
pub use signing::Signer;
pub use threshold::{ample, Fraction, Tholder, ThresholdRole, ThresholdSpec};
pub use time::{Clock, SystemClock};
