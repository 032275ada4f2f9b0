//! KERI KEL - key event log validation
//!
//! The verification engine proper: per-identifier key-state machines, the
//! dispatcher that routes wire messages to them, and the escrows that hold
//! messages until their prerequisites arrive.
//!
//! # Layout
//!
//! - [`store`]: ordered key-value contract with atomic batches, plus an in-memory store
//! - [`db`]: typed KEL tables over a store
//! - [`state`]: the materialized key state
//! - [`kever`]: the key-state machine
//! - [`kevery`]: the dispatcher, its outcomes and cues
//! - [`escrow`]: escrow categories and entries
//! - [`driver`]: tokio tick that retries escrows
//! - [`config`]: settings loadable from TOML
//!
//! # Example
//!
//! ```rust,ignore
//! use keri_kel::{Kevery, MemoryStore, Outcome};
//!
//! let mut kevery = Kevery::new(MemoryStore::new())?;
//! for outcome in kevery.process(&wire_bytes) {
//!     if let Outcome::Rejected(err) = outcome {
//!         eprintln!("rejected: {err}");
//!     }
//! }
//! ```

#![forbid(unsafe_code)]

/// Settings
pub mod config;

/// Typed KEL tables
pub mod db;

/// Escrow tick driver
pub mod driver;

/// Error taxonomy
pub mod error;

/// Escrow stores
pub mod escrow;

/// Key-state machine
pub mod kever;

/// Event dispatcher
pub mod kevery;

/// Materialized key state
pub mod state;

/// Storage contract
pub mod store;

pub use config::{EscrowConfig, KelConfig};
pub use db::{KelDb, WitnessConfig};
pub use driver::EscrowDriver;
pub use error::{ErrorCategory, KelError, Result};
pub use escrow::{DropReason, EscrowCategory, EscrowEntry};
pub use kever::{verified_indices, Kever};
pub use kevery::{Cue, EscrowReport, Kevery, Outcome};
pub use state::{EstablishmentPoint, KeverStatus, KeyState};
pub use store::{KvStore, MemoryStore, ReadOnlyStore, WriteBatch, WriteOp};
