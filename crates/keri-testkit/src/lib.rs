//! KERI Testkit
//!
//! Fixtures shared by the workspace's tests: deterministic keys, scripted
//! controllers and witnesses that emit signed wire messages, a clock the test
//! advances by hand, and tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! use keri_testkit::{stream, Controller, Witness};
//!
//! let mut alice = Controller::new("alice", 1);
//! let witness = Witness::new("w0");
//! let icp = alice.incept_with(|b| b.with_witnesses(vec![witness.prefix()]));
//! let wire = stream(&[icp.clone(), witness.receipt(&icp.serder)]);
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod clock;
pub mod controller;
pub mod keys;

pub use clock::ControllableClock;
pub use controller::{bytes, sign_all, stream, Controller, Witness};
pub use keys::{basic_signer, key_set, seed, signer, verfers};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`; later calls are no-ops
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
