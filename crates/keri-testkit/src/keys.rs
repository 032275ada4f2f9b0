//! Deterministic key material
//!
//! Seeds are SHA-256 digests of a label and a counter, so the same label
//! always yields the same keys and distinct labels never collide in practice.

use keri_core::{Signer, Verfer};
use sha2::{Digest, Sha256};

/// Seed derived from `label` and `index`
pub fn seed(label: &str, index: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    hasher.update(index.to_be_bytes());
    hasher.finalize().into()
}

/// Transferable signer for `label`/`index`
pub fn signer(label: &str, index: u32) -> Signer {
    Signer::from_seed(seed(label, index), true)
}

/// Non-transferable signer for `label`/`index`
pub fn basic_signer(label: &str, index: u32) -> Signer {
    Signer::from_seed(seed(label, index), false)
}

/// `count` transferable signers for one key generation of `label`
pub fn key_set(label: &str, generation: u32, count: usize) -> Vec<Signer> {
    (0..count)
        .map(|i| signer(&format!("{label}/{generation}"), i as u32))
        .collect()
}

/// Verification keys of `signers`
pub fn verfers(signers: &[Signer]) -> Vec<Verfer> {
    signers.iter().map(|s| s.verfer().clone()).collect()
}
