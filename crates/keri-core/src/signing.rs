//! Ed25519 signing keys
//!
//! Controllers and witnesses hold a [`Signer`]; verifying parties only ever
//! see the [`Verfer`] and the signatures it produces.

use crate::errors::{KeriError, Result};
use crate::matter::{Matter, MatterCode};
use crate::primitives::{Cigar, Siger, Verfer};
use ed25519_dalek::{Signer as _, SigningKey};
use std::fmt;
use zeroize::Zeroizing;

/// Ed25519 private key with its derived verifier
#[derive(Clone)]
pub struct Signer {
    seed: Zeroizing<[u8; 32]>,
    verfer: Verfer,
}

impl Signer {
    /// Derive a signer from a 32-byte seed
    pub fn from_seed(seed: [u8; 32], transferable: bool) -> Self {
        let key = SigningKey::from_bytes(&seed);
        let verfer = Verfer::new(key.verifying_key().to_bytes(), transferable);
        Self {
            seed: Zeroizing::new(seed),
            verfer,
        }
    }

    /// Parse a qb64 seed (`A` code)
    pub fn from_qb64(text: &str, transferable: bool) -> Result<Self> {
        let matter = Matter::from_qb64(text)?;
        if matter.code() != MatterCode::Ed25519Seed {
            return Err(KeriError::invalid(format!(
                "code {} is not a signing seed",
                matter.code()
            )));
        }
        let seed: [u8; 32] = matter
            .raw()
            .try_into()
            .map_err(|_| KeriError::encoding("seed must be 32 bytes"))?;
        Ok(Self::from_seed(seed, transferable))
    }

    /// qb64 seed text
    pub fn qb64(&self) -> String {
        Matter::new_unchecked(MatterCode::Ed25519Seed, self.seed.to_vec()).qb64()
    }

    /// Verification key for this signer
    pub fn verfer(&self) -> &Verfer {
        &self.verfer
    }

    fn sign_raw(&self, ser: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.seed).sign(ser).to_bytes()
    }

    /// Unindexed signature carrying this signer's verifier
    pub fn sign(&self, ser: &[u8]) -> Cigar {
        Cigar::new(self.sign_raw(ser), Some(self.verfer.clone()))
    }

    /// Indexed signature for key list position `index`
    pub fn sign_indexed(&self, ser: &[u8], index: u32) -> Result<Siger> {
        Siger::new(self.sign_raw(ser), index)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("seed", &"[REDACTED]")
            .field("verfer", &self.verfer.qb64())
            .finish()
    }
}
