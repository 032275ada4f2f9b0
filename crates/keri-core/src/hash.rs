//! Pure synchronous digest algorithms for self-addressing data
//!
//! Hashing is deterministic, so it stays out of any effect or storage layer.
//! Each supported digest derivation code maps to one [`HashAlgorithm`]
//! implementation; [`DEFAULT_DIGEST`] is the algorithm used for new SAIDs and
//! next-key commitments.
//!
//! ```ignore
//! use keri_core::hash::{digest, DigestAlgorithm};
//!
//! let d = digest(DigestAlgorithm::Blake3_256, b"hello");
//! assert_eq!(d.len(), 32);
//! ```

use sha2::{Digest, Sha256};
use std::fmt;

/// Synchronous trait for 32-byte content digests
pub trait HashAlgorithm: Send + Sync + fmt::Debug {
    /// Hash arbitrary bytes to a 32-byte digest
    fn hash(&self, data: &[u8]) -> [u8; 32];
}

/// Blake3-256, the default digest for SAIDs
#[derive(Debug, Clone, Copy)]
pub struct Blake3Algorithm;

impl HashAlgorithm for Blake3Algorithm {
    fn hash(&self, data: &[u8]) -> [u8; 32] {
        *blake3::hash(data).as_bytes()
    }
}

/// SHA2-256
#[derive(Debug, Clone, Copy)]
pub struct Sha256Algorithm;

impl HashAlgorithm for Sha256Algorithm {
    fn hash(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }
}

/// Digest algorithms addressable by derivation code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum DigestAlgorithm {
    /// Blake3 with 256-bit output
    Blake3_256,
    /// SHA2 with 256-bit output
    Sha2_256,
}

impl DigestAlgorithm {
    fn algorithm(self) -> &'static dyn HashAlgorithm {
        match self {
            DigestAlgorithm::Blake3_256 => &Blake3Algorithm,
            DigestAlgorithm::Sha2_256 => &Sha256Algorithm,
        }
    }
}

/// The digest used for newly created SAIDs and next-key commitments.
pub const DEFAULT_DIGEST: DigestAlgorithm = DigestAlgorithm::Blake3_256;

/// Hash `data` with the given algorithm
#[inline]
pub fn digest(algorithm: DigestAlgorithm, data: &[u8]) -> [u8; 32] {
    algorithm.algorithm().hash(data)
}
