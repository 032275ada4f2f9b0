//! Typed qualified primitives
//!
//! Thin newtypes over [`Matter`] that restrict the allowed derivation codes
//! and add the operations each kind of material supports. All of them
//! serialize as their qb64 text so they can sit directly in event bodies.

use crate::errors::{KeriError, Result};
use crate::hash::{digest, DigestAlgorithm, DEFAULT_DIGEST};
use crate::matter::{
    b64_index, bin_to_text_prefix, binary_to_text, decode_body, encode_body, text_to_binary,
    Matter, MatterCode,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

macro_rules! qualified_newtype {
    ($name:ident, $check:expr, $what:literal) => {
        impl $name {
            /// Wrap material after checking its derivation code
            pub fn from_matter(matter: Matter) -> Result<Self> {
                let check: fn(MatterCode) -> bool = $check;
                if !check(matter.code()) {
                    return Err(KeriError::invalid(format!(
                        "code {} is not a valid {}",
                        matter.code(),
                        $what
                    )));
                }
                Ok(Self(matter))
            }

            /// Parse complete qb64 text
            pub fn from_qb64(text: &str) -> Result<Self> {
                Self::from_matter(Matter::from_qb64(text)?)
            }

            /// Underlying qualified material
            pub fn matter(&self) -> &Matter {
                &self.0
            }

            /// Derivation code
            pub fn code(&self) -> MatterCode {
                self.0.code()
            }

            /// Raw bytes
            pub fn raw(&self) -> &[u8] {
                self.0.raw()
            }

            /// Text encoding
            pub fn qb64(&self) -> String {
                self.0.qb64()
            }

            /// Native binary encoding
            pub fn qb2(&self) -> Vec<u8> {
                self.0.qb2()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.qb64())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.qb64())
            }
        }

        impl FromStr for $name {
            type Err = KeriError;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_qb64(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.qb64())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                Self::from_qb64(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Public verification key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Verfer(Matter);

qualified_newtype!(Verfer, MatterCode::is_verkey, "verification key");

impl Verfer {
    /// Build a verifier from raw Ed25519 public key bytes
    pub fn new(raw: [u8; 32], transferable: bool) -> Self {
        let code = if transferable {
            MatterCode::Ed25519
        } else {
            MatterCode::Ed25519N
        };
        Self(Matter::new_unchecked(code, raw.to_vec()))
    }

    /// Whether this key may be rotated away from
    pub fn is_transferable(&self) -> bool {
        self.code() == MatterCode::Ed25519
    }

    /// Verify an Ed25519 signature over `ser`
    pub fn verify(&self, sig: &[u8], ser: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(self.raw()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(sig) else {
            return false;
        };
        key.verify(ser, &signature).is_ok()
    }
}

/// Content digest
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Diger(Matter);

qualified_newtype!(Diger, MatterCode::is_digest, "digest");

impl Diger {
    /// Digest `ser` with the default algorithm
    pub fn new(ser: &[u8]) -> Self {
        Self::with_algorithm(DEFAULT_DIGEST, ser)
    }

    /// Digest `ser` with an explicit algorithm
    pub fn with_algorithm(algorithm: DigestAlgorithm, ser: &[u8]) -> Self {
        let code = match algorithm {
            DigestAlgorithm::Blake3_256 => MatterCode::Blake3_256,
            DigestAlgorithm::Sha2_256 => MatterCode::Sha2_256,
        };
        let raw = digest(algorithm, ser);
        Self(Matter::new_unchecked(code, raw.to_vec()))
    }

    /// Algorithm named by this digest's code
    pub fn algorithm(&self) -> DigestAlgorithm {
        match self.code() {
            MatterCode::Sha2_256 => DigestAlgorithm::Sha2_256,
            _ => DigestAlgorithm::Blake3_256,
        }
    }

    /// Whether this digest commits to `ser`
    pub fn verify(&self, ser: &[u8]) -> bool {
        digest(self.algorithm(), ser).as_slice() == self.raw()
    }
}

/// Identifier prefix (AID)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefixer(Matter);

qualified_newtype!(
    Prefixer,
    |code| code.is_verkey() || code.is_digest(),
    "identifier prefix"
);

impl Prefixer {
    /// Basic prefix taken directly from a single public key
    pub fn basic(verfer: &Verfer) -> Self {
        Self(verfer.matter().clone())
    }

    /// Self-addressing prefix from an inception digest
    pub fn self_addressing(diger: &Diger) -> Self {
        Self(diger.matter().clone())
    }

    /// Whether the identifier's keys may ever rotate
    pub fn is_transferable(&self) -> bool {
        self.code() != MatterCode::Ed25519N
    }

    /// Whether the prefix is derived from the inception digest
    pub fn is_self_addressing(&self) -> bool {
        self.code().is_digest()
    }

    /// Whether the prefix is a public key
    pub fn is_basic(&self) -> bool {
        self.code().is_verkey()
    }
}

impl From<&Verfer> for Prefixer {
    fn from(verfer: &Verfer) -> Self {
        Prefixer::basic(verfer)
    }
}

/// Unindexed signature, optionally paired with the verifier that produced it
#[derive(Clone, PartialEq, Eq)]
pub struct Cigar {
    sig: Matter,
    verfer: Option<Verfer>,
}

impl Cigar {
    /// Wrap raw signature bytes
    pub fn new(raw: [u8; 64], verfer: Option<Verfer>) -> Self {
        let sig = Matter::new_unchecked(MatterCode::Ed25519Sig, raw.to_vec());
        Self { sig, verfer }
    }

    /// Wrap parsed material
    pub fn from_matter(sig: Matter, verfer: Option<Verfer>) -> Result<Self> {
        if sig.code() != MatterCode::Ed25519Sig {
            return Err(KeriError::invalid(format!(
                "code {} is not an unindexed signature",
                sig.code()
            )));
        }
        Ok(Self { sig, verfer })
    }

    /// Signature material
    pub fn matter(&self) -> &Matter {
        &self.sig
    }

    /// Raw signature bytes
    pub fn raw(&self) -> &[u8] {
        self.sig.raw()
    }

    /// Verifier attached to this signature
    pub fn verfer(&self) -> Option<&Verfer> {
        self.verfer.as_ref()
    }

    /// Attach a verifier
    pub fn with_verfer(mut self, verfer: Verfer) -> Self {
        self.verfer = Some(verfer);
        self
    }

    /// Text encoding
    pub fn qb64(&self) -> String {
        self.sig.qb64()
    }

    /// Verify against the attached verifier
    pub fn verify(&self, ser: &[u8]) -> bool {
        self.verfer
            .as_ref()
            .is_some_and(|verfer| verfer.verify(self.raw(), ser))
    }
}

impl fmt::Debug for Cigar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cigar({})", self.qb64())
    }
}

/// Indexed Ed25519 signature.
///
/// The index names the signing key's position in the key list the signature
/// is checked against (controller keys or witness list).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Siger {
    index: u32,
    raw: Vec<u8>,
}

/// Code text for an Ed25519 indexed signature
pub const INDEXED_ED25519_CODE: u8 = b'A';

/// qb64 length of an indexed Ed25519 signature
pub const INDEXED_SIG_SIZE: usize = 88;

impl Siger {
    /// Build an indexed signature
    pub fn new(raw: [u8; 64], index: u32) -> Result<Self> {
        if index >= 64 {
            return Err(KeriError::invalid(format!(
                "signature index {index} exceeds single-character range"
            )));
        }
        Ok(Self {
            index,
            raw: raw.to_vec(),
        })
    }

    /// Key list index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Raw signature bytes
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Text encoding
    pub fn qb64(&self) -> String {
        let mut out = String::with_capacity(INDEXED_SIG_SIZE);
        out.push(char::from(INDEXED_ED25519_CODE));
        out.push_str(&crate::matter::int_to_b64(u64::from(self.index), 1).unwrap_or_default());
        out.push_str(&encode_body(&self.raw));
        out
    }

    /// Native binary encoding
    pub fn qb2(&self) -> Vec<u8> {
        text_to_binary(&self.qb64()).unwrap_or_default()
    }

    /// Parse complete qb64 text
    pub fn from_qb64(text: &str) -> Result<Self> {
        let (siger, used) = Self::parse_qb64(text.as_bytes())?;
        if used != text.len() {
            return Err(KeriError::encoding("trailing characters after indexed signature"));
        }
        Ok(siger)
    }

    /// Parse one indexed signature from the front of a qb64 stream
    pub fn parse_qb64(stream: &[u8]) -> Result<(Self, usize)> {
        let first = *stream.first().ok_or_else(|| KeriError::short(1))?;
        if first != INDEXED_ED25519_CODE {
            return Err(KeriError::unknown_code(char::from(first).to_string()));
        }
        if stream.len() < INDEXED_SIG_SIZE {
            return Err(KeriError::short(INDEXED_SIG_SIZE - stream.len()));
        }
        let index = b64_index(stream[1])?;
        let raw = decode_body(&stream[2..INDEXED_SIG_SIZE], 64)?;
        Ok((Self { index, raw }, INDEXED_SIG_SIZE))
    }

    /// Parse one indexed signature from the front of a qb2 stream
    pub fn parse_qb2(stream: &[u8]) -> Result<(Self, usize)> {
        let bs = INDEXED_SIG_SIZE * 3 / 4;
        if stream.is_empty() {
            return Err(KeriError::short(1));
        }
        let prefix = bin_to_text_prefix(stream, 1);
        if prefix.as_bytes().first() != Some(&INDEXED_ED25519_CODE) {
            return Err(KeriError::unknown_code(prefix));
        }
        if stream.len() < bs {
            return Err(KeriError::short(bs - stream.len()));
        }
        let text = binary_to_text(&stream[..bs]);
        let (siger, _) = Self::parse_qb64(text.as_bytes())?;
        Ok((siger, bs))
    }

    /// Verify against `verfer`
    pub fn verify(&self, verfer: &Verfer, ser: &[u8]) -> bool {
        verfer.verify(&self.raw, ser)
    }
}

impl fmt::Debug for Siger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Siger(index={}, {}..)", self.index, &self.qb64()[..8])
    }
}

impl Serialize for Siger {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.qb64())
    }
}

impl<'de> Deserialize<'de> for Siger {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_qb64(&text).map_err(serde::de::Error::custom)
    }
}

/// Sequence number or first-seen ordinal as qualified material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seqner(pub u128);

impl Seqner {
    /// Qualified material form
    pub fn matter(&self) -> Matter {
        Matter::new_unchecked(MatterCode::Salt128, self.0.to_be_bytes().to_vec())
    }

    /// Text encoding
    pub fn qb64(&self) -> String {
        self.matter().qb64()
    }

    /// Decode from qualified material
    pub fn from_matter(matter: &Matter) -> Result<Self> {
        if matter.code() != MatterCode::Salt128 {
            return Err(KeriError::invalid(format!(
                "code {} is not an ordinal",
                matter.code()
            )));
        }
        let bytes: [u8; 16] = matter
            .raw()
            .try_into()
            .map_err(|_| KeriError::encoding("ordinal must be 16 bytes"))?;
        Ok(Self(u128::from_be_bytes(bytes)))
    }

    /// Sequence number as u64, failing if it does not fit
    pub fn sn(&self) -> Result<u64> {
        u64::try_from(self.0).map_err(|_| KeriError::invalid("ordinal exceeds u64"))
    }
}

/// Timestamp as qualified material.
///
/// The body is the 32-character ISO-8601 form with microseconds and an
/// explicit UTC offset, with `:` `.` `+` mapped onto `c` `d` `p` so it is
/// valid base64 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dater(pub DateTime<Utc>);

const DATER_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

impl Dater {
    /// ISO-8601 text with microsecond precision
    pub fn iso8601(&self) -> String {
        self.0.format(DATER_FORMAT).to_string()
    }

    /// Text encoding
    pub fn qb64(&self) -> String {
        let body: String = self
            .iso8601()
            .chars()
            .map(|c| match c {
                ':' => 'c',
                '.' => 'd',
                '+' => 'p',
                other => other,
            })
            .collect();
        format!("{}{}", MatterCode::DateTime.as_str(), body)
    }

    /// Qualified material form
    pub fn matter(&self) -> Result<Matter> {
        Matter::from_qb64(&self.qb64())
    }

    /// Decode from qualified material
    pub fn from_matter(matter: &Matter) -> Result<Self> {
        if matter.code() != MatterCode::DateTime {
            return Err(KeriError::invalid(format!(
                "code {} is not a datetime",
                matter.code()
            )));
        }
        let qb64 = matter.qb64();
        let iso: String = qb64[MatterCode::DateTime.as_str().len()..]
            .chars()
            .map(|c| match c {
                'c' => ':',
                'd' => '.',
                'p' => '+',
                other => other,
            })
            .collect();
        Self::from_iso8601(&iso)
    }

    /// Parse ISO-8601 text in the fixed UTC form
    pub fn from_iso8601(text: &str) -> Result<Self> {
        let naive = NaiveDateTime::parse_from_str(text, DATER_FORMAT)
            .map_err(|e| KeriError::encoding(format!("datetime {text}: {e}")))?;
        Ok(Self(Utc.from_utc_datetime(&naive)))
    }
}
