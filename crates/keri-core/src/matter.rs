//! Qualified material encoding
//!
//! Every key, digest, signature and ordinal travels as a derivation code
//! followed by its raw bytes. Two equivalent framings exist:
//!
//! - **qb64**: text, `code + base64url(pad ++ raw)` with the leading pad
//!   characters replaced by the code
//! - **qb2**: native binary, the base64 decoding of the qb64 text
//!
//! The pad length is `(3 - raw.len() % 3) % 3` bytes; the code occupies
//! exactly the characters the pad would have produced (plus whole quadlets
//! for four-character codes), so every qb64 primitive is a multiple of four
//! characters and every qb2 primitive a multiple of three bytes.

use crate::errors::{KeriError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

const B64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Value of a single base64url character
pub fn b64_index(c: u8) -> Result<u32> {
    match c {
        b'A'..=b'Z' => Ok(u32::from(c - b'A')),
        b'a'..=b'z' => Ok(u32::from(c - b'a') + 26),
        b'0'..=b'9' => Ok(u32::from(c - b'0') + 52),
        b'-' => Ok(62),
        b'_' => Ok(63),
        _ => Err(KeriError::encoding(format!(
            "invalid base64 character 0x{c:02x}"
        ))),
    }
}

/// Decode a base64url digit string as a big-endian integer
pub fn b64_to_int(text: &[u8]) -> Result<u64> {
    text.iter()
        .try_fold(0u64, |acc, c| Ok((acc << 6) | u64::from(b64_index(*c)?)))
}

/// Encode `value` as exactly `len` base64url digits
pub fn int_to_b64(value: u64, len: usize) -> Result<String> {
    if len < 11 && value >= 1u64 << (6 * len) {
        return Err(KeriError::invalid(format!(
            "{value} does not fit in {len} base64 digits"
        )));
    }
    let mut out = vec![b'A'; len];
    let mut v = value;
    for slot in out.iter_mut().rev() {
        *slot = B64_ALPHABET[(v & 0x3f) as usize];
        v >>= 6;
    }
    Ok(out.into_iter().map(char::from).collect())
}

/// Convert leading qb2 bytes into qb64 text, as many whole sextets as they carry
pub fn bin_to_text_prefix(bytes: &[u8], sextets: usize) -> String {
    let mut out = String::with_capacity(sextets);
    let mut acc: u32 = 0;
    let mut bits = 0;
    let mut iter = bytes.iter();
    while out.len() < sextets {
        if bits < 6 {
            match iter.next() {
                Some(b) => {
                    acc = (acc << 8) | u32::from(*b);
                    bits += 8;
                }
                None => break,
            }
        }
        bits -= 6;
        out.push(char::from(B64_ALPHABET[((acc >> bits) & 0x3f) as usize]));
    }
    out
}

/// Derivation codes for qualified material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatterCode {
    /// Ed25519 private seed
    Ed25519Seed,
    /// Ed25519 verification key, non-transferable
    Ed25519N,
    /// Ed25519 verification key, transferable
    Ed25519,
    /// Blake3-256 digest
    Blake3_256,
    /// SHA2-256 digest
    Sha2_256,
    /// 128-bit ordinal
    Salt128,
    /// Ed25519 signature, unindexed
    Ed25519Sig,
    /// ISO-8601 datetime
    DateTime,
}

impl MatterCode {
    /// Code text
    pub fn as_str(self) -> &'static str {
        match self {
            MatterCode::Ed25519Seed => "A",
            MatterCode::Ed25519N => "B",
            MatterCode::Ed25519 => "D",
            MatterCode::Blake3_256 => "E",
            MatterCode::Sha2_256 => "I",
            MatterCode::Salt128 => "0A",
            MatterCode::Ed25519Sig => "0B",
            MatterCode::DateTime => "1AAG",
        }
    }

    /// Raw byte length for this code
    pub fn raw_size(self) -> usize {
        match self {
            MatterCode::Ed25519Seed
            | MatterCode::Ed25519N
            | MatterCode::Ed25519
            | MatterCode::Blake3_256
            | MatterCode::Sha2_256 => 32,
            MatterCode::Salt128 => 16,
            MatterCode::Ed25519Sig => 64,
            MatterCode::DateTime => 24,
        }
    }

    /// Full qb64 length in characters
    pub fn full_size(self) -> usize {
        self.as_str().len() + (self.raw_size() + pad_size(self.raw_size())) * 4 / 3
            - pad_size(self.raw_size())
    }

    /// Full qb2 length in bytes
    pub fn binary_size(self) -> usize {
        self.full_size() * 3 / 4
    }

    /// Resolve a code from the leading characters of qb64 text
    pub fn from_text(text: &[u8]) -> Result<Self> {
        let first = *text.first().ok_or_else(|| KeriError::short(1))?;
        let hard = match first {
            b'0'..=b'9' => {
                let selector = first - b'0';
                match selector {
                    0 => 2,
                    1 => 4,
                    _ => return Err(KeriError::unknown_code(char::from(first).to_string())),
                }
            }
            _ => 1,
        };
        if text.len() < hard {
            return Err(KeriError::short(hard - text.len()));
        }
        let code = std::str::from_utf8(&text[..hard])
            .map_err(|_| KeriError::encoding("non-utf8 derivation code"))?;
        match code {
            "A" => Ok(MatterCode::Ed25519Seed),
            "B" => Ok(MatterCode::Ed25519N),
            "D" => Ok(MatterCode::Ed25519),
            "E" => Ok(MatterCode::Blake3_256),
            "I" => Ok(MatterCode::Sha2_256),
            "0A" => Ok(MatterCode::Salt128),
            "0B" => Ok(MatterCode::Ed25519Sig),
            "1AAG" => Ok(MatterCode::DateTime),
            other => Err(KeriError::unknown_code(other)),
        }
    }

    /// Whether this code names a digest
    pub fn is_digest(self) -> bool {
        matches!(self, MatterCode::Blake3_256 | MatterCode::Sha2_256)
    }

    /// Whether this code names a verification key
    pub fn is_verkey(self) -> bool {
        matches!(self, MatterCode::Ed25519N | MatterCode::Ed25519)
    }
}

impl fmt::Display for MatterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of zero bytes prepended before base64 encoding raw material
pub fn pad_size(raw_len: usize) -> usize {
    (3 - raw_len % 3) % 3
}

/// Encode raw bytes with the pad characters stripped, ready for a code prefix
pub(crate) fn encode_body(raw: &[u8]) -> String {
    let ps = pad_size(raw.len());
    let mut padded = vec![0u8; ps];
    padded.extend_from_slice(raw);
    let text = URL_SAFE_NO_PAD.encode(padded);
    text[ps..].to_string()
}

/// Decode a body produced by [`encode_body`] back into `raw_len` bytes
pub(crate) fn decode_body(body: &[u8], raw_len: usize) -> Result<Vec<u8>> {
    let ps = pad_size(raw_len);
    let mut text = vec![b'A'; ps];
    text.extend_from_slice(body);
    let bytes = URL_SAFE_NO_PAD
        .decode(&text)
        .map_err(|e| KeriError::encoding(format!("base64 body: {e}")))?;
    if bytes.len() != ps + raw_len {
        return Err(KeriError::encoding(format!(
            "decoded {} bytes, expected {}",
            bytes.len(),
            ps + raw_len
        )));
    }
    if bytes[..ps].iter().any(|b| *b != 0) {
        return Err(KeriError::encoding("non-zero pad bits"));
    }
    Ok(bytes[ps..].to_vec())
}

/// Convert qb64 text into its qb2 binary form
pub fn text_to_binary(text: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|e| KeriError::encoding(format!("qb64 to qb2: {e}")))
}

/// Convert qb2 binary into its qb64 text form
pub fn binary_to_text(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A derivation code plus its raw material
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Matter {
    code: MatterCode,
    raw: Vec<u8>,
}

impl Matter {
    /// Create qualified material, checking the raw length against the code
    pub fn new(code: MatterCode, raw: impl Into<Vec<u8>>) -> Result<Self> {
        let raw = raw.into();
        if raw.len() != code.raw_size() {
            return Err(KeriError::invalid(format!(
                "raw size {} does not match code {} (expected {})",
                raw.len(),
                code,
                code.raw_size()
            )));
        }
        Ok(Self { code, raw })
    }

    /// Create material from raw bytes already sized for the code
    pub(crate) fn new_unchecked(code: MatterCode, raw: Vec<u8>) -> Self {
        debug_assert_eq!(raw.len(), code.raw_size());
        Self { code, raw }
    }

    /// Derivation code
    pub fn code(&self) -> MatterCode {
        self.code
    }

    /// Raw material bytes
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Text encoding
    pub fn qb64(&self) -> String {
        let mut out = String::with_capacity(self.code.full_size());
        out.push_str(self.code.as_str());
        out.push_str(&encode_body(&self.raw));
        out
    }

    /// Native binary encoding
    pub fn qb2(&self) -> Vec<u8> {
        // qb64 is always valid base64 of a whole number of quadlets
        text_to_binary(&self.qb64()).unwrap_or_default()
    }

    /// Parse a complete qb64 string
    pub fn from_qb64(text: &str) -> Result<Self> {
        let (matter, used) = Self::parse_qb64(text.as_bytes())?;
        if used != text.len() {
            return Err(KeriError::encoding(format!(
                "trailing characters after {} primitive",
                matter.code
            )));
        }
        Ok(matter)
    }

    /// Parse one primitive from the front of a qb64 stream.
    ///
    /// Returns the primitive and the number of characters consumed.
    pub fn parse_qb64(stream: &[u8]) -> Result<(Self, usize)> {
        let code = MatterCode::from_text(stream)?;
        let fs = code.full_size();
        if stream.len() < fs {
            return Err(KeriError::short(fs - stream.len()));
        }
        let cs = code.as_str().len();
        let raw = decode_body(&stream[cs..fs], code.raw_size())?;
        Ok((Self { code, raw }, fs))
    }

    /// Parse one primitive from the front of a qb2 stream.
    ///
    /// Returns the primitive and the number of bytes consumed.
    pub fn parse_qb2(stream: &[u8]) -> Result<(Self, usize)> {
        if stream.len() < 3 {
            return Err(KeriError::short(3 - stream.len()));
        }
        let prefix = bin_to_text_prefix(stream, 4);
        let code = MatterCode::from_text(prefix.as_bytes())?;
        let bs = code.binary_size();
        if stream.len() < bs {
            return Err(KeriError::short(bs - stream.len()));
        }
        let text = binary_to_text(&stream[..bs]);
        let (matter, _) = Self::parse_qb64(text.as_bytes())?;
        Ok((matter, bs))
    }
}

impl PartialOrd for Matter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Matter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.qb64().cmp(&other.qb64())
    }
}

impl fmt::Debug for Matter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matter({})", self.qb64())
    }
}

impl fmt::Display for Matter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qb64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_sizes() {
        assert_eq!(MatterCode::Ed25519.full_size(), 44);
        assert_eq!(MatterCode::Blake3_256.full_size(), 44);
        assert_eq!(MatterCode::Salt128.full_size(), 24);
        assert_eq!(MatterCode::Ed25519Sig.full_size(), 88);
        assert_eq!(MatterCode::DateTime.full_size(), 36);
    }

    #[test]
    fn test_qb64_qb2_agree() {
        let matter = Matter::new(MatterCode::Blake3_256, vec![7u8; 32]).unwrap();
        let qb64 = matter.qb64();
        assert!(qb64.starts_with('E'));
        assert_eq!(qb64.len(), 44);

        let qb2 = matter.qb2();
        assert_eq!(qb2.len(), 33);
        let (parsed, used) = Matter::parse_qb2(&qb2).unwrap();
        assert_eq!(used, 33);
        assert_eq!(parsed, matter);
    }

    #[test]
    fn test_short_stream() {
        let matter = Matter::new(MatterCode::Ed25519Sig, vec![1u8; 64]).unwrap();
        let qb64 = matter.qb64();
        let err = Matter::parse_qb64(&qb64.as_bytes()[..40]).unwrap_err();
        assert!(err.is_short());
    }

    #[test]
    fn test_wrong_raw_size() {
        assert!(Matter::new(MatterCode::Ed25519, vec![0u8; 31]).is_err());
    }

    #[test]
    fn test_b64_int() {
        assert_eq!(int_to_b64(1, 2).unwrap(), "AB");
        assert_eq!(int_to_b64(64, 2).unwrap(), "BA");
        assert_eq!(b64_to_int(b"BA").unwrap(), 64);
        assert!(int_to_b64(4096, 2).is_err());
    }

    #[test]
    fn test_unknown_code() {
        assert!(matches!(
            MatterCode::from_text(b"Zabc"),
            Err(KeriError::UnknownCode { .. })
        ));
    }
}
