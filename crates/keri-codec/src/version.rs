//! Version marker and cold-start detection
//!
//! Every event body begins (within its first few bytes) with a fixed-width
//! version marker such as `KERI10JSON0000fd_`:
//!
//! | chars | meaning                          |
//! |-------|----------------------------------|
//! | 4     | protocol (`KERI`)                |
//! | 1 + 1 | major, minor version (hex)       |
//! | 4     | serialization kind               |
//! | 6     | body size in bytes (hex)         |
//! | 1     | terminator `_`                   |
//!
//! [`smell`] peeks at it without parsing the body, so a streaming reader
//! knows exactly how many bytes to buffer.

use crate::error::{CodecError, Result};
use std::fmt;

/// Protocol identifier
pub const PROTOCOL: &str = "KERI";

/// Supported protocol version
pub const VERSION: Version = Version { major: 1, minor: 0 };

/// Length of a version marker
pub const VERSION_SIZE: usize = 17;

/// Furthest offset at which a version marker may start
pub const MAX_VERSION_OFFSET: usize = 12;

/// Largest body size representable in the marker
pub const MAX_BODY_SIZE: usize = 0xff_ffff;

/// Protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

/// Body serialization kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Kind {
    /// Compact JSON
    Json,
    /// CBOR map
    Cbor,
    /// MessagePack map
    Mgpk,
}

impl Kind {
    /// Four-character marker code
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Json => "JSON",
            Kind::Cbor => "CBOR",
            Kind::Mgpk => "MGPK",
        }
    }

    fn from_marker(code: &str) -> Result<Self> {
        match code {
            "JSON" => Ok(Kind::Json),
            "CBOR" => Ok(Kind::Cbor),
            "MGPK" => Ok(Kind::Mgpk),
            other => Err(CodecError::Kind(other.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of peeking at a version marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Smellage {
    /// Protocol version
    pub version: Version,
    /// Body serialization kind
    pub kind: Kind,
    /// Declared body size in bytes
    pub size: usize,
}

/// Format a version marker
pub fn version_string(kind: Kind, size: usize) -> String {
    format!(
        "{PROTOCOL}{:x}{:x}{}{:06x}_",
        VERSION.major,
        VERSION.minor,
        kind.as_str(),
        size
    )
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Parse a version marker string
pub fn parse_version_string(marker: &[u8]) -> Result<Smellage> {
    if marker.len() < VERSION_SIZE {
        return Err(CodecError::short(VERSION_SIZE - marker.len()));
    }
    let marker = &marker[..VERSION_SIZE];
    if &marker[..4] != PROTOCOL.as_bytes() {
        return Err(CodecError::Version(String::from_utf8_lossy(marker).into_owned()));
    }
    let major = hex_digit(marker[4]);
    let minor = hex_digit(marker[5]);
    let (Some(major), Some(minor)) = (major, minor) else {
        return Err(CodecError::Version(String::from_utf8_lossy(marker).into_owned()));
    };
    let version = Version { major, minor };
    if version != VERSION {
        return Err(CodecError::Version(format!("{major}.{minor}")));
    }
    let kind_code = std::str::from_utf8(&marker[6..10])
        .map_err(|_| CodecError::Kind(String::from_utf8_lossy(&marker[6..10]).into_owned()))?;
    let kind = Kind::from_marker(kind_code)?;
    let size = marker[10..16].iter().try_fold(0usize, |acc, b| {
        hex_digit(*b)
            .map(|d| (acc << 4) | usize::from(d))
            .ok_or_else(|| CodecError::Version("non-hex body size".into()))
    })?;
    if marker[16] != b'_' {
        return Err(CodecError::Version("missing version terminator".into()));
    }
    Ok(Smellage {
        version,
        kind,
        size,
    })
}

/// Peek at the version marker near the start of `raw`.
///
/// Returns [`CodecError::Short`] when the marker could still arrive.
pub fn smell(raw: &[u8]) -> Result<Smellage> {
    let window = raw.len().min(MAX_VERSION_OFFSET + PROTOCOL.len());
    let start = raw[..window]
        .windows(PROTOCOL.len())
        .position(|w| w == PROTOCOL.as_bytes());
    match start {
        Some(offset) if offset <= MAX_VERSION_OFFSET => {
            parse_version_string(&raw[offset..])
        }
        _ if raw.len() < MAX_VERSION_OFFSET + VERSION_SIZE => {
            Err(CodecError::short(MAX_VERSION_OFFSET + VERSION_SIZE - raw.len()))
        }
        _ => Err(CodecError::Version("no version marker".into())),
    }
}

/// What the first byte of a stream says is coming next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStart {
    /// Event body in the given serialization
    Message(Kind),
    /// Text (qb64) attachment counter
    TextCounter,
    /// Native binary (qb2) attachment counter
    BinaryCounter,
}

/// Classify a stream by its first byte
pub fn sniff(first: u8) -> Result<ColdStart> {
    match first >> 5 {
        0o1 if first == b'-' => Ok(ColdStart::TextCounter),
        0o3 if first == b'{' => Ok(ColdStart::Message(Kind::Json)),
        0o4 | 0o6 => Ok(ColdStart::Message(Kind::Mgpk)),
        0o5 => Ok(ColdStart::Message(Kind::Cbor)),
        0o7 if first >> 2 == 62 => Ok(ColdStart::BinaryCounter),
        _ => Err(CodecError::body(format!(
            "unexpected cold start byte 0x{first:02x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_format() {
        assert_eq!(version_string(Kind::Json, 253), "KERI10JSON0000fd_");
        assert_eq!(version_string(Kind::Cbor, 0), "KERI10CBOR000000_");
    }

    #[test]
    fn test_smell_json() {
        let raw = br#"{"v":"KERI10JSON0000fd_","t":"icp"}"#;
        let smellage = smell(raw).unwrap();
        assert_eq!(smellage.kind, Kind::Json);
        assert_eq!(smellage.size, 253);
    }

    #[test]
    fn test_smell_short() {
        let err = smell(br#"{"v":"KERI1"#).unwrap_err();
        assert!(err.is_short());
    }

    #[test]
    fn test_smell_unknown_protocol() {
        let raw = br#"{"v":"ACDC10JSON0000fd_","t":"icp","d":"x"}"#;
        assert!(matches!(smell(raw), Err(CodecError::Version(_))));
    }

    #[test]
    fn test_smell_unknown_kind() {
        let raw = br#"{"v":"KERI10XML_0000fd_","t":"icp","d":"x"}"#;
        assert!(matches!(smell(raw), Err(CodecError::Kind(_))));
    }

    #[test]
    fn test_smell_wrong_version() {
        let raw = br#"{"v":"KERI20JSON0000fd_","t":"icp","d":"x"}"#;
        assert!(matches!(smell(raw), Err(CodecError::Version(_))));
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff(b'{').unwrap(), ColdStart::Message(Kind::Json));
        assert_eq!(sniff(b'-').unwrap(), ColdStart::TextCounter);
        assert_eq!(sniff(0xa5).unwrap(), ColdStart::Message(Kind::Cbor));
        assert_eq!(sniff(0x8c).unwrap(), ColdStart::Message(Kind::Mgpk));
        assert_eq!(sniff(0xf8).unwrap(), ColdStart::BinaryCounter);
        assert!(sniff(b'x').is_err());
    }
}
