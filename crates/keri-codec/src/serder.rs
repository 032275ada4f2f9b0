//! Serialized event bodies
//!
//! A [`Serder`] pairs the exact bytes of a message body with its decoded
//! [`EventBody`]. Signatures are always checked over [`Serder::raw`], never
//! over a re-serialization.
//!
//! The SAID of a body is computed by filling the `d` field (and for
//! self-addressing inceptions the `i` field) with a placeholder of the
//! digest's width, fixing the version marker size, hashing the result and
//! substituting the digest back in.

use crate::error::{CodecError, Result};
use crate::event::{parse_sn, EventBody, Ilk, KeyEvent, ReceiptBody};
use crate::version::{parse_version_string, smell, version_string, Kind, MAX_BODY_SIZE};
use keri_core::{Diger, DigestAlgorithm, MatterCode, Prefixer, DEFAULT_DIGEST};

/// Placeholder character for SAID computation
pub const DUMMY: char = '#';

fn placeholder() -> String {
    DUMMY
        .to_string()
        .repeat(MatterCode::Blake3_256.full_size())
}

/// Serialize a body without touching its version marker
pub fn dump(body: &EventBody, kind: Kind) -> Result<Vec<u8>> {
    match kind {
        Kind::Json => {
            serde_json::to_vec(body).map_err(|e| CodecError::Serialize(e.to_string()))
        }
        Kind::Cbor => {
            serde_cbor::to_vec(body).map_err(|e| CodecError::Serialize(e.to_string()))
        }
        Kind::Mgpk => {
            rmp_serde::to_vec_named(body).map_err(|e| CodecError::Serialize(e.to_string()))
        }
    }
}

/// Deserialize a body of known kind
pub fn load(raw: &[u8], kind: Kind) -> Result<EventBody> {
    match kind {
        Kind::Json => serde_json::from_slice(raw).map_err(|e| CodecError::body(e.to_string())),
        Kind::Cbor => serde_cbor::from_slice(raw).map_err(|e| CodecError::body(e.to_string())),
        Kind::Mgpk => rmp_serde::from_slice(raw).map_err(|e| CodecError::body(e.to_string())),
    }
}

/// Serialize with the version marker carrying the final size
fn sized(mut body: EventBody, kind: Kind) -> Result<(EventBody, Vec<u8>)> {
    body.version = version_string(kind, 0);
    let size = dump(&body, kind)?.len();
    if size > MAX_BODY_SIZE {
        return Err(CodecError::Serialize(format!("body of {size} bytes too large")));
    }
    body.version = version_string(kind, size);
    let raw = dump(&body, kind)?;
    Ok((body, raw))
}

/// Whether the SAID also stands in for the identifier
fn self_addressing(body: &EventBody) -> bool {
    body.ilk.is_inception() && (body.prefix.is_empty() || body.prefix == body.said)
}

/// Compute the SAID of `body` under `algorithm`
pub fn compute_said(body: &EventBody, kind: Kind, algorithm: DigestAlgorithm) -> Result<Diger> {
    let mut dummy = body.clone();
    let self_addressing = self_addressing(&dummy);
    dummy.said = placeholder();
    if self_addressing {
        dummy.prefix = placeholder();
    }
    let (_, raw) = sized(dummy, kind)?;
    Ok(Diger::with_algorithm(algorithm, &raw))
}

/// Exact body bytes plus their decoded form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Serder {
    raw: Vec<u8>,
    kind: Kind,
    body: EventBody,
}

impl Serder {
    /// Serialize `body` with its size fixed but its SAID left as given
    pub fn new(body: EventBody, kind: Kind) -> Result<Self> {
        let (body, raw) = sized(body, kind)?;
        Ok(Self { raw, kind, body })
    }

    /// Compute and embed the SAID, then serialize.
    ///
    /// An inception whose identifier is empty becomes self-addressing: the
    /// identifier is set to the SAID as well.
    pub fn saidify(mut body: EventBody, kind: Kind) -> Result<Self> {
        let self_addressing = body.ilk.is_inception() && body.prefix.is_empty();
        let said = compute_said(&body, kind, DEFAULT_DIGEST)?.qb64();
        if self_addressing {
            body.prefix = said.clone();
        }
        body.said = said;
        Self::new(body, kind)
    }

    /// Parse one body from the front of `stream`.
    ///
    /// Returns the body and the number of bytes consumed, or a short error
    /// when the declared size has not fully arrived.
    pub fn parse(stream: &[u8]) -> Result<(Self, usize)> {
        let smellage = smell(stream)?;
        if stream.len() < smellage.size {
            return Err(CodecError::short(smellage.size - stream.len()));
        }
        let raw = &stream[..smellage.size];
        let body = load(raw, smellage.kind)?;
        let declared = parse_version_string(body.version.as_bytes())?;
        if declared != smellage || body.version.len() != crate::version::VERSION_SIZE {
            return Err(CodecError::body(format!(
                "version field {} disagrees with framing",
                body.version
            )));
        }
        Ok((
            Self {
                raw: raw.to_vec(),
                kind: smellage.kind,
                body,
            },
            smellage.size,
        ))
    }

    /// Exact serialized bytes
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Serialization kind
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Decoded body
    pub fn body(&self) -> &EventBody {
        &self.body
    }

    /// Message ilk
    pub fn ilk(&self) -> Ilk {
        self.body.ilk
    }

    /// Declared SAID
    pub fn said(&self) -> Result<Diger> {
        Ok(Diger::from_qb64(&self.body.said)?)
    }

    /// Declared identifier
    pub fn prefix(&self) -> Result<Prefixer> {
        Ok(Prefixer::from_qb64(&self.body.prefix)?)
    }

    /// Declared sequence number
    pub fn sn(&self) -> Result<u64> {
        parse_sn(&self.body.sn)
    }

    /// Whether the declared SAID is the digest of this body.
    ///
    /// Receipts carry the receipted event's SAID and always pass.
    pub fn verify_said(&self) -> bool {
        if self.body.ilk == Ilk::Rct {
            return true;
        }
        let Ok(declared) = self.said() else {
            return false;
        };
        match compute_said(&self.body, self.kind, declared.algorithm()) {
            Ok(computed) => computed == declared,
            Err(_) => false,
        }
    }

    /// Typed key event view
    pub fn key_event(&self) -> Result<KeyEvent> {
        KeyEvent::from_body(&self.body)
    }

    /// Typed receipt view
    pub fn receipt(&self) -> Result<ReceiptBody> {
        ReceiptBody::from_body(&self.body)
    }
}
