//! Key event bodies
//!
//! [`EventBody`] is the field-for-field wire record shared by every ilk; its
//! optional fields are skipped when absent so the same struct serializes each
//! variant with exactly the labels that variant carries, in protocol order.
//!
//! [`KeyEvent`] is the typed view the key-state machine consumes: a closed
//! sum over the five establishment/interaction variants, built from a body
//! by [`KeyEvent::from_body`] once every qualified field has been decoded.

use crate::error::{CodecError, Result};
use keri_core::{Diger, Prefixer, ThresholdSpec, Verfer};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ilk {
    /// Inception
    Icp,
    /// Rotation
    Rot,
    /// Interaction
    Ixn,
    /// Delegated inception
    Dip,
    /// Delegated rotation
    Drt,
    /// Receipt
    Rct,
}

impl Ilk {
    /// Three-letter tag
    pub fn as_str(self) -> &'static str {
        match self {
            Ilk::Icp => "icp",
            Ilk::Rot => "rot",
            Ilk::Ixn => "ixn",
            Ilk::Dip => "dip",
            Ilk::Drt => "drt",
            Ilk::Rct => "rct",
        }
    }

    /// Parse a three-letter tag
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "icp" => Ok(Ilk::Icp),
            "rot" => Ok(Ilk::Rot),
            "ixn" => Ok(Ilk::Ixn),
            "dip" => Ok(Ilk::Dip),
            "drt" => Ok(Ilk::Drt),
            "rct" => Ok(Ilk::Rct),
            other => Err(CodecError::body(format!("unknown ilk {other:?}"))),
        }
    }

    /// Whether this ilk changes the key configuration
    pub fn is_establishment(self) -> bool {
        matches!(self, Ilk::Icp | Ilk::Rot | Ilk::Dip | Ilk::Drt)
    }

    /// Whether this ilk creates a new identifier
    pub fn is_inception(self) -> bool {
        matches!(self, Ilk::Icp | Ilk::Dip)
    }

    /// Whether this ilk requires a delegator anchor
    pub fn is_delegated(self) -> bool {
        matches!(self, Ilk::Dip | Ilk::Drt)
    }
}

// Plain strings in every serialization kind, not enum encodings
impl Serialize for Ilk {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Ilk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ilk::from_tag(&tag).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Ilk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seal referencing a specific event in some KEL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventSeal {
    /// Identifier
    pub i: String,
    /// Hex sequence number
    pub s: String,
    /// Event SAID
    pub d: String,
}

impl EventSeal {
    /// Seal naming `(prefix, sn, said)`
    pub fn new(prefix: &Prefixer, sn: u64, said: &Diger) -> Self {
        Self {
            i: prefix.qb64(),
            s: format_sn(sn),
            d: said.qb64(),
        }
    }

    /// Whether this seal names exactly `(prefix, sn, said)`
    pub fn matches(&self, prefix: &Prefixer, sn: u64, said: &Diger) -> bool {
        self.i == prefix.qb64() && parse_sn(&self.s).ok() == Some(sn) && self.d == said.qb64()
    }
}

/// Seal naming the latest establishment event of an identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LastEstSeal {
    /// Identifier
    pub i: String,
}

/// Seal over an arbitrary digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DigestSeal {
    /// Digest
    pub d: String,
}

/// Seal over a merkle root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootSeal {
    /// Root digest
    pub rd: String,
}

/// Anchored data carried in an event's `a` field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seal {
    /// `{i,s,d}`
    Event(EventSeal),
    /// `{i}`
    LastEstablishment(LastEstSeal),
    /// `{d}`
    Digest(DigestSeal),
    /// `{rd}`
    Root(RootSeal),
}

/// Configuration trait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigTrait {
    /// Establishment events only; interactions are rejected
    EstablishmentOnly,
    /// Do not delegate; delegated inceptions naming this identifier fail
    DoNotDelegate,
}

impl ConfigTrait {
    /// Wire tag
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigTrait::EstablishmentOnly => "EO",
            ConfigTrait::DoNotDelegate => "DND",
        }
    }

    /// Parse a wire tag; unknown tags are not traits this engine acts on
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "EO" => Some(ConfigTrait::EstablishmentOnly),
            "DND" => Some(ConfigTrait::DoNotDelegate),
            _ => None,
        }
    }
}

impl Serialize for ConfigTrait {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConfigTrait {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        ConfigTrait::from_tag(&tag)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown config trait {tag:?}")))
    }
}

/// Format a sequence number as lowercase hex
pub fn format_sn(sn: u64) -> String {
    format!("{sn:x}")
}

/// Parse a canonical lowercase hex sequence number
pub fn parse_sn(text: &str) -> Result<u64> {
    let canonical = !text.is_empty()
        && text.len() <= 16
        && (text == "0" || !text.starts_with('0'))
        && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !canonical {
        return Err(CodecError::body(format!("invalid hex number {text:?}")));
    }
    u64::from_str_radix(text, 16).map_err(|e| CodecError::body(format!("hex number: {e}")))
}

/// Wire record for every message body.
///
/// Field order is the protocol's label order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventBody {
    /// Version marker
    #[serde(rename = "v")]
    pub version: String,
    /// Ilk
    #[serde(rename = "t")]
    pub ilk: Ilk,
    /// SAID (receipted SAID for receipts)
    #[serde(rename = "d")]
    pub said: String,
    /// Identifier
    #[serde(rename = "i")]
    pub prefix: String,
    /// Hex sequence number
    #[serde(rename = "s")]
    pub sn: String,
    /// Prior event SAID
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<String>,
    /// Signing threshold
    #[serde(rename = "kt", default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<ThresholdSpec>,
    /// Signing keys
    #[serde(rename = "k", default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    /// Next signing threshold
    #[serde(rename = "nt", default, skip_serializing_if = "Option::is_none")]
    pub next_threshold: Option<ThresholdSpec>,
    /// Next key digests
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub next_digests: Option<Vec<String>>,
    /// Hex witness threshold
    #[serde(rename = "bt", default, skip_serializing_if = "Option::is_none")]
    pub toad: Option<String>,
    /// Witnesses (inception)
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub witnesses: Option<Vec<String>>,
    /// Witness cuts (rotation)
    #[serde(rename = "br", default, skip_serializing_if = "Option::is_none")]
    pub cuts: Option<Vec<String>>,
    /// Witness adds (rotation)
    #[serde(rename = "ba", default, skip_serializing_if = "Option::is_none")]
    pub adds: Option<Vec<String>>,
    /// Configuration traits
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Vec<String>>,
    /// Seals
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub seals: Option<Vec<Seal>>,
    /// Delegator
    #[serde(rename = "di", default, skip_serializing_if = "Option::is_none")]
    pub delegator: Option<String>,
}

impl EventBody {
    /// Bare body with the fields every ilk carries
    pub fn new(ilk: Ilk, prefix: impl Into<String>, sn: u64) -> Self {
        Self {
            version: String::new(),
            ilk,
            said: String::new(),
            prefix: prefix.into(),
            sn: format_sn(sn),
            prior: None,
            threshold: None,
            keys: None,
            next_threshold: None,
            next_digests: None,
            toad: None,
            witnesses: None,
            cuts: None,
            adds: None,
            config: None,
            seals: None,
            delegator: None,
        }
    }

    /// Check that exactly the labels of this body's ilk are present
    pub fn check_fields(&self) -> Result<()> {
        let establishment = self.ilk.is_establishment();
        let present = [
            ("p", self.prior.is_some(), matches!(self.ilk, Ilk::Rot | Ilk::Drt | Ilk::Ixn)),
            ("kt", self.threshold.is_some(), establishment),
            ("k", self.keys.is_some(), establishment),
            ("nt", self.next_threshold.is_some(), establishment),
            ("n", self.next_digests.is_some(), establishment),
            ("bt", self.toad.is_some(), establishment),
            ("b", self.witnesses.is_some(), self.ilk.is_inception()),
            ("br", self.cuts.is_some(), matches!(self.ilk, Ilk::Rot | Ilk::Drt)),
            ("ba", self.adds.is_some(), matches!(self.ilk, Ilk::Rot | Ilk::Drt)),
            ("c", self.config.is_some(), self.ilk.is_inception()),
            ("a", self.seals.is_some(), self.ilk != Ilk::Rct),
            ("di", self.delegator.is_some(), self.ilk == Ilk::Dip),
        ];
        for (label, has, expected) in present {
            if has != expected {
                let verb = if has { "unexpected" } else { "missing" };
                return Err(CodecError::body(format!(
                    "{verb} field '{label}' in {} body",
                    self.ilk
                )));
            }
        }
        Ok(())
    }
}

/// Signing keys, thresholds and next-key commitment of an establishment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConfig {
    /// Current signing keys
    pub keys: Vec<Verfer>,
    /// Current signing threshold
    pub threshold: ThresholdSpec,
    /// Next signing threshold
    pub next_threshold: ThresholdSpec,
    /// Digests of the committed next keys
    pub next_digests: Vec<Diger>,
}

/// Inception payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InceptionEvent {
    /// Key configuration
    pub key_config: KeyConfig,
    /// Witness threshold
    pub toad: u64,
    /// Initial witnesses
    pub witnesses: Vec<Prefixer>,
    /// Configuration traits
    pub config: Vec<ConfigTrait>,
    /// Anchored seals
    pub seals: Vec<Seal>,
}

/// Rotation payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEvent {
    /// Prior event SAID
    pub prior: Diger,
    /// New key configuration
    pub key_config: KeyConfig,
    /// Witness threshold after the witness delta
    pub toad: u64,
    /// Witnesses removed
    pub cuts: Vec<Prefixer>,
    /// Witnesses added
    pub adds: Vec<Prefixer>,
    /// Anchored seals
    pub seals: Vec<Seal>,
}

/// Interaction payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionEvent {
    /// Prior event SAID
    pub prior: Diger,
    /// Anchored seals
    pub seals: Vec<Seal>,
}

/// Variant-specific event content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// `icp`
    Inception(InceptionEvent),
    /// `rot`
    Rotation(RotationEvent),
    /// `ixn`
    Interaction(InteractionEvent),
    /// `dip`
    DelegatedInception {
        /// Inception payload
        inception: InceptionEvent,
        /// Delegator identifier
        delegator: Prefixer,
    },
    /// `drt`
    DelegatedRotation(RotationEvent),
}

/// Typed key event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Identifier
    pub prefix: Prefixer,
    /// Sequence number
    pub sn: u64,
    /// Event SAID
    pub said: Diger,
    /// Variant content
    pub kind: EventKind,
}

fn required<'a, T>(field: &'a Option<T>, label: &str) -> Result<&'a T> {
    field
        .as_ref()
        .ok_or_else(|| CodecError::body(format!("missing field '{label}'")))
}

fn decode_all<T>(
    items: &[String],
    decode: impl Fn(&str) -> keri_core::Result<T>,
) -> Result<Vec<T>> {
    items
        .iter()
        .map(|item| decode(item).map_err(CodecError::from))
        .collect()
}

fn key_config(body: &EventBody) -> Result<KeyConfig> {
    Ok(KeyConfig {
        keys: decode_all(required(&body.keys, "k")?, Verfer::from_qb64)?,
        threshold: required(&body.threshold, "kt")?.clone(),
        next_threshold: required(&body.next_threshold, "nt")?.clone(),
        next_digests: decode_all(required(&body.next_digests, "n")?, Diger::from_qb64)?,
    })
}

fn inception(body: &EventBody) -> Result<InceptionEvent> {
    Ok(InceptionEvent {
        key_config: key_config(body)?,
        toad: parse_sn(required(&body.toad, "bt")?)?,
        witnesses: decode_all(required(&body.witnesses, "b")?, Prefixer::from_qb64)?,
        config: required(&body.config, "c")?
            .iter()
            .filter_map(|tag| ConfigTrait::from_tag(tag))
            .collect(),
        seals: required(&body.seals, "a")?.clone(),
    })
}

fn rotation(body: &EventBody) -> Result<RotationEvent> {
    Ok(RotationEvent {
        prior: Diger::from_qb64(required(&body.prior, "p")?)?,
        key_config: key_config(body)?,
        toad: parse_sn(required(&body.toad, "bt")?)?,
        cuts: decode_all(required(&body.cuts, "br")?, Prefixer::from_qb64)?,
        adds: decode_all(required(&body.adds, "ba")?, Prefixer::from_qb64)?,
        seals: required(&body.seals, "a")?.clone(),
    })
}

impl KeyEvent {
    /// Decode the typed view of a key event body
    pub fn from_body(body: &EventBody) -> Result<Self> {
        body.check_fields()?;
        let kind = match body.ilk {
            Ilk::Icp => EventKind::Inception(inception(body)?),
            Ilk::Dip => EventKind::DelegatedInception {
                inception: inception(body)?,
                delegator: Prefixer::from_qb64(required(&body.delegator, "di")?)?,
            },
            Ilk::Rot => EventKind::Rotation(rotation(body)?),
            Ilk::Drt => EventKind::DelegatedRotation(rotation(body)?),
            Ilk::Ixn => EventKind::Interaction(InteractionEvent {
                prior: Diger::from_qb64(required(&body.prior, "p")?)?,
                seals: required(&body.seals, "a")?.clone(),
            }),
            Ilk::Rct => return Err(CodecError::body("receipt is not a key event")),
        };
        Ok(Self {
            prefix: Prefixer::from_qb64(&body.prefix)?,
            sn: parse_sn(&body.sn)?,
            said: Diger::from_qb64(&body.said)?,
            kind,
        })
    }

    /// Ilk of this event
    pub fn ilk(&self) -> Ilk {
        match &self.kind {
            EventKind::Inception(_) => Ilk::Icp,
            EventKind::Rotation(_) => Ilk::Rot,
            EventKind::Interaction(_) => Ilk::Ixn,
            EventKind::DelegatedInception { .. } => Ilk::Dip,
            EventKind::DelegatedRotation(_) => Ilk::Drt,
        }
    }

    /// Key configuration, for establishment events
    pub fn key_config(&self) -> Option<&KeyConfig> {
        match &self.kind {
            EventKind::Inception(icp) | EventKind::DelegatedInception { inception: icp, .. } => {
                Some(&icp.key_config)
            }
            EventKind::Rotation(rot) | EventKind::DelegatedRotation(rot) => Some(&rot.key_config),
            EventKind::Interaction(_) => None,
        }
    }

    /// Prior event SAID, absent for inceptions
    pub fn prior(&self) -> Option<&Diger> {
        match &self.kind {
            EventKind::Rotation(rot) | EventKind::DelegatedRotation(rot) => Some(&rot.prior),
            EventKind::Interaction(ixn) => Some(&ixn.prior),
            EventKind::Inception(_) | EventKind::DelegatedInception { .. } => None,
        }
    }

    /// Anchored seals
    pub fn seals(&self) -> &[Seal] {
        match &self.kind {
            EventKind::Inception(icp) | EventKind::DelegatedInception { inception: icp, .. } => {
                &icp.seals
            }
            EventKind::Rotation(rot) | EventKind::DelegatedRotation(rot) => &rot.seals,
            EventKind::Interaction(ixn) => &ixn.seals,
        }
    }
}

/// Receipt body naming a receipted event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptBody {
    /// Receipted identifier
    pub prefix: Prefixer,
    /// Receipted sequence number
    pub sn: u64,
    /// Receipted event SAID
    pub said: Diger,
}

impl ReceiptBody {
    /// Decode a `rct` body
    pub fn from_body(body: &EventBody) -> Result<Self> {
        if body.ilk != Ilk::Rct {
            return Err(CodecError::body(format!("{} is not a receipt", body.ilk)));
        }
        body.check_fields()?;
        Ok(Self {
            prefix: Prefixer::from_qb64(&body.prefix)?,
            sn: parse_sn(&body.sn)?,
            said: Diger::from_qb64(&body.said)?,
        })
    }
}
