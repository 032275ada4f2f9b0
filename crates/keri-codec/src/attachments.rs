//! Attachment groups
//!
//! Signatures and receipts trail the event body as count-prefixed groups.
//! Each group starts with a four-character counter (`-A##`): a two-character
//! code naming the group and a two-digit base64 item count. The native binary
//! framing is the base64 decoding of the same text, so a counter is three
//! bytes and every item is a whole number of byte triplets.
//!
//! A `-V` counter wraps any run of groups and counts the quadlets (or
//! triplets) it spans, letting a stream reader buffer the whole run before
//! decoding it. Without the wrapper a run ends at the first byte that does
//! not start a counter, or at the end of the buffer.

use crate::error::{CodecError, Result};
use keri_core::matter::{b64_to_int, bin_to_text_prefix, int_to_b64, text_to_binary};
use keri_core::{Cigar, Dater, Diger, Matter, Prefixer, Seqner, Siger, Verfer};

/// Length of a text counter
pub const COUNTER_SIZE: usize = 4;

/// Length of a binary counter
pub const COUNTER_BINARY_SIZE: usize = 3;

/// Largest count a two-digit counter carries
pub const MAX_COUNT: u32 = 64 * 64 - 1;

/// Group codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterCode {
    /// `-A` controller indexed signatures
    ControllerIdxSigs,
    /// `-B` witness indexed signatures
    WitnessIdxSigs,
    /// `-C` non-transferable receipt couples
    NonTransReceiptCouples,
    /// `-D` transferable receipt quadruples
    TransReceiptQuadruples,
    /// `-E` first-seen replay couples
    FirstSeenReplayCouples,
    /// `-G` source seal couples
    SealSourceCouples,
    /// `-V` attached material quadlets
    AttachmentGroup,
}

impl CounterCode {
    /// Two-character code
    pub fn as_str(self) -> &'static str {
        match self {
            CounterCode::ControllerIdxSigs => "-A",
            CounterCode::WitnessIdxSigs => "-B",
            CounterCode::NonTransReceiptCouples => "-C",
            CounterCode::TransReceiptQuadruples => "-D",
            CounterCode::FirstSeenReplayCouples => "-E",
            CounterCode::SealSourceCouples => "-G",
            CounterCode::AttachmentGroup => "-V",
        }
    }

    fn from_text(code: &[u8]) -> Result<Self> {
        match code {
            b"-A" => Ok(CounterCode::ControllerIdxSigs),
            b"-B" => Ok(CounterCode::WitnessIdxSigs),
            b"-C" => Ok(CounterCode::NonTransReceiptCouples),
            b"-D" => Ok(CounterCode::TransReceiptQuadruples),
            b"-E" => Ok(CounterCode::FirstSeenReplayCouples),
            b"-G" => Ok(CounterCode::SealSourceCouples),
            b"-V" => Ok(CounterCode::AttachmentGroup),
            other => Err(CodecError::attachment(format!(
                "unknown counter code {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Group counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Group code
    pub code: CounterCode,
    /// Item count (quadlet count for `-V`)
    pub count: u32,
}

impl Counter {
    /// Build a counter, checking the count fits in two digits
    pub fn new(code: CounterCode, count: usize) -> Result<Self> {
        let count = u32::try_from(count)
            .ok()
            .filter(|c| *c <= MAX_COUNT)
            .ok_or_else(|| CodecError::attachment(format!("count {count} too large")))?;
        Ok(Self { code, count })
    }

    /// Text encoding
    pub fn qb64(&self) -> String {
        // count is bounded by MAX_COUNT at construction
        let digits = int_to_b64(u64::from(self.count), 2).unwrap_or_default();
        format!("{}{digits}", self.code.as_str())
    }

    /// Native binary encoding
    pub fn qb2(&self) -> Vec<u8> {
        text_to_binary(&self.qb64()).unwrap_or_default()
    }

    /// Parse a counter from the front of a text stream
    pub fn parse_qb64(stream: &[u8]) -> Result<Self> {
        if stream.len() < COUNTER_SIZE {
            return Err(CodecError::short(COUNTER_SIZE - stream.len()));
        }
        let code = CounterCode::from_text(&stream[..2])?;
        let count = b64_to_int(&stream[2..COUNTER_SIZE])? as u32;
        Ok(Self { code, count })
    }

    /// Parse a counter from the front of a binary stream
    pub fn parse_qb2(stream: &[u8]) -> Result<Self> {
        if stream.len() < COUNTER_BINARY_SIZE {
            return Err(CodecError::short(COUNTER_BINARY_SIZE - stream.len()));
        }
        let text = bin_to_text_prefix(&stream[..COUNTER_BINARY_SIZE], COUNTER_SIZE);
        Self::parse_qb64(text.as_bytes())
    }
}

/// Whether `byte` starts a counter in the given framing
pub fn starts_counter(byte: u8, binary: bool) -> bool {
    if binary {
        byte >> 2 == 62
    } else {
        byte == b'-'
    }
}

/// Transferable receipt: receiptor establishment event plus its signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransReceipt {
    /// Receiptor identifier
    pub prefix: Prefixer,
    /// Sequence number of the receiptor's establishment event
    pub seqner: Seqner,
    /// SAID of the receiptor's establishment event
    pub said: Diger,
    /// Indexed signature by the receiptor's key at that event
    pub siger: Siger,
}

/// First-seen ordinal and datetime attached to replayed events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstSeen {
    /// First-seen ordinal in the source KEL
    pub fn_ordinal: Seqner,
    /// First-seen datetime in the source KEL
    pub dater: Dater,
}

/// Delegator event that anchors a delegated event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSeal {
    /// Delegator event sequence number
    pub seqner: Seqner,
    /// Delegator event SAID
    pub said: Diger,
}

/// Every attachment group that may trail a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachments {
    /// `-A` controller signatures
    pub controller_sigs: Vec<Siger>,
    /// `-B` witness signatures
    pub witness_sigs: Vec<Siger>,
    /// `-C` non-transferable receipts, each carrying its receiptor key
    pub receipts: Vec<Cigar>,
    /// `-D` transferable receipts
    pub trans_receipts: Vec<TransReceipt>,
    /// `-E` first-seen replay couples
    pub first_seen: Vec<FirstSeen>,
    /// `-G` source seal couples
    pub source_seals: Vec<SourceSeal>,
}

/// Cursor over one attachment run in either framing
struct Reader<'a> {
    stream: &'a [u8],
    offset: usize,
    binary: bool,
    nested: bool,
}

impl<'a> Reader<'a> {
    fn rest(&self) -> &'a [u8] {
        &self.stream[self.offset..]
    }

    fn matter(&mut self) -> Result<Matter> {
        let (matter, used) = if self.binary {
            Matter::parse_qb2(self.rest())?
        } else {
            Matter::parse_qb64(self.rest())?
        };
        self.offset += used;
        Ok(matter)
    }

    fn siger(&mut self) -> Result<Siger> {
        let (siger, used) = if self.binary {
            Siger::parse_qb2(self.rest())?
        } else {
            Siger::parse_qb64(self.rest())?
        };
        self.offset += used;
        Ok(siger)
    }

    fn counter(&mut self) -> Result<Counter> {
        let counter = if self.binary {
            Counter::parse_qb2(self.rest())?
        } else {
            Counter::parse_qb64(self.rest())?
        };
        self.offset += if self.binary {
            COUNTER_BINARY_SIZE
        } else {
            COUNTER_SIZE
        };
        Ok(counter)
    }

    fn group(&mut self, counter: Counter, into: &mut Attachments) -> Result<()> {
        let count = counter.count as usize;
        match counter.code {
            CounterCode::ControllerIdxSigs => {
                for _ in 0..count {
                    into.controller_sigs.push(self.siger()?);
                }
            }
            CounterCode::WitnessIdxSigs => {
                for _ in 0..count {
                    into.witness_sigs.push(self.siger()?);
                }
            }
            CounterCode::NonTransReceiptCouples => {
                for _ in 0..count {
                    let verfer = Verfer::from_matter(self.matter()?)?;
                    let sig = self.matter()?;
                    into.receipts.push(Cigar::from_matter(sig, Some(verfer))?);
                }
            }
            CounterCode::TransReceiptQuadruples => {
                for _ in 0..count {
                    let prefix = Prefixer::from_matter(self.matter()?)?;
                    let seqner = Seqner::from_matter(&self.matter()?)?;
                    let said = Diger::from_matter(self.matter()?)?;
                    let siger = self.siger()?;
                    into.trans_receipts.push(TransReceipt {
                        prefix,
                        seqner,
                        said,
                        siger,
                    });
                }
            }
            CounterCode::FirstSeenReplayCouples => {
                for _ in 0..count {
                    let fn_ordinal = Seqner::from_matter(&self.matter()?)?;
                    let dater = Dater::from_matter(&self.matter()?)?;
                    into.first_seen.push(FirstSeen { fn_ordinal, dater });
                }
            }
            CounterCode::SealSourceCouples => {
                for _ in 0..count {
                    let seqner = Seqner::from_matter(&self.matter()?)?;
                    let said = Diger::from_matter(self.matter()?)?;
                    into.source_seals.push(SourceSeal { seqner, said });
                }
            }
            CounterCode::AttachmentGroup => {
                self.framed(counter, into)?;
            }
        }
        Ok(())
    }

    /// Decode the groups inside a `-V` span.
    ///
    /// The span has fully arrived before decoding starts, so running out of
    /// bytes inside it means the contents are malformed, not pending.
    fn framed(&mut self, counter: Counter, into: &mut Attachments) -> Result<()> {
        if self.nested {
            return Err(CodecError::attachment("nested attachment group"));
        }
        let width = if self.binary { 3 } else { 4 };
        let span = counter.count as usize * width;
        if self.rest().len() < span {
            return Err(CodecError::short(span - self.rest().len()));
        }
        let mut inner = Reader {
            stream: &self.rest()[..span],
            offset: 0,
            binary: self.binary,
            nested: true,
        };
        inner.run(into).map_err(|err| {
            if err.is_short() {
                CodecError::attachment("attachment group contents truncated")
            } else {
                err
            }
        })?;
        if inner.offset != span {
            return Err(CodecError::attachment(
                "attachment group length disagrees with contents",
            ));
        }
        self.offset += span;
        Ok(())
    }

    /// Decode groups until the run ends
    fn run(&mut self, into: &mut Attachments) -> Result<()> {
        while let Some(first) = self.rest().first() {
            if !starts_counter(*first, self.binary) {
                break;
            }
            let counter = self.counter()?;
            self.group(counter, into)?;
        }
        Ok(())
    }
}

impl Attachments {
    /// Whether no group is present
    pub fn is_empty(&self) -> bool {
        self.controller_sigs.is_empty()
            && self.witness_sigs.is_empty()
            && self.receipts.is_empty()
            && self.trans_receipts.is_empty()
            && self.first_seen.is_empty()
            && self.source_seals.is_empty()
    }

    /// Parse the attachment run at the front of `stream`.
    ///
    /// Returns the groups and the number of bytes consumed. A group whose
    /// items have not fully arrived yields a short error.
    pub fn parse(stream: &[u8], binary: bool) -> Result<(Self, usize)> {
        let mut attachments = Attachments::default();
        let mut reader = Reader {
            stream,
            offset: 0,
            binary,
            nested: false,
        };
        reader.run(&mut attachments)?;
        Ok((attachments, reader.offset))
    }

    fn push_group(out: &mut String, code: CounterCode, items: &[String]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        out.push_str(&Counter::new(code, items.len())?.qb64());
        for item in items {
            out.push_str(item);
        }
        Ok(())
    }

    /// Text encoding of every group, unframed
    pub fn to_qb64(&self) -> Result<String> {
        let mut out = String::new();
        let sigs: Vec<String> = self.controller_sigs.iter().map(Siger::qb64).collect();
        Self::push_group(&mut out, CounterCode::ControllerIdxSigs, &sigs)?;
        let wigs: Vec<String> = self.witness_sigs.iter().map(Siger::qb64).collect();
        Self::push_group(&mut out, CounterCode::WitnessIdxSigs, &wigs)?;
        let couples = self
            .receipts
            .iter()
            .map(|cigar| {
                let verfer = cigar.verfer().ok_or_else(|| {
                    CodecError::attachment("non-transferable receipt without receiptor key")
                })?;
                Ok(format!("{}{}", verfer.qb64(), cigar.qb64()))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::push_group(&mut out, CounterCode::NonTransReceiptCouples, &couples)?;
        let quads: Vec<String> = self
            .trans_receipts
            .iter()
            .map(|r| {
                format!(
                    "{}{}{}{}",
                    r.prefix.qb64(),
                    r.seqner.qb64(),
                    r.said.qb64(),
                    r.siger.qb64()
                )
            })
            .collect();
        Self::push_group(&mut out, CounterCode::TransReceiptQuadruples, &quads)?;
        let firsts: Vec<String> = self
            .first_seen
            .iter()
            .map(|f| format!("{}{}", f.fn_ordinal.qb64(), f.dater.qb64()))
            .collect();
        Self::push_group(&mut out, CounterCode::FirstSeenReplayCouples, &firsts)?;
        let sources: Vec<String> = self
            .source_seals
            .iter()
            .map(|s| format!("{}{}", s.seqner.qb64(), s.said.qb64()))
            .collect();
        Self::push_group(&mut out, CounterCode::SealSourceCouples, &sources)?;
        Ok(out)
    }

    /// Text encoding wrapped in a `-V` group
    pub fn to_qb64_framed(&self) -> Result<String> {
        let inner = self.to_qb64()?;
        if inner.is_empty() {
            return Ok(inner);
        }
        let counter = Counter::new(CounterCode::AttachmentGroup, inner.len() / 4)?;
        Ok(format!("{}{inner}", counter.qb64()))
    }

    /// Native binary encoding of every group, unframed
    pub fn to_qb2(&self) -> Result<Vec<u8>> {
        Ok(text_to_binary(&self.to_qb64()?)?)
    }

    /// Native binary encoding wrapped in a `-V` group
    pub fn to_qb2_framed(&self) -> Result<Vec<u8>> {
        Ok(text_to_binary(&self.to_qb64_framed()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use keri_core::Signer;

    fn signer(byte: u8) -> Signer {
        Signer::from_seed([byte; 32], true)
    }

    fn sample() -> Attachments {
        let ser = b"event";
        let controller = signer(1);
        let witness = Signer::from_seed([2; 32], false);
        Attachments {
            controller_sigs: vec![
                controller.sign_indexed(ser, 0).unwrap(),
                signer(3).sign_indexed(ser, 1).unwrap(),
            ],
            witness_sigs: vec![witness.sign_indexed(ser, 0).unwrap()],
            receipts: vec![witness.sign(ser)],
            trans_receipts: vec![TransReceipt {
                prefix: Prefixer::from(controller.verfer()),
                seqner: Seqner(0),
                said: Diger::new(b"receiptor icp"),
                siger: controller.sign_indexed(ser, 0).unwrap(),
            }],
            first_seen: vec![FirstSeen {
                fn_ordinal: Seqner(7),
                dater: Dater(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            }],
            source_seals: vec![SourceSeal {
                seqner: Seqner(3),
                said: Diger::new(b"delegator ixn"),
            }],
        }
    }

    #[test]
    fn test_counter_text() {
        let counter = Counter::new(CounterCode::ControllerIdxSigs, 2).unwrap();
        assert_eq!(counter.qb64(), "-AAC");
        assert_eq!(Counter::parse_qb64(b"-AAC").unwrap(), counter);
        assert_eq!(Counter::parse_qb2(&counter.qb2()).unwrap(), counter);
        assert!(Counter::new(CounterCode::ControllerIdxSigs, 4096).is_err());
    }

    #[test]
    fn test_unknown_counter_rejected() {
        let err = Counter::parse_qb64(b"-ZAB").unwrap_err();
        assert!(matches!(err, CodecError::Attachment(_)));
    }

    #[test]
    fn test_text_run_stops_at_next_message() {
        let attachments = sample();
        let text = attachments.to_qb64().unwrap();
        let mut stream = text.clone().into_bytes();
        stream.extend_from_slice(br#"{"v":"KERI10JSON"#);
        let (parsed, used) = Attachments::parse(&stream, false).unwrap();
        assert_eq!(used, text.len());
        assert_eq!(parsed, attachments);
    }

    #[test]
    fn test_binary_and_framed_forms_agree() {
        let attachments = sample();
        let qb2 = attachments.to_qb2().unwrap();
        let (parsed, used) = Attachments::parse(&qb2, true).unwrap();
        assert_eq!(used, qb2.len());
        assert_eq!(parsed, attachments);

        let framed = attachments.to_qb64_framed().unwrap();
        assert!(framed.starts_with("-V"));
        let (parsed, _) = Attachments::parse(framed.as_bytes(), false).unwrap();
        assert_eq!(parsed, attachments);

        let framed = attachments.to_qb2_framed().unwrap();
        let (parsed, _) = Attachments::parse(&framed, true).unwrap();
        assert_eq!(parsed, attachments);
    }

    #[test]
    fn test_partial_group_is_short() {
        let text = sample().to_qb64().unwrap();
        let err = Attachments::parse(&text.as_bytes()[..50], false).unwrap_err();
        assert!(err.is_short());

        let framed = sample().to_qb64_framed().unwrap();
        let err = Attachments::parse(&framed.as_bytes()[..framed.len() - 1], false).unwrap_err();
        assert!(err.is_short());
    }

    #[test]
    fn test_truncated_group_inside_frame_is_malformed() {
        // The frame spans one quadlet but the signature group inside it
        // claims a signature that does not fit
        let err = Attachments::parse(b"-VAB-AAB", false).unwrap_err();
        assert!(!err.is_short());
        assert!(matches!(err, CodecError::Attachment(_)));

        let err = Attachments::parse(&text_to_binary("-VAB-AAB").unwrap(), true).unwrap_err();
        assert!(matches!(err, CodecError::Attachment(_)));
    }

    #[test]
    fn test_nested_frame_rejected() {
        let inner = sample().to_qb64_framed().unwrap();
        let outer = Counter::new(CounterCode::AttachmentGroup, inner.len() / 4).unwrap();
        let nested = format!("{}{inner}", outer.qb64());
        let err = Attachments::parse(nested.as_bytes(), false).unwrap_err();
        assert!(matches!(err, CodecError::Attachment(ref msg) if msg.contains("nested")));
    }

    #[test]
    fn test_empty_attachments() {
        let (parsed, used) = Attachments::parse(b"", false).unwrap();
        assert!(parsed.is_empty());
        assert_eq!(used, 0);
        assert_eq!(Attachments::default().to_qb64_framed().unwrap(), "");
    }
}
