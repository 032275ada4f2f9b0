//! Event builders
//!
//! Builders assemble well-formed bodies, compute the SAID and version size,
//! and return the finished [`Serder`]. Signing is left to the caller since
//! signatures cover the exact serialized bytes.

use crate::error::{CodecError, Result};
use crate::event::{format_sn, ConfigTrait, EventBody, Ilk, Seal};
use crate::serder::Serder;
use crate::version::Kind;
use keri_core::{ample, Diger, Prefixer, ThresholdSpec, Verfer};

/// Digests committing to a next key set
pub fn next_digests(keys: &[Verfer]) -> Vec<Diger> {
    keys.iter().map(|k| Diger::new(k.qb64().as_bytes())).collect()
}

/// Majority threshold for `n` keys, at least one
fn default_threshold(n: usize) -> ThresholdSpec {
    ThresholdSpec::count(n.div_ceil(2).max(1) as u64)
}

/// Majority threshold for `n` next keys, zero when none are committed
fn default_next_threshold(n: usize) -> ThresholdSpec {
    ThresholdSpec::count(n.div_ceil(2) as u64)
}

fn qb64s<'a, T: 'a>(items: impl IntoIterator<Item = &'a T>, f: impl Fn(&T) -> String) -> Vec<String> {
    items.into_iter().map(f).collect()
}

/// Builder for `icp` and `dip`
#[derive(Debug, Clone)]
pub struct InceptionBuilder {
    keys: Vec<Verfer>,
    threshold: Option<ThresholdSpec>,
    next_digests: Vec<Diger>,
    next_threshold: Option<ThresholdSpec>,
    witnesses: Vec<Prefixer>,
    toad: Option<u64>,
    config: Vec<ConfigTrait>,
    seals: Vec<Seal>,
    delegator: Option<Prefixer>,
    basic: bool,
    kind: Kind,
}

impl InceptionBuilder {
    /// Start an inception over the given signing keys
    pub fn new(keys: Vec<Verfer>) -> Self {
        Self {
            keys,
            threshold: None,
            next_digests: Vec::new(),
            next_threshold: None,
            witnesses: Vec::new(),
            toad: None,
            config: Vec::new(),
            seals: Vec::new(),
            delegator: None,
            basic: false,
            kind: Kind::Json,
        }
    }

    /// Set the signing threshold
    pub fn with_threshold(mut self, threshold: ThresholdSpec) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Commit to next keys by digest
    pub fn with_next(mut self, digests: Vec<Diger>) -> Self {
        self.next_digests = digests;
        self
    }

    /// Set the next signing threshold
    pub fn with_next_threshold(mut self, threshold: ThresholdSpec) -> Self {
        self.next_threshold = Some(threshold);
        self
    }

    /// Set the witness list
    pub fn with_witnesses(mut self, witnesses: Vec<Prefixer>) -> Self {
        self.witnesses = witnesses;
        self
    }

    /// Set the witness threshold
    pub fn with_toad(mut self, toad: u64) -> Self {
        self.toad = Some(toad);
        self
    }

    /// Set configuration traits
    pub fn with_config(mut self, config: Vec<ConfigTrait>) -> Self {
        self.config = config;
        self
    }

    /// Anchor seals
    pub fn with_seals(mut self, seals: Vec<Seal>) -> Self {
        self.seals = seals;
        self
    }

    /// Make this a delegated inception under `delegator`
    pub fn with_delegator(mut self, delegator: Prefixer) -> Self {
        self.delegator = Some(delegator);
        self
    }

    /// Use the single signing key itself as the identifier
    pub fn basic(mut self) -> Self {
        self.basic = true;
        self
    }

    /// Set the serialization kind
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Assemble, saidify and serialize
    pub fn build(self) -> Result<Serder> {
        let prefix = if self.basic {
            match self.keys.as_slice() {
                [key] if self.delegator.is_none() => Prefixer::basic(key).qb64(),
                _ => {
                    return Err(CodecError::body(
                        "basic identifier needs exactly one key and no delegator",
                    ))
                }
            }
        } else {
            String::new()
        };
        let ilk = if self.delegator.is_some() {
            Ilk::Dip
        } else {
            Ilk::Icp
        };
        let toad = self
            .toad
            .unwrap_or_else(|| ample(self.witnesses.len()) as u64);

        let mut body = EventBody::new(ilk, prefix, 0);
        body.threshold = Some(
            self.threshold
                .unwrap_or_else(|| default_threshold(self.keys.len())),
        );
        body.keys = Some(qb64s(&self.keys, Verfer::qb64));
        body.next_threshold = Some(
            self.next_threshold
                .unwrap_or_else(|| default_next_threshold(self.next_digests.len())),
        );
        body.next_digests = Some(qb64s(&self.next_digests, Diger::qb64));
        body.toad = Some(format_sn(toad));
        body.witnesses = Some(qb64s(&self.witnesses, Prefixer::qb64));
        body.config = Some(self.config.iter().map(|c| c.as_str().to_string()).collect());
        body.seals = Some(self.seals);
        body.delegator = self.delegator.map(|d| d.qb64());
        Serder::saidify(body, self.kind)
    }
}

/// Builder for `rot` and `drt`
#[derive(Debug, Clone)]
pub struct RotationBuilder {
    prefix: Prefixer,
    sn: u64,
    prior: Diger,
    keys: Vec<Verfer>,
    threshold: Option<ThresholdSpec>,
    next_digests: Vec<Diger>,
    next_threshold: Option<ThresholdSpec>,
    current_witnesses: Vec<Prefixer>,
    cuts: Vec<Prefixer>,
    adds: Vec<Prefixer>,
    toad: Option<u64>,
    seals: Vec<Seal>,
    delegated: bool,
    kind: Kind,
}

impl RotationBuilder {
    /// Start a rotation of `prefix` to `keys` at `sn`, chained to `prior`
    pub fn new(prefix: Prefixer, sn: u64, prior: Diger, keys: Vec<Verfer>) -> Self {
        Self {
            prefix,
            sn,
            prior,
            keys,
            threshold: None,
            next_digests: Vec::new(),
            next_threshold: None,
            current_witnesses: Vec::new(),
            cuts: Vec::new(),
            adds: Vec::new(),
            toad: None,
            seals: Vec::new(),
            delegated: false,
            kind: Kind::Json,
        }
    }

    /// Set the signing threshold
    pub fn with_threshold(mut self, threshold: ThresholdSpec) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Commit to next keys by digest; an empty list abandons the identifier
    pub fn with_next(mut self, digests: Vec<Diger>) -> Self {
        self.next_digests = digests;
        self
    }

    /// Set the next signing threshold
    pub fn with_next_threshold(mut self, threshold: ThresholdSpec) -> Self {
        self.next_threshold = Some(threshold);
        self
    }

    /// Witnesses in force before this rotation, used for the default toad
    pub fn with_current_witnesses(mut self, witnesses: Vec<Prefixer>) -> Self {
        self.current_witnesses = witnesses;
        self
    }

    /// Witnesses to remove
    pub fn with_cuts(mut self, cuts: Vec<Prefixer>) -> Self {
        self.cuts = cuts;
        self
    }

    /// Witnesses to add
    pub fn with_adds(mut self, adds: Vec<Prefixer>) -> Self {
        self.adds = adds;
        self
    }

    /// Set the witness threshold
    pub fn with_toad(mut self, toad: u64) -> Self {
        self.toad = Some(toad);
        self
    }

    /// Anchor seals
    pub fn with_seals(mut self, seals: Vec<Seal>) -> Self {
        self.seals = seals;
        self
    }

    /// Build a delegated rotation
    pub fn delegated(mut self) -> Self {
        self.delegated = true;
        self
    }

    /// Set the serialization kind
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Assemble, saidify and serialize
    pub fn build(self) -> Result<Serder> {
        let ilk = if self.delegated { Ilk::Drt } else { Ilk::Rot };
        let toad = self.toad.unwrap_or_else(|| {
            let remaining = self
                .current_witnesses
                .iter()
                .filter(|w| !self.cuts.contains(w))
                .count();
            ample(remaining + self.adds.len()) as u64
        });

        let mut body = EventBody::new(ilk, self.prefix.qb64(), self.sn);
        body.prior = Some(self.prior.qb64());
        body.threshold = Some(
            self.threshold
                .unwrap_or_else(|| default_threshold(self.keys.len())),
        );
        body.keys = Some(qb64s(&self.keys, Verfer::qb64));
        body.next_threshold = Some(
            self.next_threshold
                .unwrap_or_else(|| default_next_threshold(self.next_digests.len())),
        );
        body.next_digests = Some(qb64s(&self.next_digests, Diger::qb64));
        body.toad = Some(format_sn(toad));
        body.cuts = Some(qb64s(&self.cuts, Prefixer::qb64));
        body.adds = Some(qb64s(&self.adds, Prefixer::qb64));
        body.seals = Some(self.seals);
        Serder::saidify(body, self.kind)
    }
}

/// Builder for `ixn`
#[derive(Debug, Clone)]
pub struct InteractionBuilder {
    prefix: Prefixer,
    sn: u64,
    prior: Diger,
    seals: Vec<Seal>,
    kind: Kind,
}

impl InteractionBuilder {
    /// Start an interaction of `prefix` at `sn`, chained to `prior`
    pub fn new(prefix: Prefixer, sn: u64, prior: Diger) -> Self {
        Self {
            prefix,
            sn,
            prior,
            seals: Vec::new(),
            kind: Kind::Json,
        }
    }

    /// Anchor seals
    pub fn with_seals(mut self, seals: Vec<Seal>) -> Self {
        self.seals = seals;
        self
    }

    /// Set the serialization kind
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Assemble, saidify and serialize
    pub fn build(self) -> Result<Serder> {
        let mut body = EventBody::new(Ilk::Ixn, self.prefix.qb64(), self.sn);
        body.prior = Some(self.prior.qb64());
        body.seals = Some(self.seals);
        Serder::saidify(body, self.kind)
    }
}

/// Receipt body for the event `(prefix, sn, said)`
pub fn receipt(prefix: &Prefixer, sn: u64, said: &Diger, kind: Kind) -> Result<Serder> {
    let mut body = EventBody::new(Ilk::Rct, prefix.qb64(), sn);
    body.said = said.qb64();
    Serder::new(body, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use keri_core::Signer;

    fn verfer(seed: u8) -> Verfer {
        Signer::from_seed([seed; 32], true).verfer().clone()
    }

    #[test]
    fn test_inception_defaults() {
        let serder = InceptionBuilder::new(vec![verfer(1), verfer(2), verfer(3)])
            .with_next(next_digests(&[verfer(4)]))
            .with_witnesses(vec![Prefixer::basic(&Signer::from_seed([5; 32], false).verfer().clone())])
            .build()
            .unwrap();
        let body = serder.body();
        assert_eq!(body.ilk, Ilk::Icp);
        assert_eq!(body.threshold, Some(ThresholdSpec::count(2)));
        assert_eq!(body.next_threshold, Some(ThresholdSpec::count(1)));
        assert_eq!(body.toad.as_deref(), Some("1"));
        assert_eq!(body.prefix, body.said);
        assert!(serder.verify_said());

        let event = serder.key_event().unwrap();
        assert!(event.prefix.is_self_addressing());
        assert!(matches!(event.kind, EventKind::Inception(_)));
    }

    #[test]
    fn test_basic_inception() {
        let key = Signer::from_seed([1; 32], false).verfer().clone();
        let serder = InceptionBuilder::new(vec![key.clone()]).basic().build().unwrap();
        assert_eq!(serder.body().prefix, key.qb64());
        assert_eq!(serder.body().next_threshold, Some(ThresholdSpec::count(0)));
        assert!(serder.verify_said());

        assert!(InceptionBuilder::new(vec![verfer(1), verfer(2)])
            .basic()
            .build()
            .is_err());
    }

    #[test]
    fn test_delegated_inception() {
        let delegator = Prefixer::self_addressing(&Diger::new(b"delegator"));
        let serder = InceptionBuilder::new(vec![verfer(1)])
            .with_delegator(delegator.clone())
            .with_kind(Kind::Cbor)
            .build()
            .unwrap();
        assert_eq!(serder.ilk(), Ilk::Dip);
        let event = serder.key_event().unwrap();
        assert_matches::assert_matches!(
            event.kind,
            EventKind::DelegatedInception { delegator: d, .. } if d == delegator
        );
    }

    #[test]
    fn test_rotation_default_toad_follows_witness_delta() {
        let wit = |s: u8| Prefixer::basic(&Signer::from_seed([s; 32], false).verfer().clone());
        let icp = InceptionBuilder::new(vec![verfer(1)]).build().unwrap();
        let serder = RotationBuilder::new(
            icp.prefix().unwrap(),
            1,
            icp.said().unwrap(),
            vec![verfer(2)],
        )
        .with_current_witnesses(vec![wit(10), wit(11)])
        .with_cuts(vec![wit(10)])
        .with_adds(vec![wit(12), wit(13)])
        .build()
        .unwrap();
        assert_eq!(serder.body().toad.as_deref(), Some(format_sn(ample(3) as u64).as_str()));
        assert_eq!(serder.body().prior, Some(icp.said().unwrap().qb64()));
        assert!(serder.key_event().is_ok());
    }

    #[test]
    fn test_receipt_keeps_receipted_said() {
        let icp = InceptionBuilder::new(vec![verfer(1)]).build().unwrap();
        let rct = receipt(&icp.prefix().unwrap(), 0, &icp.said().unwrap(), Kind::Mgpk).unwrap();
        let body = rct.receipt().unwrap();
        assert_eq!(body.said, icp.said().unwrap());
        assert!(rct.verify_said());
    }

    #[test]
    fn test_next_digests_commit_to_qb64() {
        let key = verfer(7);
        let digests = next_digests(std::slice::from_ref(&key));
        assert!(digests[0].verify(key.qb64().as_bytes()));
    }
}
