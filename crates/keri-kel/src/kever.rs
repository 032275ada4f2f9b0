//! Key-state machine
//!
//! A [`Kever`] owns the verified [`KeyState`] of one identifier. Inception
//! creates it; every later event is checked against it by
//! [`Kever::verify_update`], which returns the successor state without
//! touching the current one. [`Kever::apply`] verifies and replaces in one
//! step, so a failed transition never leaves a half-updated state.
//!
//! Rotation authority is two-sided: the signatures must satisfy the new
//! signing threshold over the new keys, and the keys they come from must be
//! ones the prior establishment event committed to, in enough weight to
//! satisfy the prior next threshold.

use crate::error::{KelError, Result};
use crate::state::{EstablishmentPoint, KeverStatus, KeyState};
use keri_codec::{
    EventKind, InceptionEvent, InteractionEvent, KeyEvent, RotationEvent, Serder,
};
use keri_core::{Prefixer, Siger, Tholder, ThresholdRole, Verfer};
use std::collections::BTreeSet;

/// Indices of signatures in `sigs` that verify against `keys`, deduplicated
pub fn verified_indices(sigs: &[Siger], keys: &[Verfer], ser: &[u8]) -> Vec<u32> {
    let mut seen = BTreeSet::new();
    for siger in sigs {
        let Some(verfer) = keys.get(siger.index() as usize) else {
            continue;
        };
        if siger.verify(verfer, ser) {
            seen.insert(siger.index());
        }
    }
    seen.into_iter().collect()
}

fn check_said(serder: &Serder, event: &KeyEvent) -> Result<()> {
    if serder.verify_said() {
        Ok(())
    } else {
        Err(KelError::InvalidSaid {
            said: event.said.qb64(),
        })
    }
}

fn bind(
    event: &KeyEvent,
    spec: &keri_core::ThresholdSpec,
    count: usize,
    role: ThresholdRole,
) -> Result<Tholder> {
    Tholder::for_keys(spec, count, role)
        .map_err(|e| KelError::configuration(&event.prefix, event.sn, e.to_string()))
}

fn check_witnesses(event: &KeyEvent, witnesses: &[Prefixer], toad: u64) -> Result<()> {
    let unique: BTreeSet<&Prefixer> = witnesses.iter().collect();
    if unique.len() != witnesses.len() {
        return Err(KelError::configuration(
            &event.prefix,
            event.sn,
            "duplicate witnesses",
        ));
    }
    let count = witnesses.len() as u64;
    let in_bounds = if count == 0 {
        toad == 0
    } else {
        (1..=count).contains(&toad)
    };
    if !in_bounds {
        return Err(KelError::configuration(
            &event.prefix,
            event.sn,
            format!("toad {toad} out of bounds for {count} witnesses"),
        ));
    }
    Ok(())
}

/// Fail unless at least one signature verified and `satisfied` holds
fn check_signed(event: &KeyEvent, verified: &[u32], satisfied: bool) -> Result<()> {
    if verified.is_empty() {
        return Err(KelError::unauthorized(
            &event.prefix,
            event.sn,
            "no verified controller signatures",
        ));
    }
    if !satisfied {
        return Err(KelError::PartiallySigned {
            prefix: event.prefix.qb64(),
            sn: event.sn,
        });
    }
    Ok(())
}

/// Key-state machine for one identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kever {
    state: KeyState,
}

impl Kever {
    /// Resume from a stored state
    pub fn from_state(state: KeyState) -> Self {
        Self { state }
    }

    /// Current state
    pub fn state(&self) -> &KeyState {
        &self.state
    }

    /// Steady state
    pub fn status(&self) -> KeverStatus {
        self.state.status()
    }

    /// Validate an inception and create its state machine
    pub fn incept(serder: &Serder, event: &KeyEvent, sigs: &[Siger]) -> Result<Self> {
        let state = Self::verify_inception(serder, event, sigs)?;
        Ok(Self { state })
    }

    /// Validate an inception without creating a state machine
    pub fn verify_inception(serder: &Serder, event: &KeyEvent, sigs: &[Siger]) -> Result<KeyState> {
        let (icp, delegator) = match &event.kind {
            EventKind::Inception(icp) => (icp, None),
            EventKind::DelegatedInception {
                inception,
                delegator,
            } => (inception, Some(delegator)),
            _ => {
                return Err(KelError::OutOfOrder {
                    prefix: event.prefix.qb64(),
                    sn: event.sn,
                })
            }
        };
        if event.sn != 0 {
            return Err(KelError::Codec(keri_codec::CodecError::body(format!(
                "inception at sequence number {}",
                event.sn
            ))));
        }
        check_said(serder, event)?;
        Self::check_derivation(event, icp, delegator.is_some())?;

        let keys = &icp.key_config.keys;
        let tholder = bind(event, &icp.key_config.threshold, keys.len(), ThresholdRole::Current)?;
        bind(
            event,
            &icp.key_config.next_threshold,
            icp.key_config.next_digests.len(),
            ThresholdRole::Next,
        )?;
        check_witnesses(event, &icp.witnesses, icp.toad)?;

        let verified = verified_indices(sigs, keys, serder.raw());
        check_signed(event, &verified, tholder.satisfy(&verified))?;
        Ok(Self::initial_state(event, icp, delegator.cloned()))
    }

    fn check_derivation(event: &KeyEvent, icp: &InceptionEvent, delegated: bool) -> Result<()> {
        let prefix = &event.prefix;
        if prefix.is_self_addressing() {
            if prefix.qb64() != event.said.qb64() {
                return Err(KelError::unauthorized(
                    prefix,
                    0,
                    "identifier is not the inception digest",
                ));
            }
            return Ok(());
        }
        if delegated {
            return Err(KelError::unauthorized(
                prefix,
                0,
                "delegated identifier must be self-addressing",
            ));
        }
        match icp.key_config.keys.as_slice() {
            [key] if key.qb64() == prefix.qb64() => {}
            _ => {
                return Err(KelError::unauthorized(
                    prefix,
                    0,
                    "basic identifier must be its single signing key",
                ))
            }
        }
        if !prefix.is_transferable()
            && (!icp.key_config.next_digests.is_empty()
                || !icp.witnesses.is_empty()
                || !icp.seals.is_empty())
        {
            return Err(KelError::configuration(
                prefix,
                0,
                "non-transferable identifier cannot commit next keys, witnesses or seals",
            ));
        }
        Ok(())
    }

    fn initial_state(event: &KeyEvent, icp: &InceptionEvent, delegator: Option<Prefixer>) -> KeyState {
        KeyState {
            prefix: event.prefix.clone(),
            sn: 0,
            last_said: event.said.clone(),
            last_ilk: event.ilk(),
            keys: icp.key_config.keys.clone(),
            threshold: icp.key_config.threshold.clone(),
            next_threshold: icp.key_config.next_threshold.clone(),
            next_digests: icp.key_config.next_digests.clone(),
            witnesses: icp.witnesses.clone(),
            toad: icp.toad,
            config: icp.config.clone(),
            delegator,
            last_establishment: EstablishmentPoint {
                sn: 0,
                said: event.said.clone(),
            },
        }
    }

    /// Validate a non-inception event against the current state.
    ///
    /// Returns the successor state; the current state is untouched.
    pub fn verify_update(&self, serder: &Serder, event: &KeyEvent, sigs: &[Siger]) -> Result<KeyState> {
        let state = &self.state;
        if event.prefix != state.prefix {
            return Err(KelError::unauthorized(
                &event.prefix,
                event.sn,
                format!("event routed to state of {}", state.prefix),
            ));
        }
        if event.sn > state.sn + 1 {
            return Err(KelError::OutOfOrder {
                prefix: event.prefix.qb64(),
                sn: event.sn,
            });
        }
        if event.sn <= state.sn {
            return Err(KelError::Duplicitous {
                prefix: event.prefix.qb64(),
                sn: event.sn,
            });
        }
        if !state.prefix.is_transferable() {
            return Err(KelError::unauthorized(
                &event.prefix,
                event.sn,
                "non-transferable identifier accepts no further events",
            ));
        }
        check_said(serder, event)?;
        if event.prior() != Some(&state.last_said) {
            return Err(KelError::unauthorized(
                &event.prefix,
                event.sn,
                "prior digest does not match latest event",
            ));
        }

        match &event.kind {
            EventKind::Interaction(ixn) => self.verify_interaction(serder, event, ixn, sigs),
            EventKind::Rotation(rot) => {
                if state.delegator.is_some() {
                    return Err(KelError::unauthorized(
                        &event.prefix,
                        event.sn,
                        "delegated identifier must rotate with drt",
                    ));
                }
                self.verify_rotation(serder, event, rot, sigs)
            }
            EventKind::DelegatedRotation(rot) => {
                if state.delegator.is_none() {
                    return Err(KelError::unauthorized(
                        &event.prefix,
                        event.sn,
                        "drt on an identifier without delegator",
                    ));
                }
                self.verify_rotation(serder, event, rot, sigs)
            }
            EventKind::Inception(_) | EventKind::DelegatedInception { .. } => {
                Err(KelError::Duplicitous {
                    prefix: event.prefix.qb64(),
                    sn: event.sn,
                })
            }
        }
    }

    fn verify_interaction(
        &self,
        serder: &Serder,
        event: &KeyEvent,
        _ixn: &InteractionEvent,
        sigs: &[Siger],
    ) -> Result<KeyState> {
        let state = &self.state;
        if state.is_establishment_only() {
            return Err(KelError::unauthorized(
                &event.prefix,
                event.sn,
                "establishment-only identifier rejects interactions",
            ));
        }
        let tholder = state
            .tholder()
            .map_err(|e| KelError::configuration(&event.prefix, event.sn, e.to_string()))?;
        let verified = verified_indices(sigs, &state.keys, serder.raw());
        check_signed(event, &verified, tholder.satisfy(&verified))?;

        let mut next = state.clone();
        next.sn = event.sn;
        next.last_said = event.said.clone();
        next.last_ilk = event.ilk();
        Ok(next)
    }

    /// Position of each new key among the prior next-key digests
    fn ondices(&self, keys: &[Verfer]) -> Vec<Option<u32>> {
        keys.iter()
            .map(|key| {
                let committed = key.qb64();
                self.state
                    .next_digests
                    .iter()
                    .position(|d| d.verify(committed.as_bytes()))
                    .map(|j| j as u32)
            })
            .collect()
    }

    fn verify_rotation(
        &self,
        serder: &Serder,
        event: &KeyEvent,
        rot: &RotationEvent,
        sigs: &[Siger],
    ) -> Result<KeyState> {
        let state = &self.state;
        if state.is_abandoned() {
            return Err(KelError::unauthorized(
                &event.prefix,
                event.sn,
                "identifier abandoned by empty next-key commitment",
            ));
        }
        let keys = &rot.key_config.keys;
        let tholder = bind(event, &rot.key_config.threshold, keys.len(), ThresholdRole::Current)?;
        bind(
            event,
            &rot.key_config.next_threshold,
            rot.key_config.next_digests.len(),
            ThresholdRole::Next,
        )?;
        let prior_next = state
            .next_tholder()
            .map_err(|e| KelError::configuration(&event.prefix, event.sn, e.to_string()))?;

        let ondices = self.ondices(keys);
        let exposed: Vec<u32> = ondices.iter().flatten().copied().collect();
        if !prior_next.satisfy(&exposed) {
            return Err(KelError::unauthorized(
                &event.prefix,
                event.sn,
                "rotation keys do not satisfy the prior next-key commitment",
            ));
        }

        let witnesses = Self::rotate_witnesses(event, &state.witnesses, rot)?;
        check_witnesses(event, &witnesses, rot.toad)?;

        let verified = verified_indices(sigs, keys, serder.raw());
        let prior_signed: Vec<u32> = verified
            .iter()
            .filter_map(|i| ondices.get(*i as usize).copied().flatten())
            .collect();
        let satisfied = tholder.satisfy(&verified) && prior_next.satisfy(&prior_signed);
        check_signed(event, &verified, satisfied)?;

        Ok(KeyState {
            prefix: state.prefix.clone(),
            sn: event.sn,
            last_said: event.said.clone(),
            last_ilk: event.ilk(),
            keys: keys.clone(),
            threshold: rot.key_config.threshold.clone(),
            next_threshold: rot.key_config.next_threshold.clone(),
            next_digests: rot.key_config.next_digests.clone(),
            witnesses,
            toad: rot.toad,
            config: state.config.clone(),
            delegator: state.delegator.clone(),
            last_establishment: EstablishmentPoint {
                sn: event.sn,
                said: event.said.clone(),
            },
        })
    }

    /// Apply cuts then adds to the witness list
    fn rotate_witnesses(
        event: &KeyEvent,
        current: &[Prefixer],
        rot: &RotationEvent,
    ) -> Result<Vec<Prefixer>> {
        let invalid = |reason: &str| KelError::configuration(&event.prefix, event.sn, reason);
        let cuts: BTreeSet<&Prefixer> = rot.cuts.iter().collect();
        if cuts.len() != rot.cuts.len() {
            return Err(invalid("duplicate witness cuts"));
        }
        if cuts.iter().any(|c| !current.contains(c)) {
            return Err(invalid("cut of a witness not in the current list"));
        }
        let adds: BTreeSet<&Prefixer> = rot.adds.iter().collect();
        if adds.len() != rot.adds.len() {
            return Err(invalid("duplicate witness adds"));
        }
        if adds.iter().any(|a| cuts.contains(a)) {
            return Err(invalid("witness both cut and added"));
        }
        let mut witnesses: Vec<Prefixer> = current
            .iter()
            .filter(|w| !cuts.contains(w))
            .cloned()
            .collect();
        if rot.adds.iter().any(|a| witnesses.contains(a)) {
            return Err(invalid("add of a witness already in the list"));
        }
        witnesses.extend(rot.adds.iter().cloned());
        Ok(witnesses)
    }

    /// Verify an update and replace the state with its successor
    pub fn apply(&mut self, serder: &Serder, event: &KeyEvent, sigs: &[Siger]) -> Result<()> {
        self.state = self.verify_update(serder, event, sigs)?;
        Ok(())
    }

    /// Install a successor state already verified by [`Kever::verify_update`]
    pub(crate) fn replace(&mut self, state: KeyState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use keri_codec::{next_digests, InceptionBuilder, InteractionBuilder, RotationBuilder};
    use keri_core::{Signer, ThresholdSpec};

    fn signers(base: u8, n: usize) -> Vec<Signer> {
        (0..n)
            .map(|i| Signer::from_seed([base + i as u8; 32], true))
            .collect()
    }

    fn verfers(signers: &[Signer]) -> Vec<Verfer> {
        signers.iter().map(|s| s.verfer().clone()).collect()
    }

    fn sign(serder: &Serder, signers: &[Signer]) -> Vec<Siger> {
        signers
            .iter()
            .enumerate()
            .map(|(i, s)| s.sign_indexed(serder.raw(), i as u32).unwrap())
            .collect()
    }

    fn incept(current: &[Signer], next: &[Signer]) -> (Kever, Serder) {
        let serder = InceptionBuilder::new(verfers(current))
            .with_next(next_digests(&verfers(next)))
            .build()
            .unwrap();
        let event = serder.key_event().unwrap();
        let kever = Kever::incept(&serder, &event, &sign(&serder, current)).unwrap();
        (kever, serder)
    }

    #[test]
    fn test_inception_state() {
        let current = signers(1, 1);
        let next = signers(10, 1);
        let (kever, serder) = incept(&current, &next);
        let state = kever.state();
        assert_eq!(state.prefix.qb64(), serder.body().said);
        assert_eq!(state.sn, 0);
        assert_eq!(state.keys, verfers(&current));
        assert_eq!(kever.status(), KeverStatus::Active);
    }

    #[test]
    fn test_inception_unsigned_is_unauthorized() {
        let current = signers(1, 1);
        let serder = InceptionBuilder::new(verfers(&current)).build().unwrap();
        let event = serder.key_event().unwrap();
        let wrong = signers(50, 1);
        let err = Kever::incept(&serder, &event, &sign(&serder, &wrong)).unwrap_err();
        assert_matches!(err, KelError::Unauthorized { .. });
    }

    #[test]
    fn test_inception_partially_signed() {
        let current = signers(1, 3);
        let serder = InceptionBuilder::new(verfers(&current))
            .with_threshold(ThresholdSpec::count(2))
            .build()
            .unwrap();
        let event = serder.key_event().unwrap();
        let err = Kever::incept(&serder, &event, &sign(&serder, &current)[..1]).unwrap_err();
        assert_matches!(err, KelError::PartiallySigned { sn: 0, .. });
    }

    #[test]
    fn test_inception_bad_toad_is_configuration() {
        let current = signers(1, 1);
        let witness = Signer::from_seed([90; 32], false);
        let serder = InceptionBuilder::new(verfers(&current))
            .with_witnesses(vec![Prefixer::basic(witness.verfer())])
            .with_toad(2)
            .build()
            .unwrap();
        let event = serder.key_event().unwrap();
        let err = Kever::incept(&serder, &event, &sign(&serder, &current)).unwrap_err();
        assert_matches!(err, KelError::Configuration { .. });
    }

    #[test]
    fn test_threshold_larger_than_keys_is_configuration() {
        let current = signers(1, 1);
        let serder = InceptionBuilder::new(verfers(&current))
            .with_threshold(ThresholdSpec::count(2))
            .build()
            .unwrap();
        let event = serder.key_event().unwrap();
        let err = Kever::incept(&serder, &event, &sign(&serder, &current)).unwrap_err();
        assert_matches!(err, KelError::Configuration { .. });
    }

    fn witness(seed: u8) -> Prefixer {
        Prefixer::basic(Signer::from_seed([seed; 32], false).verfer())
    }

    #[test]
    fn test_duplicate_witnesses_at_inception_is_configuration() {
        let current = signers(1, 1);
        let serder = InceptionBuilder::new(verfers(&current))
            .with_witnesses(vec![witness(90), witness(90)])
            .with_toad(1)
            .build()
            .unwrap();
        let event = serder.key_event().unwrap();
        let err = Kever::incept(&serder, &event, &sign(&serder, &current)).unwrap_err();
        assert_matches!(err, KelError::Configuration { ref reason, .. } if reason.contains("duplicate"));
    }

    #[test]
    fn test_witness_rotation_rejections() {
        let first = signers(1, 1);
        let second = signers(10, 1);
        let current = vec![witness(90), witness(91)];
        let serder = InceptionBuilder::new(verfers(&first))
            .with_next(next_digests(&verfers(&second)))
            .with_witnesses(current.clone())
            .with_toad(1)
            .build()
            .unwrap();
        let event = serder.key_event().unwrap();
        let kever = Kever::incept(&serder, &event, &sign(&serder, &first)).unwrap();

        let rotate = |cuts: Vec<Prefixer>, adds: Vec<Prefixer>| {
            let rot = RotationBuilder::new(
                kever.state().prefix.clone(),
                1,
                serder.said().unwrap(),
                verfers(&second),
            )
            .with_current_witnesses(current.clone())
            .with_cuts(cuts)
            .with_adds(adds)
            .with_toad(1)
            .build()
            .unwrap();
            let event = rot.key_event().unwrap();
            kever.verify_update(&rot, &event, &sign(&rot, &second))
        };

        let cases = [
            (vec![witness(90), witness(90)], vec![], "duplicate witness cuts"),
            (vec![witness(92)], vec![], "not in the current list"),
            (vec![witness(90)], vec![witness(90)], "both cut and added"),
            (vec![], vec![witness(92), witness(92)], "duplicate witness adds"),
            (vec![], vec![witness(91)], "already in the list"),
        ];
        for (cuts, adds, expected) in cases {
            let err = rotate(cuts, adds).unwrap_err();
            assert_matches!(
                err,
                KelError::Configuration { sn: 1, ref reason, .. } if reason.contains(expected),
                "{expected}"
            );
        }

        let state = rotate(vec![witness(90)], vec![witness(92)]).unwrap();
        assert_eq!(state.witnesses, vec![witness(91), witness(92)]);
    }

    #[test]
    fn test_rotation_and_interaction() {
        let first = signers(1, 1);
        let second = signers(10, 1);
        let third = signers(20, 1);
        let (mut kever, icp) = incept(&first, &second);

        let rot = RotationBuilder::new(
            kever.state().prefix.clone(),
            1,
            icp.said().unwrap(),
            verfers(&second),
        )
        .with_next(next_digests(&verfers(&third)))
        .build()
        .unwrap();
        let event = rot.key_event().unwrap();
        kever.apply(&rot, &event, &sign(&rot, &second)).unwrap();
        assert_eq!(kever.state().sn, 1);
        assert_eq!(kever.state().keys, verfers(&second));
        assert_eq!(kever.state().last_establishment.sn, 1);

        let ixn = InteractionBuilder::new(kever.state().prefix.clone(), 2, rot.said().unwrap())
            .build()
            .unwrap();
        let event = ixn.key_event().unwrap();
        let err = kever.apply(&ixn, &event, &sign(&ixn, &first)).unwrap_err();
        assert_matches!(err, KelError::Unauthorized { .. });
        kever.apply(&ixn, &event, &sign(&ixn, &second)).unwrap();
        assert_eq!(kever.state().last_said, ixn.said().unwrap());
        assert_eq!(kever.state().last_establishment.sn, 1);
    }

    #[test]
    fn test_rotation_to_uncommitted_keys_is_unauthorized() {
        let first = signers(1, 1);
        let second = signers(10, 1);
        let rogue = signers(30, 1);
        let (kever, icp) = incept(&first, &second);

        let rot = RotationBuilder::new(
            kever.state().prefix.clone(),
            1,
            icp.said().unwrap(),
            verfers(&rogue),
        )
        .build()
        .unwrap();
        let event = rot.key_event().unwrap();
        let err = kever
            .verify_update(&rot, &event, &sign(&rot, &rogue))
            .unwrap_err();
        assert_matches!(err, KelError::Unauthorized { .. });
    }

    #[test]
    fn test_gap_and_stale_sequence_numbers() {
        let first = signers(1, 1);
        let (kever, icp) = incept(&first, &signers(10, 1));
        let ixn = InteractionBuilder::new(kever.state().prefix.clone(), 3, icp.said().unwrap())
            .build()
            .unwrap();
        let event = ixn.key_event().unwrap();
        assert_matches!(
            kever.verify_update(&ixn, &event, &sign(&ixn, &first)),
            Err(KelError::OutOfOrder { sn: 3, .. })
        );

        let event = icp.key_event().unwrap();
        assert_matches!(
            kever.verify_update(&icp, &event, &sign(&icp, &first)),
            Err(KelError::Duplicitous { sn: 0, .. })
        );
    }

    #[test]
    fn test_verified_indices_ignore_bad_signatures() {
        let keys = signers(1, 2);
        let ser = b"body";
        let sigs = vec![
            keys[0].sign_indexed(ser, 0).unwrap(),
            keys[0].sign_indexed(ser, 1).unwrap(),
            keys[1].sign_indexed(ser, 5).unwrap(),
            keys[0].sign_indexed(ser, 0).unwrap(),
        ];
        assert_eq!(verified_indices(&sigs, &verfers(&keys), ser), vec![0]);
    }
}
