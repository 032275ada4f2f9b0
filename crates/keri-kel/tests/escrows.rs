//! Escrow behavior: out-of-order, partial signatures, delegation, receipts.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

use assert_matches::assert_matches;
use keri_codec::ConfigTrait;
use keri_core::ThresholdSpec;
use keri_kel::{Cue, DropReason, EscrowCategory, KelConfig, KelError, Kevery, MemoryStore, Outcome};
use keri_testkit::{bytes, init_test_tracing, stream, ControllableClock, Controller, Witness};

fn kevery_with(clock: &ControllableClock, config: KelConfig) -> Kevery<MemoryStore, ControllableClock> {
    init_test_tracing();
    Kevery::with_config(MemoryStore::new(), clock.clone(), config).unwrap()
}

fn kevery(clock: &ControllableClock) -> Kevery<MemoryStore, ControllableClock> {
    kevery_with(clock, KelConfig::default())
}

#[test]
fn test_out_of_order_promoted_by_prior() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept();
    let rot = alice.rotate();

    let outcomes = kevery.process(&bytes(&rot));
    assert_matches!(
        outcomes.as_slice(),
        [Outcome::Escrowed { category: EscrowCategory::OutOfOrder, sn: 1, .. }]
    );
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 1);
    assert!(kevery.key_state(&alice.prefix()).is_none());

    assert!(kevery.process_message(&icp).is_accepted());
    let report = kevery.process_escrows().unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(report.retained, 0);
    assert_eq!(kevery.key_state(&alice.prefix()).unwrap().sn, 1);
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 0);
}

#[test]
fn test_out_of_order_chain_resolves_on_one_call() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept();
    let rot = alice.rotate();
    let ixn = alice.interact(Vec::new());

    kevery.process(&stream(&[ixn, rot]));
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 2);

    let outcomes = kevery.process(&bytes(&icp));
    assert!(outcomes[0].is_accepted());
    assert_eq!(kevery.key_state(&alice.prefix()).unwrap().sn, 2);
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 0);

    let accepted: Vec<u64> = kevery
        .drain_cues()
        .into_iter()
        .filter_map(|cue| match cue {
            Cue::Accepted { sn, .. } => Some(sn),
            _ => None,
        })
        .collect();
    assert_eq!(accepted, vec![0, 1, 2]);
}

#[test]
fn test_partial_signatures_merge() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let mut carol = Controller::new("carol", 3);
    let icp = carol.incept_with(|b| b.with_threshold(ThresholdSpec::count(2)));

    let first = kevery.process(&bytes(&carol.resign(&icp, &[0])));
    assert_matches!(
        first.as_slice(),
        [Outcome::Escrowed { category: EscrowCategory::PartiallySigned, sn: 0, .. }]
    );

    let second = kevery.process(&bytes(&carol.resign(&icp, &[2])));
    assert_matches!(second.as_slice(), [Outcome::Accepted { sn: 0, .. }]);
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallySigned).unwrap(), 0);

    let mut indices: Vec<u32> = kevery
        .db()
        .sigs(&carol.prefix(), &carol.last_said())
        .unwrap()
        .iter()
        .map(|s| s.index())
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 2]);
}

#[test]
fn test_expired_entry_dropped_with_cue() {
    let clock = ControllableClock::epoch();
    let config = KelConfig::from_toml_str("[escrow]\nout_of_order_timeout_secs = 60").unwrap();
    let mut kevery = kevery_with(&clock, config);
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept();
    let rot = alice.rotate();

    kevery.process(&bytes(&rot));
    clock.advance_secs(30);
    assert_eq!(kevery.process_escrows().unwrap().dropped, 0);

    clock.advance_secs(31);
    let report = kevery.process_escrows().unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 0);
    assert!(kevery.drain_cues().contains(&Cue::EscrowDropped {
        category: EscrowCategory::OutOfOrder,
        prefix: alice.prefix(),
        sn: 1,
        reason: DropReason::Expired,
    }));

    // The rotation is gone; the inception alone is accepted
    kevery.process(&bytes(&icp));
    assert_eq!(kevery.key_state(&alice.prefix()).unwrap().sn, 0);
}

#[test]
fn test_retry_budget_exhausted() {
    let clock = ControllableClock::epoch();
    let config = KelConfig::from_toml_str("[escrow]\nmax_retries = 2").unwrap();
    let mut kevery = kevery_with(&clock, config);
    let mut alice = Controller::new("alice", 1);
    let _ = alice.incept();
    let rot = alice.rotate();
    kevery.process(&bytes(&rot));

    for _ in 0..2 {
        let report = kevery.process_escrows().unwrap();
        assert_eq!((report.retained, report.dropped), (1, 0));
    }
    let report = kevery.process_escrows().unwrap();
    assert_eq!((report.retained, report.dropped), (0, 1));
    assert!(kevery.drain_cues().iter().any(|cue| matches!(
        cue,
        Cue::EscrowDropped { reason: DropReason::RetriesExhausted, sn: 1, .. }
    )));
}

#[test]
fn test_reverse_delivery_within_retry_budget() {
    let clock = ControllableClock::epoch();
    let config = KelConfig::from_toml_str("[escrow]\nmax_retries = 3").unwrap();
    let mut kevery = kevery_with(&clock, config);
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept();
    let interactions: Vec<_> = (0..5).map(|_| alice.interact(Vec::new())).collect();

    // Newest first, so the oldest escrow entry is the last to become valid
    for ixn in interactions.iter().rev() {
        kevery.process(&bytes(ixn));
        clock.advance_secs(1);
    }
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 5);

    kevery.process(&bytes(&icp));
    assert_eq!(kevery.key_state(&alice.prefix()).unwrap().sn, 5);
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 0);
    assert!(!kevery
        .drain_cues()
        .iter()
        .any(|cue| matches!(cue, Cue::EscrowDropped { .. })));
}

#[test]
fn test_delegated_inception_waits_for_anchor() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let mut bank = Controller::new("bank", 1);
    let mut teller = Controller::new("teller", 1);
    let bank_icp = bank.incept();
    let dip = teller.incept_with(|b| b.with_delegator(bank.prefix()));

    // Neither the delegator nor the anchor is known yet
    let outcomes = kevery.process(&bytes(&dip));
    assert_matches!(
        outcomes.as_slice(),
        [Outcome::Escrowed { category: EscrowCategory::PartiallyDelegated, sn: 0, .. }]
    );

    kevery.process(&bytes(&bank_icp));
    assert!(kevery.key_state(&teller.prefix()).is_none());
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallyDelegated).unwrap(), 1);

    let anchor = bank.interact(vec![teller.seal()]);
    kevery.process(&bytes(&anchor));
    let state = kevery.key_state(&teller.prefix()).unwrap();
    assert_eq!(state.delegator, Some(bank.prefix()));
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallyDelegated).unwrap(), 0);
}

#[test]
fn test_delegated_rotation_with_source_seal() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let mut bank = Controller::new("bank", 1);
    let mut teller = Controller::new("teller", 1);
    let bank_icp = bank.incept();
    let dip = teller.incept_with(|b| b.with_delegator(bank.prefix()));
    let first_anchor = bank.interact(vec![teller.seal()]);
    kevery.process(&stream(&[bank_icp, first_anchor, dip]));
    assert_eq!(kevery.key_state(&teller.prefix()).unwrap().sn, 0);

    let mut drt = teller.rotate_with(|b| b.delegated());
    let second_anchor = bank.interact(vec![teller.seal()]);
    kevery.process(&bytes(&second_anchor));
    drt.attachments.source_seals.push(bank.source_seal());

    let outcomes = kevery.process(&bytes(&drt));
    assert_matches!(outcomes.as_slice(), [Outcome::Accepted { sn: 1, .. }]);
}

#[test]
fn test_do_not_delegate_rejects_delegation() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let mut bank = Controller::new("bank", 1);
    let mut teller = Controller::new("teller", 1);
    let bank_icp = bank.incept_with(|b| b.with_config(vec![ConfigTrait::DoNotDelegate]));
    kevery.process(&bytes(&bank_icp));

    let dip = teller.incept_with(|b| b.with_delegator(bank.prefix()));
    let outcomes = kevery.process(&bytes(&dip));
    assert_matches!(outcomes.as_slice(), [Outcome::Rejected(KelError::Unauthorized { .. })]);
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallyDelegated).unwrap(), 0);
}

#[test]
fn test_receipt_before_event() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let witness = Witness::new("w0");
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept_with(|b| b.with_witnesses(vec![witness.prefix()]).with_toad(1));
    let rct = witness.receipt(&icp.serder);

    let outcomes = kevery.process(&bytes(&rct));
    assert_matches!(
        outcomes.as_slice(),
        [Outcome::Escrowed { category: EscrowCategory::UnverifiedReceipt, sn: 0, .. }]
    );

    kevery.process(&bytes(&icp));
    assert_eq!(kevery.escrowed(EscrowCategory::UnverifiedReceipt).unwrap(), 0);
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallyWitnessed).unwrap(), 0);
    assert!(kevery
        .is_fully_witnessed(&alice.prefix(), &alice.last_said())
        .unwrap());
    assert_eq!(
        kevery.db().receipts(&alice.prefix(), &alice.last_said()).unwrap().len(),
        1
    );
}

#[test]
fn test_transferable_receipt_from_unknown_receiptor() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let mut alice = Controller::new("alice", 1);
    let mut bob = Controller::new("bob", 2);
    let alice_icp = alice.incept();
    let bob_icp = bob.incept();
    let vrc = bob.trans_receipt(&alice_icp.serder);

    kevery.process(&bytes(&alice_icp));
    let outcomes = kevery.process(&bytes(&vrc));
    assert_matches!(
        outcomes.as_slice(),
        [Outcome::Escrowed { category: EscrowCategory::UnverifiedTransReceipt, sn: 0, .. }]
    );

    kevery.process(&bytes(&bob_icp));
    assert_eq!(kevery.escrowed(EscrowCategory::UnverifiedTransReceipt).unwrap(), 0);
    let stored = kevery
        .db()
        .trans_receipts(&alice.prefix(), &alice.last_said())
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|r| r.prefix == bob.prefix()));
}

#[test]
fn test_receipt_for_unknown_said_rejected() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let witness = Witness::new("w0");
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept();
    kevery.process(&bytes(&icp));

    let mut fork = alice.clone();
    let ixn = alice.interact(Vec::new());
    let other = fork.interact(vec![alice.seal()]);
    kevery.process(&bytes(&ixn));

    let outcomes = kevery.process(&bytes(&witness.receipt(&other.serder)));
    assert_matches!(outcomes.as_slice(), [Outcome::Rejected(KelError::Unauthorized { sn: 1, .. })]);
}
