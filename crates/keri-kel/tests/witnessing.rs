//! Witness receipts and the fully-witnessed notification.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

use assert_matches::assert_matches;
use keri_kel::{Cue, EscrowCategory, KelConfig, Kevery, MemoryStore, Outcome};
use keri_testkit::{bytes, init_test_tracing, ControllableClock, Controller, Witness};

fn kevery(clock: &ControllableClock) -> Kevery<MemoryStore, ControllableClock> {
    init_test_tracing();
    Kevery::with_config(MemoryStore::new(), clock.clone(), KelConfig::default()).unwrap()
}

fn fully_witnessed(cues: &[Cue]) -> usize {
    cues.iter()
        .filter(|cue| matches!(cue, Cue::FullyWitnessed { .. }))
        .count()
}

#[test]
fn test_single_witness_receipt_completes_event() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let witness = Witness::new("w0");
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept_with(|b| b.with_witnesses(vec![witness.prefix()]).with_toad(1));

    assert!(kevery.process(&bytes(&icp))[0].is_accepted());
    let (prefix, said) = (alice.prefix(), alice.last_said());
    assert!(!kevery.is_fully_witnessed(&prefix, &said).unwrap());
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallyWitnessed).unwrap(), 1);
    assert_eq!(fully_witnessed(&kevery.drain_cues()), 0);

    let rct = witness.receipt(&icp.serder);
    let outcomes = kevery.process(&bytes(&rct));
    assert_matches!(outcomes.as_slice(), [Outcome::Receipted { witnessed: 1, .. }]);
    assert!(kevery.is_fully_witnessed(&prefix, &said).unwrap());
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallyWitnessed).unwrap(), 0);
    let cues = kevery.drain_cues();
    assert_eq!(fully_witnessed(&cues), 1);
    assert!(cues.contains(&Cue::FullyWitnessed {
        prefix: prefix.clone(),
        sn: 0,
        said: said.clone(),
    }));

    // A repeated receipt changes nothing
    let outcomes = kevery.process(&bytes(&rct));
    assert_matches!(outcomes.as_slice(), [Outcome::Receipted { witnessed: 1, .. }]);
    assert_eq!(fully_witnessed(&kevery.drain_cues()), 0);
    assert_eq!(kevery.db().receipts(&prefix, &said).unwrap().len(), 1);
}

#[test]
fn test_attached_witness_signatures() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let witnesses = [Witness::new("w0"), Witness::new("w1")];
    let mut alice = Controller::new("alice", 1);
    let mut icp = alice.incept_with(|b| {
        b.with_witnesses(witnesses.iter().map(Witness::prefix).collect())
            .with_toad(2)
    });
    icp.attachments.witness_sigs = vec![
        witnesses[0].wig(&icp.serder, 0),
        witnesses[1].wig(&icp.serder, 1),
    ];

    assert!(kevery.process(&bytes(&icp))[0].is_accepted());
    assert!(kevery
        .is_fully_witnessed(&alice.prefix(), &alice.last_said())
        .unwrap());
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallyWitnessed).unwrap(), 0);
    assert_eq!(fully_witnessed(&kevery.drain_cues()), 1);
}

#[test]
fn test_indexed_receipts_accumulate() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let witnesses = [Witness::new("w0"), Witness::new("w1"), Witness::new("w2")];
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept_with(|b| {
        b.with_witnesses(witnesses.iter().map(Witness::prefix).collect())
            .with_toad(2)
    });
    kevery.process(&bytes(&icp));

    let first = kevery.process(&bytes(&witnesses[2].indexed_receipt(&icp.serder, 2)));
    assert_matches!(first.as_slice(), [Outcome::Receipted { witnessed: 1, .. }]);
    assert!(!kevery
        .is_fully_witnessed(&alice.prefix(), &alice.last_said())
        .unwrap());

    // Signature at the wrong witness index is ignored
    let misplaced = kevery.process(&bytes(&witnesses[1].indexed_receipt(&icp.serder, 0)));
    assert_matches!(misplaced.as_slice(), [Outcome::Receipted { witnessed: 1, .. }]);

    let second = kevery.process(&bytes(&witnesses[0].indexed_receipt(&icp.serder, 0)));
    assert_matches!(second.as_slice(), [Outcome::Receipted { witnessed: 2, .. }]);
    assert!(kevery
        .is_fully_witnessed(&alice.prefix(), &alice.last_said())
        .unwrap());
}

#[test]
fn test_non_witness_receipt_does_not_count() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let witness = Witness::new("w0");
    let stranger = Witness::new("stranger");
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept_with(|b| b.with_witnesses(vec![witness.prefix()]).with_toad(1));
    kevery.process(&bytes(&icp));

    let outcomes = kevery.process(&bytes(&stranger.receipt(&icp.serder)));
    assert_matches!(outcomes.as_slice(), [Outcome::Receipted { witnessed: 0, .. }]);
    assert!(!kevery
        .is_fully_witnessed(&alice.prefix(), &alice.last_said())
        .unwrap());
    assert_eq!(kevery.escrowed(EscrowCategory::PartiallyWitnessed).unwrap(), 1);
}

#[test]
fn test_rotation_changes_witness_set() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let (old, new) = (Witness::new("w0"), Witness::new("w1"));
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept_with(|b| b.with_witnesses(vec![old.prefix()]).with_toad(1));
    let rot = alice.rotate_with(|b| {
        b.with_cuts(vec![old.prefix()])
            .with_adds(vec![new.prefix()])
            .with_toad(1)
    });
    kevery.process(&bytes(&icp));
    kevery.process(&bytes(&rot));
    assert_eq!(kevery.key_state(&alice.prefix()).unwrap().witnesses, vec![new.prefix()]);

    let outcomes = kevery.process(&bytes(&old.receipt(&rot.serder)));
    assert_matches!(outcomes.as_slice(), [Outcome::Receipted { witnessed: 0, .. }]);

    let outcomes = kevery.process(&bytes(&new.receipt(&rot.serder)));
    assert_matches!(outcomes.as_slice(), [Outcome::Receipted { witnessed: 1, .. }]);
    assert!(kevery
        .is_fully_witnessed(&alice.prefix(), &alice.last_said())
        .unwrap());
}

#[test]
fn test_unwitnessed_event_is_complete_on_acceptance() {
    let clock = ControllableClock::epoch();
    let mut kevery = kevery(&clock);
    let mut alice = Controller::new("alice", 1);
    kevery.process(&bytes(&alice.incept()));

    assert!(kevery
        .is_fully_witnessed(&alice.prefix(), &alice.last_said())
        .unwrap());
    assert_eq!(fully_witnessed(&kevery.drain_cues()), 1);
}
