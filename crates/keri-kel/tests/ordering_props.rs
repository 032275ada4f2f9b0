//! Property tests: delivery order does not change the resulting key state.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

use keri_kel::{EscrowCategory, KelConfig, Kevery, MemoryStore};
use keri_testkit::{bytes, ControllableClock, Controller, Witness};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_delivery_order_converges(order in Just((0..5).collect::<Vec<usize>>()).prop_shuffle()) {
        let mut alice = Controller::new("alice", 2);
        let messages = vec![
            alice.incept(),
            alice.rotate(),
            alice.interact(Vec::new()),
            alice.rotate(),
            alice.interact(Vec::new()),
        ];

        let clock = ControllableClock::epoch();
        let mut kevery =
            Kevery::with_config(MemoryStore::new(), clock.clone(), KelConfig::default()).unwrap();
        for index in order {
            kevery.process(&bytes(&messages[index]));
            clock.advance_secs(1);
        }

        let state = kevery.key_state(&alice.prefix()).cloned();
        prop_assert_eq!(state.as_ref().map(|s| s.sn), Some(4));
        prop_assert_eq!(state.map(|s| s.last_said), Some(alice.last_said()));
        prop_assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 0);
        let first_seen = kevery.db().first_seen(&alice.prefix()).unwrap();
        prop_assert_eq!(first_seen.len(), 5);
    }

    #[test]
    fn receipts_before_or_after_event_complete_witnessing(receipt_first in any::<bool>()) {
        let witnesses = [Witness::new("w0"), Witness::new("w1")];
        let mut alice = Controller::new("alice", 1);
        let icp = alice.incept_with(|b| {
            b.with_witnesses(witnesses.iter().map(Witness::prefix).collect())
                .with_toad(2)
        });
        let receipts: Vec<_> = witnesses.iter().map(|w| bytes(&w.receipt(&icp.serder))).collect();

        let mut kevery =
            Kevery::with_config(MemoryStore::new(), ControllableClock::epoch(), KelConfig::default())
                .unwrap();
        if receipt_first {
            for receipt in &receipts {
                kevery.process(receipt);
            }
            kevery.process(&bytes(&icp));
        } else {
            kevery.process(&bytes(&icp));
            for receipt in &receipts {
                kevery.process(receipt);
            }
        }

        prop_assert!(kevery.is_fully_witnessed(&alice.prefix(), &alice.last_said()).unwrap());
        prop_assert_eq!(kevery.escrowed(EscrowCategory::UnverifiedReceipt).unwrap(), 0);
        prop_assert_eq!(kevery.escrowed(EscrowCategory::PartiallyWitnessed).unwrap(), 0);
    }
}
