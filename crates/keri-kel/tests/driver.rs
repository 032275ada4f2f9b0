//! Escrow driver on a paused tokio clock.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

use keri_kel::{Cue, DropReason, EscrowCategory, EscrowDriver, KelConfig, Kevery, MemoryStore};
use keri_testkit::{bytes, init_test_tracing, ControllableClock, Controller};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn kevery(clock: &ControllableClock, config: KelConfig) -> Kevery<MemoryStore, ControllableClock> {
    init_test_tracing();
    Kevery::with_config(MemoryStore::new(), clock.clone(), config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_inbox_messages_processed_until_shutdown() {
    let clock = ControllableClock::epoch();
    let mut alice = Controller::new("alice", 1);
    let icp = alice.incept();
    let rot = alice.rotate();

    let (stop, shutdown) = watch::channel(false);
    let (tx, rx) = mpsc::channel(8);
    let driver = EscrowDriver::new(kevery(&clock, KelConfig::default()), shutdown).with_inbox(rx);
    let handle = tokio::spawn(driver.run());

    tx.send(bytes(&rot)).await.unwrap();
    tx.send(bytes(&icp)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    stop.send(true).unwrap();

    let kevery = handle.await.unwrap();
    assert_eq!(kevery.key_state(&alice.prefix()).unwrap().sn, 1);
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tick_expires_stale_entries() {
    let clock = ControllableClock::epoch();
    let config = KelConfig::from_toml_str(
        "escrow_tick_ms = 100\n[escrow]\nout_of_order_timeout_secs = 60",
    )
    .unwrap();
    let mut kevery = kevery(&clock, config);
    let mut alice = Controller::new("alice", 1);
    let _ = alice.incept();
    kevery.process(&bytes(&alice.rotate()));
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 1);

    let (stop, shutdown) = watch::channel(false);
    let handle = tokio::spawn(EscrowDriver::new(kevery, shutdown).run());

    clock.advance_secs(120);
    tokio::time::sleep(Duration::from_millis(250)).await;
    stop.send(true).unwrap();

    let mut kevery = handle.await.unwrap();
    assert_eq!(kevery.escrowed(EscrowCategory::OutOfOrder).unwrap(), 0);
    assert!(kevery.drain_cues().iter().any(|cue| matches!(
        cue,
        Cue::EscrowDropped { reason: DropReason::Expired, sn: 1, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_shutdown_sender_stops_driver() {
    let clock = ControllableClock::epoch();
    let (stop, shutdown) = watch::channel(false);
    let handle = tokio::spawn(EscrowDriver::new(kevery(&clock, KelConfig::default()), shutdown).run());
    drop(stop);
    let kevery = handle.await.unwrap();
    assert_eq!(kevery.prefixes().count(), 0);
}
