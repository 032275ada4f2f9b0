//! Escrow tick driver
//!
//! Owns a [`Kevery`] and runs it on one task: an interval tick retries the
//! escrows, an optional inbox feeds it wire bytes, and a watch channel stops
//! it. The dispatcher itself stays synchronous; this is only the scheduler.

use crate::kevery::Kevery;
use crate::store::KvStore;
use keri_core::Clock;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Drives escrow retries for a dispatcher until shut down
pub struct EscrowDriver<S, C> {
    kevery: Kevery<S, C>,
    tick: Duration,
    inbox: Option<mpsc::Receiver<Vec<u8>>>,
    shutdown: watch::Receiver<bool>,
}

impl<S: KvStore, C: Clock> EscrowDriver<S, C> {
    /// Driver ticking at the dispatcher's configured interval
    pub fn new(kevery: Kevery<S, C>, shutdown: watch::Receiver<bool>) -> Self {
        let tick = kevery.config().tick_interval();
        Self {
            kevery,
            tick,
            inbox: None,
            shutdown,
        }
    }

    /// Also process wire bytes received on `inbox`
    pub fn with_inbox(mut self, inbox: mpsc::Receiver<Vec<u8>>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Run until the shutdown flag is set or its sender is dropped.
    ///
    /// Returns the dispatcher so its state can be inspected or reused.
    pub async fn run(self) -> Kevery<S, C> {
        let Self {
            mut kevery,
            tick,
            mut inbox,
            mut shutdown,
        } = self;
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbox_open = inbox.is_some();
        info!(tick_ms = tick.as_millis() as u64, "Escrow driver started");

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,

                _ = ticker.tick() => {
                    match kevery.process_escrows() {
                        Ok(report) => debug!(
                            promoted = report.promoted,
                            dropped = report.dropped,
                            retained = report.retained,
                            "Escrow tick"
                        ),
                        Err(err) => warn!(error = %err, "Escrow tick failed"),
                    }
                }

                received = recv(&mut inbox), if inbox_open => {
                    match received {
                        Some(bytes) => {
                            let outcomes = kevery.process(&bytes);
                            debug!(messages = outcomes.len(), "Processed inbound bytes");
                        }
                        None => inbox_open = false,
                    }
                }
            }
        }

        info!("Escrow driver stopped");
        kevery
    }
}

async fn recv(inbox: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
