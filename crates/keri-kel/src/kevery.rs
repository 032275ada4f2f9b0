//! Event dispatcher
//!
//! [`Kevery`] turns raw bytes into decisions. Each parsed message is one
//! step: the step is validated against the in-memory key states and the
//! store, its writes are buffered in a single [`WriteBatch`], and only after
//! that batch commits is the owning [`Kever`] advanced. A failed step leaves
//! both the store and the key state untouched.
//!
//! Failures that more information could cure are not surfaced as errors.
//! They put the message in the matching escrow and report
//! [`Outcome::Escrowed`]. Any step that accepts an event or stores a receipt
//! triggers [`Kevery::process_escrows`], which retries escrowed messages until
//! a pass promotes nothing.

use crate::config::KelConfig;
use crate::db::{KelDb, WitnessConfig};
use crate::error::{ErrorCategory, KelError, Result};
use crate::escrow::{self, DropReason, EscrowCategory, EscrowEntry};
use crate::kever::Kever;
use crate::state::KeyState;
use crate::store::{KvStore, WriteBatch};
use keri_codec::{
    Attachments, EventKind, FirstSeen, Ilk, Kind, KeyEvent, Message, Parser, Seal, Serder,
    TransReceipt,
};
use keri_core::{Clock, Dater, Diger, Prefixer, Seqner, Siger, SystemClock, Verfer};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Decision taken for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Event appended to its KEL
    Accepted {
        /// Identifier
        prefix: Prefixer,
        /// Sequence number
        sn: u64,
        /// Event SAID
        said: Diger,
    },
    /// Receipts stored for an accepted event
    Receipted {
        /// Receipted identifier
        prefix: Prefixer,
        /// Receipted SAID
        said: Diger,
        /// Distinct witnesses that have now receipted the event
        witnessed: usize,
    },
    /// Event already in the KEL; attached receipts were still processed
    Duplicate {
        /// Identifier
        prefix: Prefixer,
        /// Sequence number
        sn: u64,
        /// Event SAID
        said: Diger,
    },
    /// Held until a missing prerequisite arrives
    Escrowed {
        /// Escrow the message went to
        category: EscrowCategory,
        /// Identifier
        prefix: Prefixer,
        /// Sequence number
        sn: u64,
    },
    /// Valid conflicting event recorded; the first-seen event stays authoritative
    Duplicitous {
        /// Identifier
        prefix: Prefixer,
        /// Contested sequence number
        sn: u64,
        /// SAID of the conflicting event
        said: Diger,
    },
    /// Permanently refused
    Rejected(KelError),
}

impl Outcome {
    /// Whether the message was appended to a KEL
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }

    /// Whether the step stored information an escrowed message may be waiting on
    fn makes_progress(&self) -> bool {
        matches!(self, Outcome::Accepted { .. } | Outcome::Receipted { .. })
    }
}

/// Notification for collaborators, drained with [`Kevery::drain_cues`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cue {
    /// Event appended to its KEL
    Accepted {
        /// Identifier
        prefix: Prefixer,
        /// Sequence number
        sn: u64,
        /// Event SAID
        said: Diger,
    },
    /// Event reached its witness threshold; fires once per event
    FullyWitnessed {
        /// Identifier
        prefix: Prefixer,
        /// Sequence number
        sn: u64,
        /// Event SAID
        said: Diger,
    },
    /// Conflicting event recorded
    Duplicitous {
        /// Identifier
        prefix: Prefixer,
        /// Contested sequence number
        sn: u64,
        /// SAID of the conflicting event
        said: Diger,
    },
    /// Message held in an escrow
    Escrowed {
        /// Escrow
        category: EscrowCategory,
        /// Identifier
        prefix: Prefixer,
        /// Sequence number
        sn: u64,
    },
    /// Escrowed message discarded
    EscrowDropped {
        /// Escrow
        category: EscrowCategory,
        /// Identifier
        prefix: Prefixer,
        /// Sequence number
        sn: u64,
        /// Why it was discarded
        reason: DropReason,
    },
}

/// Totals of one [`Kevery::process_escrows`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscrowReport {
    /// Retry passes run
    pub passes: usize,
    /// Entries applied and removed
    pub promoted: usize,
    /// Entries removed without being applied
    pub dropped: usize,
    /// Entries still held after the last pass
    pub retained: usize,
}

/// Writes and effects of a validated step, not yet committed
struct Applied {
    outcome: Outcome,
    batch: WriteBatch,
    update: Option<KeyState>,
    cues: Vec<Cue>,
}

impl Applied {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            batch: WriteBatch::new(),
            update: None,
            cues: Vec::new(),
        }
    }
}

/// Event a set of receipts applies to
struct Target<'a> {
    prefix: &'a Prefixer,
    sn: u64,
    said: &'a Diger,
    raw: &'a [u8],
}

struct Tally {
    witnessed: usize,
    unresolved: Vec<TransReceipt>,
}

enum Verification {
    Valid,
    Invalid,
    Unknown,
}

enum Retry {
    Promoted,
    Retained,
    Dropped,
}

fn message_id(serder: &Serder) -> Result<(Prefixer, u64, Diger)> {
    Ok((serder.prefix()?, serder.sn()?, serder.said()?))
}

fn decode_entry(entry: &EscrowEntry) -> Result<Message> {
    let mut parser = Parser::new();
    parser.feed(&entry.message);
    match parser.next_message()? {
        Some(message) if parser.pending() == 0 => Ok(message),
        _ => Err(KelError::storage(
            "escrow entry does not hold exactly one message",
        )),
    }
}

/// Key of the escrow entry for `bytes` in `category`
fn entry_key(
    category: EscrowCategory,
    prefix: &Prefixer,
    sn: u64,
    said: &Diger,
    bytes: &[u8],
) -> Vec<u8> {
    match category {
        EscrowCategory::UnverifiedReceipt | EscrowCategory::UnverifiedTransReceipt => {
            escrow::escrow_key(prefix, sn, said, Some(&Diger::new(bytes)))
        }
        _ => escrow::escrow_key(prefix, sn, said, None),
    }
}

/// Controller signatures of `held` added to `message` where its indices are free
fn merge_signatures(held: &Message, message: &Message) -> Message {
    let mut merged = message.clone();
    for siger in &held.attachments.controller_sigs {
        let taken = merged
            .attachments
            .controller_sigs
            .iter()
            .any(|s| s.index() == siger.index());
        if !taken {
            merged.attachments.controller_sigs.push(siger.clone());
        }
    }
    merged
}

/// Signatures that verify against `keys`, one per index
fn verified_sigs(sigs: &[Siger], keys: &[Verfer], raw: &[u8]) -> Vec<Siger> {
    let mut seen = BTreeSet::new();
    sigs.iter()
        .filter(|siger| {
            keys.get(siger.index() as usize)
                .is_some_and(|verfer| siger.verify(verfer, raw))
                && seen.insert(siger.index())
        })
        .cloned()
        .collect()
}

fn same_receipt(a: &TransReceipt, b: &TransReceipt) -> bool {
    a.prefix == b.prefix && a.said == b.said && a.siger.index() == b.siger.index()
}

/// Key event dispatcher over a store
pub struct Kevery<S, C = SystemClock> {
    db: KelDb<S>,
    clock: C,
    config: KelConfig,
    kevers: HashMap<Prefixer, Kever>,
    parser: Parser,
    cues: VecDeque<Cue>,
}

impl<S: KvStore> Kevery<S> {
    /// Dispatcher with default settings and the system clock
    pub fn new(store: S) -> Result<Self> {
        Self::with_config(store, SystemClock, KelConfig::default())
    }
}

impl<S: KvStore, C: Clock> Kevery<S, C> {
    /// Dispatcher over `store`, reloading any key states it holds
    pub fn with_config(store: S, clock: C, config: KelConfig) -> Result<Self> {
        config.validate()?;
        let db = KelDb::new(store);
        let kevers: HashMap<Prefixer, Kever> = db
            .key_states()?
            .into_iter()
            .map(|state| (state.prefix.clone(), Kever::from_state(state)))
            .collect();
        if !kevers.is_empty() {
            info!(identifiers = kevers.len(), "Reloaded key states");
        }
        Ok(Self {
            db,
            clock,
            config,
            kevers,
            parser: Parser::new(),
            cues: VecDeque::new(),
        })
    }

    /// Typed view of the store
    pub fn db(&self) -> &KelDb<S> {
        &self.db
    }

    /// Active settings
    pub fn config(&self) -> &KelConfig {
        &self.config
    }

    /// Current key state of an identifier
    pub fn key_state(&self, prefix: &Prefixer) -> Option<&KeyState> {
        self.kevers.get(prefix).map(Kever::state)
    }

    /// State machine of an identifier
    pub fn kever(&self, prefix: &Prefixer) -> Option<&Kever> {
        self.kevers.get(prefix)
    }

    /// Identifiers with an accepted inception
    pub fn prefixes(&self) -> impl Iterator<Item = &Prefixer> {
        self.kevers.keys()
    }

    /// Whether an accepted event reached its witness threshold
    pub fn is_fully_witnessed(&self, prefix: &Prefixer, said: &Diger) -> Result<bool> {
        self.db.is_fully_witnessed(prefix, said)
    }

    /// Conflicting SAIDs recorded at `sn`
    pub fn duplicitous(&self, prefix: &Prefixer, sn: u64) -> Result<Vec<Diger>> {
        self.db.duplicitous(prefix, sn)
    }

    /// Number of messages held in an escrow
    pub fn escrowed(&self, category: EscrowCategory) -> Result<usize> {
        escrow::count(self.db.store(), category)
    }

    /// Take every pending cue
    pub fn drain_cues(&mut self) -> Vec<Cue> {
        self.cues.drain(..).collect()
    }

    /// Feed bytes and process every message they complete.
    ///
    /// Partial trailing messages stay buffered for the next call. Malformed
    /// input flushes the buffer and is reported as a rejection.
    pub fn process(&mut self, bytes: &[u8]) -> Vec<Outcome> {
        self.parser.feed(bytes);
        let mut outcomes = Vec::new();
        loop {
            match self.parser.next_message() {
                Ok(Some(message)) => outcomes.push(self.process_message(&message)),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Rejected malformed stream");
                    outcomes.push(Outcome::Rejected(err.into()));
                    break;
                }
            }
        }
        if outcomes.iter().any(Outcome::makes_progress) {
            if let Err(err) = self.process_escrows() {
                warn!(error = %err, "Escrow processing failed");
            }
        }
        outcomes
    }

    /// Process one parsed message
    pub fn process_message(&mut self, message: &Message) -> Outcome {
        match self.attempt(message) {
            Ok(applied) => self.commit(applied, None),
            Err(err) => match err.category() {
                ErrorCategory::Deferred(category) => match self.defer(category, message) {
                    Ok(outcome) => outcome,
                    Err(err) => Outcome::Rejected(err),
                },
                _ => {
                    warn!(ilk = %message.serder.ilk(), error = %err, "Rejected message");
                    Outcome::Rejected(err)
                }
            },
        }
    }

    /// Commit a step, then advance the key state and publish its cues
    fn commit(&mut self, applied: Applied, origin: Option<(EscrowCategory, Vec<u8>)>) -> Outcome {
        let Applied {
            outcome,
            mut batch,
            update,
            cues,
        } = applied;
        if let Some((category, key)) = origin {
            escrow::remove(&mut batch, category, key);
        }
        if let Err(err) = self.db.commit(batch) {
            warn!(error = %err, "Step commit failed");
            return Outcome::Rejected(err);
        }
        if let Some(state) = update {
            match self.kevers.get_mut(&state.prefix) {
                Some(kever) => kever.replace(state),
                None => {
                    self.kevers
                        .insert(state.prefix.clone(), Kever::from_state(state));
                }
            }
        }
        self.cues.extend(cues);
        outcome
    }

    /// Validate a message and collect its writes without committing them
    fn attempt(&self, message: &Message) -> Result<Applied> {
        if message.serder.ilk() == Ilk::Rct {
            self.attempt_receipt(message)
        } else {
            self.attempt_event(message)
        }
    }

    fn attempt_event(&self, message: &Message) -> Result<Applied> {
        let serder = &message.serder;
        let event = serder.key_event()?;
        let sigs = &message.attachments.controller_sigs;
        let current = self.kevers.get(&event.prefix);
        let state = match current {
            None if !event.ilk().is_inception() => {
                return Err(KelError::OutOfOrder {
                    prefix: event.prefix.qb64(),
                    sn: event.sn,
                })
            }
            None => Kever::verify_inception(serder, &event, sigs)?,
            Some(kever) if event.sn <= kever.state().sn => {
                return self.attempt_duplicate(message, &event)
            }
            Some(kever) => kever.verify_update(serder, &event, sigs)?,
        };
        self.check_delegation(message, &event, current.map(Kever::state))?;
        self.log_event(message, &event, state)
    }

    /// Buffer the writes that append an event to its KEL
    fn log_event(&self, message: &Message, event: &KeyEvent, state: KeyState) -> Result<Applied> {
        let serder = &message.serder;
        let (prefix, said) = (&event.prefix, &event.said);
        let mut applied = Applied::new(Outcome::Accepted {
            prefix: prefix.clone(),
            sn: event.sn,
            said: said.clone(),
        });

        let sigs = verified_sigs(&message.attachments.controller_sigs, &state.keys, serder.raw());
        let fn_ordinal = self.db.next_fn(prefix)?;
        let dater = self.first_seen_dater(&message.attachments);
        let witnessing = WitnessConfig {
            witnesses: state.witnesses.clone(),
            toad: state.toad,
        };
        let batch = &mut applied.batch;
        self.db.put_event(batch, prefix, serder)?;
        self.db.put_sigs(batch, prefix, said, &sigs)?;
        self.db.put_kel(batch, prefix, event.sn, said);
        self.db.put_first_seen(batch, prefix, fn_ordinal, said, &dater);
        self.db.put_witnesses(batch, prefix, said, &witnessing)?;
        self.db.put_key_state(batch, &state)?;
        debug!(
            prefix = %prefix,
            sn = event.sn,
            ilk = %event.ilk(),
            fn_ordinal,
            "Accepted event"
        );
        applied.cues.push(Cue::Accepted {
            prefix: prefix.clone(),
            sn: event.sn,
            said: said.clone(),
        });

        let target = Target {
            prefix,
            sn: event.sn,
            said,
            raw: serder.raw(),
        };
        let tally = self.tally(&mut applied, &target, &witnessing, &message.attachments, true)?;
        self.escrow_unresolved(&mut applied, &target, serder.kind(), tally.unresolved)?;
        applied.update = Some(state);
        Ok(applied)
    }

    fn first_seen_dater(&self, attachments: &Attachments) -> Dater {
        if self.config.trust_replay_timestamps {
            if let Some(first_seen) = attachments.first_seen.first() {
                return first_seen.dater;
            }
        }
        Dater(self.clock.now())
    }

    /// Event at an already-filled sequence number: idempotent replay or duplicity
    fn attempt_duplicate(&self, message: &Message, event: &KeyEvent) -> Result<Applied> {
        let prefix = &event.prefix;
        let accepted = self.db.said_at(prefix, event.sn)?.ok_or_else(|| {
            KelError::storage(format!("KEL of {prefix} has no event at sn {}", event.sn))
        })?;

        if accepted == event.said {
            let witnessing = self.witnessing(prefix, &event.said)?;
            let mut applied = Applied::new(Outcome::Duplicate {
                prefix: prefix.clone(),
                sn: event.sn,
                said: event.said.clone(),
            });
            let target = Target {
                prefix,
                sn: event.sn,
                said: &event.said,
                raw: message.serder.raw(),
            };
            let tally =
                self.tally(&mut applied, &target, &witnessing, &message.attachments, false)?;
            self.escrow_unresolved(&mut applied, &target, message.serder.kind(), tally.unresolved)?;
            debug!(prefix = %prefix, sn = event.sn, "Duplicate event");
            return Ok(applied);
        }

        let mut recorded = self.db.duplicitous(prefix, event.sn)?;
        let outcome = Outcome::Duplicitous {
            prefix: prefix.clone(),
            sn: event.sn,
            said: event.said.clone(),
        };
        if recorded.contains(&event.said) {
            return Ok(Applied::new(outcome));
        }

        let sigs = &message.attachments.controller_sigs;
        let verdict = match self.state_before(prefix, event.sn)? {
            None => Kever::verify_inception(&message.serder, event, sigs).map(drop),
            Some(prior) => Kever::from_state(prior)
                .verify_update(&message.serder, event, sigs)
                .map(drop),
        };
        if let Err(err) = verdict {
            return Err(match err.category() {
                ErrorCategory::Deferred(_) | ErrorCategory::Duplicitous => KelError::unauthorized(
                    prefix,
                    event.sn,
                    format!("conflicting event not authorized: {err}"),
                ),
                _ => err,
            });
        }

        recorded.push(event.said.clone());
        let mut applied = Applied::new(outcome);
        self.db.put_event(&mut applied.batch, prefix, &message.serder)?;
        self.db.put_sigs(&mut applied.batch, prefix, &event.said, sigs)?;
        self.db
            .put_duplicitous(&mut applied.batch, prefix, event.sn, &recorded)?;
        warn!(
            prefix = %prefix,
            sn = event.sn,
            said = %event.said,
            first_seen = %accepted,
            "Duplicitous event recorded"
        );
        applied.cues.push(Cue::Duplicitous {
            prefix: prefix.clone(),
            sn: event.sn,
            said: event.said.clone(),
        });
        Ok(applied)
    }

    /// Key state in force just before `sn`, rebuilt from the stored KEL
    fn state_before(&self, prefix: &Prefixer, sn: u64) -> Result<Option<KeyState>> {
        let mut kever: Option<Kever> = None;
        for at in 0..sn {
            let serder = self.db.event_at(prefix, at)?.ok_or_else(|| {
                KelError::storage(format!("KEL of {prefix} has no event at sn {at}"))
            })?;
            let event = serder.key_event()?;
            let sigs = self.db.sigs(prefix, &event.said)?;
            let replayed = match kever.as_mut() {
                None => Kever::incept(&serder, &event, &sigs).map(Some),
                Some(current) => current.apply(&serder, &event, &sigs).map(|()| None),
            }
            .map_err(|err| {
                KelError::storage(format!(
                    "stored KEL of {prefix} does not replay at sn {at}: {err}"
                ))
            })?;
            if let Some(incepted) = replayed {
                kever = Some(incepted);
            }
        }
        Ok(kever.map(|k| k.state().clone()))
    }

    /// Require the delegator's KEL to anchor a delegated event
    fn check_delegation(
        &self,
        message: &Message,
        event: &KeyEvent,
        current: Option<&KeyState>,
    ) -> Result<()> {
        let delegator = match &event.kind {
            EventKind::DelegatedInception { delegator, .. } => delegator.clone(),
            EventKind::DelegatedRotation(_) => {
                match current.and_then(|state| state.delegator.clone()) {
                    Some(delegator) => delegator,
                    None => {
                        return Err(KelError::unauthorized(
                            &event.prefix,
                            event.sn,
                            "drt on an identifier without delegator",
                        ))
                    }
                }
            }
            _ => return Ok(()),
        };
        let missing = || KelError::MissingDelegation {
            prefix: event.prefix.qb64(),
            sn: event.sn,
        };
        let Some(delegating) = self.kevers.get(&delegator) else {
            return Err(missing());
        };
        if delegating.state().is_do_not_delegate() {
            return Err(KelError::unauthorized(
                &event.prefix,
                event.sn,
                format!("delegator {delegator} does not delegate"),
            ));
        }

        for source in &message.attachments.source_seals {
            let sn = source.seqner.sn()?;
            if self.db.said_at(&delegator, sn)?.as_ref() == Some(&source.said)
                && self.anchors(&delegator, &source.said, event)?
            {
                return Ok(());
            }
        }
        for (_, said) in self.db.kel(&delegator)?.iter().rev() {
            if self.anchors(&delegator, said, event)? {
                return Ok(());
            }
        }
        Err(missing())
    }

    /// Whether the delegator event `said` carries a seal for `event`
    fn anchors(&self, delegator: &Prefixer, said: &Diger, event: &KeyEvent) -> Result<bool> {
        let Some(serder) = self.db.event(delegator, said)? else {
            return Ok(false);
        };
        let anchoring = serder.key_event()?;
        Ok(anchoring.seals().iter().any(|seal| {
            matches!(seal, Seal::Event(s) if s.matches(&event.prefix, event.sn, &event.said))
        }))
    }

    fn witnessing(&self, prefix: &Prefixer, said: &Diger) -> Result<WitnessConfig> {
        self.db
            .witnesses(prefix, said)?
            .ok_or_else(|| KelError::storage(format!("no witness record for {prefix}:{said}")))
    }

    fn attempt_receipt(&self, message: &Message) -> Result<Applied> {
        let serder = &message.serder;
        let receipt = serder.receipt()?;
        let prefix = &receipt.prefix;
        let accepted = match self.kevers.get(prefix) {
            Some(kever) if receipt.sn <= kever.state().sn => self.db.said_at(prefix, receipt.sn)?,
            _ => None,
        };
        let Some(accepted) = accepted else {
            return Err(KelError::UnknownReceipted {
                prefix: prefix.qb64(),
                said: receipt.said.qb64(),
            });
        };
        if accepted != receipt.said {
            return Err(KelError::unauthorized(
                prefix,
                receipt.sn,
                "receipt for an event not in the KEL",
            ));
        }
        let event = self.db.event(prefix, &receipt.said)?.ok_or_else(|| {
            KelError::storage(format!("accepted event {prefix}:{} missing", receipt.said))
        })?;
        let witnessing = self.witnessing(prefix, &receipt.said)?;

        let target = Target {
            prefix,
            sn: receipt.sn,
            said: &receipt.said,
            raw: event.raw(),
        };
        let mut applied = Applied::new(Outcome::Receipted {
            prefix: prefix.clone(),
            said: receipt.said.clone(),
            witnessed: 0,
        });
        let tally = self.tally(&mut applied, &target, &witnessing, &message.attachments, false)?;

        let attachments = &message.attachments;
        let only_unresolved = attachments.witness_sigs.is_empty()
            && attachments.receipts.is_empty()
            && tally.unresolved.len() == attachments.trans_receipts.len();
        if let Some(first) = tally.unresolved.first().filter(|_| only_unresolved) {
            return Err(KelError::UnknownReceiptor {
                receiptor: first.prefix.qb64(),
                sn: first.seqner.sn()?,
            });
        }
        self.escrow_unresolved(&mut applied, &target, serder.kind(), tally.unresolved)?;
        debug!(
            prefix = %prefix,
            sn = receipt.sn,
            witnessed = tally.witnessed,
            "Stored receipts"
        );
        applied.outcome = Outcome::Receipted {
            prefix: prefix.clone(),
            said: receipt.said.clone(),
            witnessed: tally.witnessed,
        };
        Ok(applied)
    }

    fn verify_trans_receipt(&self, receipt: &TransReceipt, raw: &[u8]) -> Result<Verification> {
        let sn = receipt.seqner.sn()?;
        if self.db.said_at(&receipt.prefix, sn)?.as_ref() != Some(&receipt.said) {
            return Ok(Verification::Unknown);
        }
        let Some(serder) = self.db.event(&receipt.prefix, &receipt.said)? else {
            return Ok(Verification::Unknown);
        };
        let establishment = serder.key_event()?;
        let verfer = establishment
            .key_config()
            .and_then(|config| config.keys.get(receipt.siger.index() as usize));
        Ok(match verfer {
            Some(verfer) if receipt.siger.verify(verfer, raw) => Verification::Valid,
            _ => Verification::Invalid,
        })
    }

    /// Merge attached receipts into the stored ones and update witness accounting.
    ///
    /// `fresh` is set when the event is being accepted in this step, so
    /// nothing is stored for it yet.
    fn tally(
        &self,
        applied: &mut Applied,
        target: &Target<'_>,
        witnessing: &WitnessConfig,
        attachments: &Attachments,
        fresh: bool,
    ) -> Result<Tally> {
        let (prefix, said) = (target.prefix, target.said);

        let mut wigs = if fresh { Vec::new() } else { self.db.wigs(prefix, said)? };
        let mut wigs_changed = false;
        for wig in &attachments.witness_sigs {
            if wigs.iter().any(|w| w.index() == wig.index()) {
                continue;
            }
            let verfer = witnessing
                .witnesses
                .get(wig.index() as usize)
                .and_then(|witness| Verfer::from_qb64(&witness.qb64()).ok());
            match verfer {
                Some(verfer) if wig.verify(&verfer, target.raw) => {
                    wigs.push(wig.clone());
                    wigs_changed = true;
                }
                _ => debug!(prefix = %prefix, index = wig.index(), "Ignored witness signature"),
            }
        }
        if wigs_changed {
            self.db.put_wigs(&mut applied.batch, prefix, said, &wigs)?;
        }

        let mut couples = if fresh { Vec::new() } else { self.db.receipts(prefix, said)? };
        let mut couples_changed = false;
        for cigar in &attachments.receipts {
            let Some(verfer) = cigar.verfer() else {
                continue;
            };
            if couples.iter().any(|c| c.verfer() == Some(verfer)) {
                continue;
            }
            if cigar.verify(target.raw) {
                couples.push(cigar.clone());
                couples_changed = true;
            } else {
                debug!(prefix = %prefix, receiptor = %verfer, "Ignored receipt");
            }
        }
        if couples_changed {
            self.db.put_receipts(&mut applied.batch, prefix, said, &couples)?;
        }

        let mut trans = if fresh {
            Vec::new()
        } else {
            self.db.trans_receipts(prefix, said)?
        };
        let mut trans_changed = false;
        let mut unresolved = Vec::new();
        for receipt in &attachments.trans_receipts {
            if trans.iter().any(|t| same_receipt(t, receipt)) {
                continue;
            }
            match self.verify_trans_receipt(receipt, target.raw)? {
                Verification::Valid => {
                    trans.push(receipt.clone());
                    trans_changed = true;
                }
                Verification::Invalid => {
                    debug!(prefix = %prefix, receiptor = %receipt.prefix, "Ignored transferable receipt");
                }
                Verification::Unknown => unresolved.push(receipt.clone()),
            }
        }
        if trans_changed {
            self.db
                .put_trans_receipts(&mut applied.batch, prefix, said, &trans)?;
        }

        let mut witnessed: BTreeSet<usize> = wigs.iter().map(|w| w.index() as usize).collect();
        witnessed.extend(
            couples
                .iter()
                .filter_map(|c| c.verfer())
                .filter_map(|v| witnessing.index_of(&Prefixer::basic(v))),
        );
        witnessed.extend(trans.iter().filter_map(|t| witnessing.index_of(&t.prefix)));
        let count = witnessed.len();

        let pending_key = escrow::escrow_key(prefix, target.sn, said, None);
        let reached = witnessing.toad == 0 || count as u64 >= witnessing.toad;
        if reached {
            if fresh || !self.db.is_fully_witnessed(prefix, said)? {
                self.db.put_fully_witnessed(
                    &mut applied.batch,
                    prefix,
                    said,
                    &Dater(self.clock.now()),
                );
                if !fresh {
                    escrow::remove(
                        &mut applied.batch,
                        EscrowCategory::PartiallyWitnessed,
                        pending_key,
                    );
                }
                if witnessing.toad > 0 {
                    info!(prefix = %prefix, sn = target.sn, witnessed = count, toad = witnessing.toad, "Event fully witnessed");
                }
                applied.cues.push(Cue::FullyWitnessed {
                    prefix: prefix.clone(),
                    sn: target.sn,
                    said: said.clone(),
                });
            }
        } else if fresh {
            let entry = EscrowEntry::new(target.raw.to_vec(), self.clock.now());
            escrow::put(
                &mut applied.batch,
                EscrowCategory::PartiallyWitnessed,
                pending_key,
                &entry,
            )?;
            debug!(
                prefix = %prefix,
                sn = target.sn,
                witnessed = count,
                toad = witnessing.toad,
                "Awaiting witness receipts"
            );
        }

        Ok(Tally {
            witnessed: count,
            unresolved,
        })
    }

    /// Escrow transferable receipts whose receiptor is not yet known, as a receipt message
    fn escrow_unresolved(
        &self,
        applied: &mut Applied,
        target: &Target<'_>,
        kind: Kind,
        unresolved: Vec<TransReceipt>,
    ) -> Result<()> {
        if unresolved.is_empty() {
            return Ok(());
        }
        let message = Message {
            serder: keri_codec::receipt(target.prefix, target.sn, target.said, kind)?,
            attachments: Attachments {
                trans_receipts: unresolved,
                ..Attachments::default()
            },
        };
        let bytes = message.to_bytes(false)?;
        let category = EscrowCategory::UnverifiedTransReceipt;
        let key = entry_key(category, target.prefix, target.sn, target.said, &bytes);
        escrow::put(
            &mut applied.batch,
            category,
            key,
            &EscrowEntry::new(bytes, self.clock.now()),
        )?;
        applied.cues.push(Cue::Escrowed {
            category,
            prefix: target.prefix.clone(),
            sn: target.sn,
        });
        Ok(())
    }

    /// Hold a message whose prerequisites are missing
    fn defer(&mut self, category: EscrowCategory, message: &Message) -> Result<Outcome> {
        let (prefix, sn, said) = message_id(&message.serder)?;
        let mut category = category;
        let mut entry = EscrowEntry::new(message.to_bytes(false)?, self.clock.now());
        let mut key = entry_key(category, &prefix, sn, &said, &entry.message);
        let mut batch = WriteBatch::new();

        if category == EscrowCategory::PartiallySigned {
            if let Some(held) = escrow::get(self.db.store(), category, &key)? {
                let merged = merge_signatures(&decode_entry(&held)?, message);
                match self.attempt(&merged) {
                    Ok(applied) => {
                        info!(prefix = %prefix, sn, "Partially signed event completed");
                        return Ok(self.commit(applied, Some((category, key))));
                    }
                    Err(err) => match err.category() {
                        ErrorCategory::Deferred(next) => {
                            entry = EscrowEntry {
                                message: merged.to_bytes(false)?,
                                created: held.created,
                                attempts: held.attempts,
                            };
                            if next != category {
                                escrow::remove(&mut batch, category, key);
                                category = next;
                                key = entry_key(category, &prefix, sn, &said, &entry.message);
                            }
                        }
                        _ => {
                            warn!(prefix = %prefix, sn, error = %err, "Rejected message");
                            return Ok(Outcome::Rejected(err));
                        }
                    },
                }
            }
        }

        escrow::put(&mut batch, category, key, &entry)?;
        self.db.commit(batch)?;
        debug!(prefix = %prefix, sn, category = %category, "Escrowed message");
        self.cues.push_back(Cue::Escrowed {
            category,
            prefix: prefix.clone(),
            sn,
        });
        Ok(Outcome::Escrowed {
            category,
            prefix,
            sn,
        })
    }

    /// Retry escrowed messages until a pass promotes nothing.
    ///
    /// Within a category entries are retried oldest first. Entries past their
    /// category timeout or retry budget are dropped with a cue. A call spends
    /// at most one attempt of each entry's budget however many passes it runs.
    pub fn process_escrows(&mut self) -> Result<EscrowReport> {
        let mut report = EscrowReport::default();
        let mut counted = HashSet::new();
        loop {
            let pass = self.escrow_pass(&mut counted)?;
            report.passes += 1;
            report.promoted += pass.promoted;
            report.dropped += pass.dropped;
            report.retained = pass.retained;
            if pass.promoted == 0 {
                break;
            }
        }
        if report.promoted > 0 || report.dropped > 0 {
            debug!(
                passes = report.passes,
                promoted = report.promoted,
                dropped = report.dropped,
                retained = report.retained,
                "Processed escrows"
            );
        }
        Ok(report)
    }

    fn escrow_pass(&mut self, counted: &mut HashSet<(EscrowCategory, Vec<u8>)>) -> Result<EscrowReport> {
        let mut pass = EscrowReport::default();
        for category in EscrowCategory::all() {
            for (key, _) in escrow::list(self.db.store(), category)? {
                // An earlier promotion in this pass may have cleared or moved the entry.
                let Some(entry) = escrow::get(self.db.store(), category, &key)? else {
                    continue;
                };
                match self.retry(category, key, entry, counted)? {
                    Retry::Promoted => pass.promoted += 1,
                    Retry::Retained => pass.retained += 1,
                    Retry::Dropped => pass.dropped += 1,
                }
            }
        }
        Ok(pass)
    }

    fn retry(
        &mut self,
        category: EscrowCategory,
        key: Vec<u8>,
        entry: EscrowEntry,
        counted: &mut HashSet<(EscrowCategory, Vec<u8>)>,
    ) -> Result<Retry> {
        let message = decode_entry(&entry);
        let id = message
            .as_ref()
            .ok()
            .and_then(|m| message_id(&m.serder).ok());

        let now = self.clock.now();
        if entry.is_expired(now, self.config.escrow.timeout(category)) {
            return self.drop_entry(category, key, id, DropReason::Expired);
        }
        let recounted = counted.contains(&(category, key.clone()));
        if category != EscrowCategory::PartiallyWitnessed
            && !recounted
            && entry.attempts >= self.config.escrow.max_retries
        {
            return self.drop_entry(category, key, id, DropReason::RetriesExhausted);
        }
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(category = %category, error = %err, "Undecodable escrow entry");
                return self.drop_entry(category, key, id, DropReason::Rejected);
            }
        };
        // Cleared by the receipt that completes the witness threshold.
        if category == EscrowCategory::PartiallyWitnessed {
            return Ok(Retry::Retained);
        }

        match self.attempt(&message) {
            Ok(applied) => match self.commit(applied, Some((category, key))) {
                Outcome::Rejected(err) => Err(err),
                outcome => {
                    info!(category = %category, outcome = ?outcome, "Promoted escrowed message");
                    Ok(Retry::Promoted)
                }
            },
            Err(err) => match err.category() {
                ErrorCategory::Deferred(next) => {
                    let attempts = if recounted {
                        entry.attempts
                    } else {
                        entry.attempts + 1
                    };
                    let held = EscrowEntry { attempts, ..entry };
                    let mut batch = WriteBatch::new();
                    let held_at = if next == category {
                        escrow::put(&mut batch, category, key.clone(), &held)?;
                        key
                    } else {
                        let (prefix, sn, said) = message_id(&message.serder)?;
                        escrow::remove(&mut batch, category, key);
                        let moved = entry_key(next, &prefix, sn, &said, &held.message);
                        escrow::put(&mut batch, next, moved.clone(), &held)?;
                        moved
                    };
                    self.db.commit(batch)?;
                    counted.insert((next, held_at));
                    debug!(
                        category = %category,
                        next = %next,
                        attempts = held.attempts,
                        reason = %err,
                        "Escrowed message still pending"
                    );
                    Ok(Retry::Retained)
                }
                ErrorCategory::Storage => Err(err),
                _ => {
                    warn!(category = %category, error = %err, "Escrowed message rejected");
                    self.drop_entry(category, key, id, DropReason::Rejected)
                }
            },
        }
    }

    fn drop_entry(
        &mut self,
        category: EscrowCategory,
        key: Vec<u8>,
        id: Option<(Prefixer, u64, Diger)>,
        reason: DropReason,
    ) -> Result<Retry> {
        let mut batch = WriteBatch::new();
        escrow::remove(&mut batch, category, key);
        self.db.commit(batch)?;
        warn!(category = %category, reason = ?reason, "Dropped escrowed message");
        if let Some((prefix, sn, _)) = id {
            self.cues.push_back(Cue::EscrowDropped {
                category,
                prefix,
                sn,
                reason,
            });
        }
        Ok(Retry::Dropped)
    }

    /// First-seen ordered clone of a KEL.
    ///
    /// Each message carries its controller signatures, any witness
    /// signatures and a first-seen couple.
    pub fn replay(&self, prefix: &Prefixer) -> Result<Vec<Message>> {
        self.db
            .first_seen(prefix)?
            .into_iter()
            .map(|(fn_ordinal, said)| {
                let serder = self.db.event(prefix, &said)?.ok_or_else(|| {
                    KelError::storage(format!("first-seen event {prefix}:{said} missing"))
                })?;
                let dater = self
                    .db
                    .first_seen_at(prefix, &said)?
                    .ok_or_else(|| KelError::storage(format!("no first-seen time for {said}")))?;
                Ok(Message {
                    serder,
                    attachments: Attachments {
                        controller_sigs: self.db.sigs(prefix, &said)?,
                        witness_sigs: self.db.wigs(prefix, &said)?,
                        first_seen: vec![FirstSeen {
                            fn_ordinal: Seqner(u128::from(fn_ordinal)),
                            dater,
                        }],
                        ..Attachments::default()
                    },
                })
            })
            .collect()
    }

    /// [`Kevery::replay`] as one text stream
    pub fn replay_bytes(&self, prefix: &Prefixer) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for message in self.replay(prefix)? {
            out.extend(message.to_bytes(false)?);
        }
        Ok(out)
    }
}

impl<S, C> std::fmt::Debug for Kevery<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kevery")
            .field("identifiers", &self.kevers.len())
            .field("cues", &self.cues.len())
            .field("buffered", &self.parser.pending())
            .finish_non_exhaustive()
    }
}
