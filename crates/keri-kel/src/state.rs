//! Materialized key state

use keri_codec::{ConfigTrait, Ilk};
use keri_core::{Diger, Prefixer, Result, Tholder, ThresholdRole, ThresholdSpec, Verfer};
use serde::{Deserialize, Serialize};

/// Steady states of a key-state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeverStatus {
    /// Rotations and interactions accepted
    Active,
    /// No next keys committed; only interactions accepted
    Abandoned,
}

/// Pointer to an establishment event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishmentPoint {
    /// Sequence number
    pub sn: u64,
    /// SAID
    pub said: Diger,
}

/// Current verified state of one identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    /// Identifier
    pub prefix: Prefixer,
    /// Sequence number of the latest event
    pub sn: u64,
    /// SAID of the latest event
    pub last_said: Diger,
    /// Ilk of the latest event
    pub last_ilk: Ilk,
    /// Current signing keys
    pub keys: Vec<Verfer>,
    /// Current signing threshold
    pub threshold: ThresholdSpec,
    /// Next signing threshold
    pub next_threshold: ThresholdSpec,
    /// Committed next key digests
    pub next_digests: Vec<Diger>,
    /// Current witnesses
    pub witnesses: Vec<Prefixer>,
    /// Witness threshold
    pub toad: u64,
    /// Configuration traits from inception
    pub config: Vec<ConfigTrait>,
    /// Delegator, for delegated identifiers
    pub delegator: Option<Prefixer>,
    /// Latest establishment event
    pub last_establishment: EstablishmentPoint,
}

impl KeyState {
    /// Steady state
    pub fn status(&self) -> KeverStatus {
        if self.is_abandoned() {
            KeverStatus::Abandoned
        } else {
            KeverStatus::Active
        }
    }

    /// Whether a rotation committed to no next keys
    pub fn is_abandoned(&self) -> bool {
        self.prefix.is_transferable() && self.next_digests.is_empty()
    }

    /// Whether the identifier can ever change keys
    pub fn is_transferable(&self) -> bool {
        self.prefix.is_transferable() && !self.next_digests.is_empty()
    }

    /// Whether interactions are barred
    pub fn is_establishment_only(&self) -> bool {
        self.config.contains(&ConfigTrait::EstablishmentOnly)
    }

    /// Whether this identifier refuses to act as a delegator
    pub fn is_do_not_delegate(&self) -> bool {
        self.config.contains(&ConfigTrait::DoNotDelegate)
    }

    /// Current signing threshold bound to the current keys
    pub fn tholder(&self) -> Result<Tholder> {
        Tholder::for_keys(&self.threshold, self.keys.len(), ThresholdRole::Current)
    }

    /// Next signing threshold bound to the committed digests
    pub fn next_tholder(&self) -> Result<Tholder> {
        Tholder::for_keys(
            &self.next_threshold,
            self.next_digests.len(),
            ThresholdRole::Next,
        )
    }

    /// Position of `witness` in the current witness list
    pub fn witness_index(&self, witness: &Prefixer) -> Option<usize> {
        self.witnesses.iter().position(|w| w == witness)
    }
}
