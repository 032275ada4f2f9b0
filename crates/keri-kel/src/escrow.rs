//! Escrow stores
//!
//! Messages that cannot be applied yet wait here, one table per reason.
//! Entries are keyed `pre.sn.said` (plus a discriminator for receipt sets) and
//! carry their wire bytes, the time they were first escrowed and the number
//! of retry passes they have survived.

use crate::error::{KelError, Result};
use crate::store::{KvStore, WriteBatch};
use chrono::{DateTime, Utc};
use keri_core::{Diger, Prefixer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason a message is held back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EscrowCategory {
    /// Prior event not yet seen
    OutOfOrder,
    /// Too few controller signatures
    PartiallySigned,
    /// Accepted but short of its witness threshold
    PartiallyWitnessed,
    /// Delegator anchor not yet seen
    PartiallyDelegated,
    /// Receipt for an event not yet seen
    UnverifiedReceipt,
    /// Transferable receipt from an establishment event not yet seen
    UnverifiedTransReceipt,
}

impl EscrowCategory {
    /// Every category in retry order
    pub fn all() -> [EscrowCategory; 6] {
        [
            EscrowCategory::OutOfOrder,
            EscrowCategory::PartiallySigned,
            EscrowCategory::PartiallyDelegated,
            EscrowCategory::UnverifiedReceipt,
            EscrowCategory::UnverifiedTransReceipt,
            EscrowCategory::PartiallyWitnessed,
        ]
    }

    /// Backing table
    pub fn table(self) -> &'static str {
        match self {
            EscrowCategory::OutOfOrder => "ooes",
            EscrowCategory::PartiallySigned => "pses",
            EscrowCategory::PartiallyWitnessed => "pwes",
            EscrowCategory::PartiallyDelegated => "pdes",
            EscrowCategory::UnverifiedReceipt => "ures",
            EscrowCategory::UnverifiedTransReceipt => "vres",
        }
    }
}

impl fmt::Display for EscrowCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EscrowCategory::OutOfOrder => "out-of-order",
            EscrowCategory::PartiallySigned => "partially-signed",
            EscrowCategory::PartiallyWitnessed => "partially-witnessed",
            EscrowCategory::PartiallyDelegated => "partially-delegated",
            EscrowCategory::UnverifiedReceipt => "unverified-receipt",
            EscrowCategory::UnverifiedTransReceipt => "unverified-trans-receipt",
        };
        f.write_str(name)
    }
}

/// Why an escrow entry was removed without being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Held longer than the category timeout
    Expired,
    /// Retried the configured number of times
    RetriesExhausted,
    /// A retry failed permanently
    Rejected,
}

/// A held message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowEntry {
    /// Wire bytes of the message with its attachments
    pub message: Vec<u8>,
    /// When the message was first escrowed
    pub created: DateTime<Utc>,
    /// Retry passes survived
    pub attempts: u32,
}

impl EscrowEntry {
    /// Fresh entry
    pub fn new(message: Vec<u8>, created: DateTime<Utc>) -> Self {
        Self {
            message,
            created,
            attempts: 0,
        }
    }

    /// Whether the entry outlived `timeout` at `now`
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.created) > timeout
    }
}

/// Key of an escrow entry
pub fn escrow_key(prefix: &Prefixer, sn: u64, said: &Diger, discriminator: Option<&Diger>) -> Vec<u8> {
    let mut key = format!("{}.{sn:032x}.{}", prefix.qb64(), said.qb64());
    if let Some(tag) = discriminator {
        key.push('.');
        key.push_str(&tag.qb64());
    }
    key.into_bytes()
}

/// Read one entry
pub fn get<S: KvStore + ?Sized>(
    store: &S,
    category: EscrowCategory,
    key: &[u8],
) -> Result<Option<EscrowEntry>> {
    store
        .get(category.table(), key)?
        .map(|bytes| Ok(serde_cbor::from_slice(&bytes)?))
        .transpose()
}

/// Buffer an entry
pub fn put(
    batch: &mut WriteBatch,
    category: EscrowCategory,
    key: Vec<u8>,
    entry: &EscrowEntry,
) -> Result<()> {
    let bytes = serde_cbor::to_vec(entry).map_err(KelError::from)?;
    batch.put(category.table(), key, bytes);
    Ok(())
}

/// Buffer removal of an entry
pub fn remove(batch: &mut WriteBatch, category: EscrowCategory, key: Vec<u8>) {
    batch.delete(category.table(), key);
}

/// Entries of a category, oldest first
pub fn list<S: KvStore + ?Sized>(
    store: &S,
    category: EscrowCategory,
) -> Result<Vec<(Vec<u8>, EscrowEntry)>> {
    let mut entries = store
        .scan_prefix(category.table(), b"")?
        .into_iter()
        .map(|(key, bytes)| Ok((key, serde_cbor::from_slice::<EscrowEntry>(&bytes)?)))
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by(|(ka, a), (kb, b)| a.created.cmp(&b.created).then_with(|| ka.cmp(kb)));
    Ok(entries)
}

/// Number of entries held in a category
pub fn count<S: KvStore + ?Sized>(store: &S, category: EscrowCategory) -> Result<usize> {
    Ok(store.scan_prefix(category.table(), b"")?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    #[test]
    fn test_list_oldest_first() {
        let store = MemoryStore::new();
        let pre = Prefixer::self_addressing(&Diger::new(b"icp"));
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut batch = WriteBatch::new();
        for (sn, offset) in [(1u64, 30i64), (2, 10), (3, 20)] {
            let said = Diger::new(&sn.to_be_bytes());
            let entry = EscrowEntry::new(vec![sn as u8], t0 + chrono::Duration::seconds(offset));
            put(
                &mut batch,
                EscrowCategory::OutOfOrder,
                escrow_key(&pre, sn, &said, None),
                &entry,
            )
            .unwrap();
        }
        store.commit(batch).unwrap();

        let order: Vec<u8> = list(&store, EscrowCategory::OutOfOrder)
            .unwrap()
            .into_iter()
            .map(|(_, e)| e.message[0])
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(count(&store, EscrowCategory::OutOfOrder).unwrap(), 3);
        assert_eq!(count(&store, EscrowCategory::PartiallySigned).unwrap(), 0);
    }

    #[test]
    fn test_expiry() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = EscrowEntry::new(Vec::new(), t0);
        let timeout = chrono::Duration::seconds(60);
        assert!(!entry.is_expired(t0 + chrono::Duration::seconds(60), timeout));
        assert!(entry.is_expired(t0 + chrono::Duration::seconds(61), timeout));
    }

    #[test]
    fn test_tables_are_distinct() {
        let tables: std::collections::BTreeSet<_> =
            EscrowCategory::all().iter().map(|c| c.table()).collect();
        assert_eq!(tables.len(), 6);
    }
}
