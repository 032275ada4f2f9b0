//! Typed tables over a [`KvStore`]
//!
//! Keys are `prefix.said` for per-event records and `prefix.<32 hex digits>`
//! for ordinal-indexed ones, so a prefix scan over `prefix.` walks a KEL in
//! sequence or first-seen order. Structured values are CBOR.

use crate::error::{KelError, Result};
use crate::state::KeyState;
use crate::store::{KvStore, WriteBatch};
use keri_codec::{Serder, TransReceipt};
use keri_core::{Cigar, Dater, Diger, Matter, Prefixer, Seqner, Siger, Verfer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Raw event bytes by `pre.said`
pub const EVENTS: &str = "evts";
/// Controller signatures by `pre.said`
pub const SIGS: &str = "sigs";
/// Witness signatures by `pre.said`
pub const WIGS: &str = "wigs";
/// Accepted SAID by `pre.sn`
pub const KELS: &str = "kels";
/// SAID by `pre.fn` in first-seen order
pub const FELS: &str = "fels";
/// First-seen datetime by `pre.said`
pub const DTSS: &str = "dtss";
/// Non-transferable receipt couples by `pre.said`
pub const RCTS: &str = "rcts";
/// Transferable receipts by `pre.said`
pub const VRCS: &str = "vrcs";
/// Witness list and toad in force by `pre.said`
pub const WITS: &str = "wits";
/// Key state snapshot by `pre`
pub const STTS: &str = "stts";
/// Likely duplicitous SAIDs by `pre.sn`
pub const LDES: &str = "ldes";
/// Fully witnessed marker by `pre.said`
pub const FWES: &str = "fwes";

/// Key for a per-event record
pub fn said_key(prefix: &Prefixer, said: &Diger) -> Vec<u8> {
    format!("{}.{}", prefix.qb64(), said.qb64()).into_bytes()
}

/// Key for an ordinal-indexed record
pub fn ordinal_key(prefix: &Prefixer, ordinal: u64) -> Vec<u8> {
    format!("{}.{ordinal:032x}", prefix.qb64()).into_bytes()
}

/// Scan prefix covering every record of an identifier
pub fn prefix_scan(prefix: &Prefixer) -> Vec<u8> {
    format!("{}.", prefix.qb64()).into_bytes()
}

fn ordinal_of(key: &[u8]) -> Result<u64> {
    let hex = key
        .rsplit(|b| *b == b'.')
        .next()
        .ok_or_else(|| KelError::storage("ordinal key without separator"))?;
    let text = std::str::from_utf8(hex).map_err(|e| KelError::storage(e.to_string()))?;
    u64::from_str_radix(text, 16).map_err(|e| KelError::storage(format!("ordinal key: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_cbor::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_cbor::from_slice(bytes)?)
}

fn text(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| KelError::storage(e.to_string()))
}

/// Witnesses and witness threshold in force for one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessConfig {
    /// Witness identifiers
    pub witnesses: Vec<Prefixer>,
    /// Witness threshold
    pub toad: u64,
}

impl WitnessConfig {
    /// Position of `witness` in the list
    pub fn index_of(&self, witness: &Prefixer) -> Option<usize> {
        self.witnesses.iter().position(|w| w == witness)
    }
}

#[derive(Serialize, Deserialize)]
struct ReceiptCouple {
    receiptor: Verfer,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct TransReceiptRecord {
    prefix: Prefixer,
    sn: u64,
    said: Diger,
    siger: Siger,
}

/// Typed KEL database
#[derive(Debug, Clone)]
pub struct KelDb<S> {
    store: S,
}

impl<S: KvStore> KelDb<S> {
    /// Wrap a store
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Commit a step's writes
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.store.commit(batch)
    }

    fn get_record<T: DeserializeOwned>(&self, table: &str, key: &[u8]) -> Result<Option<T>> {
        self.store
            .get(table, key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Raw bytes of an accepted or evidenced event
    pub fn event(&self, prefix: &Prefixer, said: &Diger) -> Result<Option<Serder>> {
        let Some(raw) = self.store.get(EVENTS, &said_key(prefix, said))? else {
            return Ok(None);
        };
        let (serder, _) = Serder::parse(&raw).map_err(|e| KelError::storage(e.to_string()))?;
        Ok(Some(serder))
    }

    /// Buffer the raw bytes of an event
    pub fn put_event(&self, batch: &mut WriteBatch, prefix: &Prefixer, serder: &Serder) -> Result<()> {
        let said = serder.said()?;
        batch.put(EVENTS, said_key(prefix, &said), serder.raw().to_vec());
        Ok(())
    }

    /// SAID accepted at `sn`
    pub fn said_at(&self, prefix: &Prefixer, sn: u64) -> Result<Option<Diger>> {
        self.store
            .get(KELS, &ordinal_key(prefix, sn))?
            .map(|bytes| Ok(Diger::from_qb64(text(&bytes)?)?))
            .transpose()
    }

    /// Accepted event at `sn`
    pub fn event_at(&self, prefix: &Prefixer, sn: u64) -> Result<Option<Serder>> {
        match self.said_at(prefix, sn)? {
            Some(said) => self.event(prefix, &said),
            None => Ok(None),
        }
    }

    /// Buffer the accepted SAID at `sn`
    pub fn put_kel(&self, batch: &mut WriteBatch, prefix: &Prefixer, sn: u64, said: &Diger) {
        batch.put(KELS, ordinal_key(prefix, sn), said.qb64().into_bytes());
    }

    /// Accepted SAIDs in sequence order
    pub fn kel(&self, prefix: &Prefixer) -> Result<Vec<(u64, Diger)>> {
        self.store
            .scan_prefix(KELS, &prefix_scan(prefix))?
            .into_iter()
            .map(|(key, value)| Ok((ordinal_of(&key)?, Diger::from_qb64(text(&value)?)?)))
            .collect()
    }

    /// SAIDs in first-seen order with their ordinals
    pub fn first_seen(&self, prefix: &Prefixer) -> Result<Vec<(u64, Diger)>> {
        self.store
            .scan_prefix(FELS, &prefix_scan(prefix))?
            .into_iter()
            .map(|(key, value)| Ok((ordinal_of(&key)?, Diger::from_qb64(text(&value)?)?)))
            .collect()
    }

    /// Next unused first-seen ordinal
    pub fn next_fn(&self, prefix: &Prefixer) -> Result<u64> {
        let entries = self.store.scan_prefix(FELS, &prefix_scan(prefix))?;
        match entries.last() {
            Some((key, _)) => Ok(ordinal_of(key)? + 1),
            None => Ok(0),
        }
    }

    /// Buffer a first-seen record
    pub fn put_first_seen(
        &self,
        batch: &mut WriteBatch,
        prefix: &Prefixer,
        fn_ordinal: u64,
        said: &Diger,
        dater: &Dater,
    ) {
        batch.put(FELS, ordinal_key(prefix, fn_ordinal), said.qb64().into_bytes());
        batch.put(DTSS, said_key(prefix, said), dater.iso8601().into_bytes());
    }

    /// First-seen datetime of an event
    pub fn first_seen_at(&self, prefix: &Prefixer, said: &Diger) -> Result<Option<Dater>> {
        self.store
            .get(DTSS, &said_key(prefix, said))?
            .map(|bytes| Ok(Dater::from_iso8601(text(&bytes)?)?))
            .transpose()
    }

    /// Controller signatures stored for an event
    pub fn sigs(&self, prefix: &Prefixer, said: &Diger) -> Result<Vec<Siger>> {
        Ok(self
            .get_record(SIGS, &said_key(prefix, said))?
            .unwrap_or_default())
    }

    /// Buffer controller signatures
    pub fn put_sigs(
        &self,
        batch: &mut WriteBatch,
        prefix: &Prefixer,
        said: &Diger,
        sigs: &[Siger],
    ) -> Result<()> {
        batch.put(SIGS, said_key(prefix, said), encode(&sigs)?);
        Ok(())
    }

    /// Witness signatures stored for an event
    pub fn wigs(&self, prefix: &Prefixer, said: &Diger) -> Result<Vec<Siger>> {
        Ok(self
            .get_record(WIGS, &said_key(prefix, said))?
            .unwrap_or_default())
    }

    /// Buffer witness signatures
    pub fn put_wigs(
        &self,
        batch: &mut WriteBatch,
        prefix: &Prefixer,
        said: &Diger,
        wigs: &[Siger],
    ) -> Result<()> {
        batch.put(WIGS, said_key(prefix, said), encode(&wigs)?);
        Ok(())
    }

    /// Non-transferable receipts stored for an event
    pub fn receipts(&self, prefix: &Prefixer, said: &Diger) -> Result<Vec<Cigar>> {
        let couples: Vec<ReceiptCouple> = self
            .get_record(RCTS, &said_key(prefix, said))?
            .unwrap_or_default();
        couples
            .into_iter()
            .map(|c| Ok(Cigar::from_matter(Matter::from_qb64(&c.signature)?, Some(c.receiptor))?))
            .collect()
    }

    /// Buffer non-transferable receipts
    pub fn put_receipts(
        &self,
        batch: &mut WriteBatch,
        prefix: &Prefixer,
        said: &Diger,
        receipts: &[Cigar],
    ) -> Result<()> {
        let couples = receipts
            .iter()
            .filter_map(|cigar| {
                cigar.verfer().map(|verfer| ReceiptCouple {
                    receiptor: verfer.clone(),
                    signature: cigar.qb64(),
                })
            })
            .collect::<Vec<_>>();
        batch.put(RCTS, said_key(prefix, said), encode(&couples)?);
        Ok(())
    }

    /// Transferable receipts stored for an event
    pub fn trans_receipts(&self, prefix: &Prefixer, said: &Diger) -> Result<Vec<TransReceipt>> {
        let records: Vec<TransReceiptRecord> = self
            .get_record(VRCS, &said_key(prefix, said))?
            .unwrap_or_default();
        Ok(records
            .into_iter()
            .map(|r| TransReceipt {
                prefix: r.prefix,
                seqner: Seqner(u128::from(r.sn)),
                said: r.said,
                siger: r.siger,
            })
            .collect())
    }

    /// Buffer transferable receipts
    pub fn put_trans_receipts(
        &self,
        batch: &mut WriteBatch,
        prefix: &Prefixer,
        said: &Diger,
        receipts: &[TransReceipt],
    ) -> Result<()> {
        let records = receipts
            .iter()
            .map(|r| {
                Ok(TransReceiptRecord {
                    prefix: r.prefix.clone(),
                    sn: r.seqner.sn()?,
                    said: r.said.clone(),
                    siger: r.siger.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        batch.put(VRCS, said_key(prefix, said), encode(&records)?);
        Ok(())
    }

    /// Witness configuration in force for an event
    pub fn witnesses(&self, prefix: &Prefixer, said: &Diger) -> Result<Option<WitnessConfig>> {
        self.get_record(WITS, &said_key(prefix, said))
    }

    /// Buffer the witness configuration in force for an event
    pub fn put_witnesses(
        &self,
        batch: &mut WriteBatch,
        prefix: &Prefixer,
        said: &Diger,
        config: &WitnessConfig,
    ) -> Result<()> {
        batch.put(WITS, said_key(prefix, said), encode(config)?);
        Ok(())
    }

    /// Stored key state
    pub fn key_state(&self, prefix: &Prefixer) -> Result<Option<KeyState>> {
        self.get_record(STTS, prefix.qb64().as_bytes())
    }

    /// Every stored key state
    pub fn key_states(&self) -> Result<Vec<KeyState>> {
        self.store
            .scan_prefix(STTS, b"")?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    /// Buffer a key state snapshot
    pub fn put_key_state(&self, batch: &mut WriteBatch, state: &KeyState) -> Result<()> {
        batch.put(STTS, state.prefix.qb64().into_bytes(), encode(state)?);
        Ok(())
    }

    /// SAIDs recorded as likely duplicitous at `sn`
    pub fn duplicitous(&self, prefix: &Prefixer, sn: u64) -> Result<Vec<Diger>> {
        Ok(self
            .get_record(LDES, &ordinal_key(prefix, sn))?
            .unwrap_or_default())
    }

    /// Buffer the likely duplicitous SAIDs at `sn`
    pub fn put_duplicitous(
        &self,
        batch: &mut WriteBatch,
        prefix: &Prefixer,
        sn: u64,
        saids: &[Diger],
    ) -> Result<()> {
        batch.put(LDES, ordinal_key(prefix, sn), encode(&saids)?);
        Ok(())
    }

    /// Whether an event reached its witness threshold
    pub fn is_fully_witnessed(&self, prefix: &Prefixer, said: &Diger) -> Result<bool> {
        Ok(self.store.get(FWES, &said_key(prefix, said))?.is_some())
    }

    /// Buffer the fully witnessed marker with the time it was reached
    pub fn put_fully_witnessed(
        &self,
        batch: &mut WriteBatch,
        prefix: &Prefixer,
        said: &Diger,
        dater: &Dater,
    ) {
        batch.put(FWES, said_key(prefix, said), dater.iso8601().into_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use keri_core::Signer;

    fn prefix() -> Prefixer {
        Prefixer::self_addressing(&Diger::new(b"icp"))
    }

    #[test]
    fn test_ordinal_keys_sort_numerically() {
        let pre = prefix();
        assert!(ordinal_key(&pre, 2) < ordinal_key(&pre, 10));
        assert_eq!(ordinal_of(&ordinal_key(&pre, 0x1f)).unwrap(), 0x1f);
    }

    #[test]
    fn test_kel_and_first_seen_order() {
        let db = KelDb::new(MemoryStore::new());
        let pre = prefix();
        let dater = Dater(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let mut batch = WriteBatch::new();
        for sn in [0u64, 2, 1, 10] {
            let said = Diger::new(&sn.to_be_bytes());
            db.put_kel(&mut batch, &pre, sn, &said);
            db.put_first_seen(&mut batch, &pre, sn, &said, &dater);
        }
        db.commit(batch).unwrap();

        let sns: Vec<u64> = db.kel(&pre).unwrap().into_iter().map(|(sn, _)| sn).collect();
        assert_eq!(sns, vec![0, 1, 2, 10]);
        assert_eq!(db.next_fn(&pre).unwrap(), 11);
        let said = Diger::new(&2u64.to_be_bytes());
        assert_eq!(db.said_at(&pre, 2).unwrap(), Some(said.clone()));
        assert_eq!(db.first_seen_at(&pre, &said).unwrap(), Some(dater));
    }

    #[test]
    fn test_signature_and_receipt_records() {
        let db = KelDb::new(MemoryStore::new());
        let pre = prefix();
        let said = Diger::new(b"evt");
        let controller = Signer::from_seed([1; 32], true);
        let witness = Signer::from_seed([2; 32], false);
        let sigs = vec![controller.sign_indexed(b"evt", 0).unwrap()];
        let receipts = vec![witness.sign(b"evt")];

        let mut batch = WriteBatch::new();
        db.put_sigs(&mut batch, &pre, &said, &sigs).unwrap();
        db.put_receipts(&mut batch, &pre, &said, &receipts).unwrap();
        let config = WitnessConfig {
            witnesses: vec![Prefixer::basic(witness.verfer())],
            toad: 1,
        };
        db.put_witnesses(&mut batch, &pre, &said, &config).unwrap();
        db.commit(batch).unwrap();

        assert_eq!(db.sigs(&pre, &said).unwrap(), sigs);
        assert_eq!(db.receipts(&pre, &said).unwrap(), receipts);
        assert!(db.receipts(&pre, &said).unwrap()[0].verify(b"evt"));
        assert_eq!(db.witnesses(&pre, &said).unwrap(), Some(config));
        assert!(db.wigs(&pre, &said).unwrap().is_empty());
    }
}
