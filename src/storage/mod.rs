//! Persistent keyed store backed by sled.
//!
//! Key layout (single tree, prefix-partitioned):
//!   shr:<timestamp BE 8><seq BE 8>  → ShareRecord        (sliding window)
//!   rnd:<address>                   → u64                 (round share counter)
//!   blk:<status>:<height BE 8><hash>→ BlockRecord
//!   led:<address>                   → MinerLedger
//!   txn:<timestamp BE 8><address>   → PaymentRecord
//!   bl:<address lowercase>          → ()
//!   wl:<ip>                         → ()
//!   srs:h:<timestamp BE 8>          → u64                 (pool hashrate)
//!   srs:w:<timestamp BE 8>          → u64                 (worker count)
//!   meta:payout_lock                → (token, deadline)
//!
//! sled has no native TTL, so the share window is pruned by key range
//! on every insert; every reader sees only live keys. Ledger rows are
//! updated through compare-and-swap loops so each transition is a
//! single atomic balance move.

use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::core::params::SERIES_CAPACITY;
use crate::core::types::{BlockRecord, BlockStatus, MinerLedger, ShareRecord};

const PREFIX_SHARE: &[u8] = b"shr:";
const PREFIX_ROUND: &[u8] = b"rnd:";
const PREFIX_BLOCK: &[u8] = b"blk:";
const PREFIX_LEDGER: &[u8] = b"led:";
const PREFIX_PAYMENT: &[u8] = b"txn:";
const PREFIX_CREDITS: &[u8] = b"crd:";
const PREFIX_BLACKLIST: &[u8] = b"bl:";
const PREFIX_WHITELIST: &[u8] = b"wl:";
const PREFIX_SERIES_HASHRATE: &[u8] = b"srs:h:";
const PREFIX_SERIES_WORKERS: &[u8] = b"srs:w:";
const KEY_PAYOUT_LOCK: &[u8] = b"meta:payout_lock";

/// Ledger row reserved for accumulated pool fees. Kept in the same
/// namespace so conservation is checkable across every row.
pub const FEE_ADDRESS: &str = "!fees";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("insufficient balance for {address}: have {have}, need {need}")]
    InsufficientBalance { address: String, have: u64, need: u64 },
}

/// A completed payout, recorded when a batch transfer confirms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub address: String,
    pub amount: u64,
    pub tx_hash: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PayoutLock {
    token: String,
    deadline: u64,
}

pub struct Store {
    db: Db,
    share_seq: AtomicU64,
}

pub fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn prefixed_key(prefix: &[u8], data: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + data.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(data);
    key
}

/// Smallest key strictly greater than every key with this prefix.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    *end.last_mut().unwrap() += 1;
    end
}

impl Store {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Store { db, share_seq: AtomicU64::new(0) })
    }

    // ─── Share Window ────────────────────────────────────────────────

    /// Append a share to the sliding window, bump the finder's round
    /// counter, and prune everything older than `window_secs`.
    pub fn write_share(&self, share: &ShareRecord, window_secs: u64) -> Result<(), StoreError> {
        let seq = self.share_seq.fetch_add(1, Ordering::Relaxed);
        let mut suffix = [0u8; 16];
        suffix[..8].copy_from_slice(&share.timestamp.to_be_bytes());
        suffix[8..].copy_from_slice(&seq.to_be_bytes());
        let key = prefixed_key(PREFIX_SHARE, &suffix);
        self.db.insert(key, bincode::serialize(share)?)?;

        self.bump_round_shares(&share.address, share.difficulty)?;
        self.prune_shares(now_secs().saturating_sub(window_secs))?;
        Ok(())
    }

    /// All shares with `timestamp >= since`, oldest first.
    pub fn read_window(&self, since: u64) -> Result<Vec<ShareRecord>, StoreError> {
        let start = prefixed_key(PREFIX_SHARE, &since.to_be_bytes());
        let end = prefix_end(PREFIX_SHARE);
        let mut shares = Vec::new();
        for item in self.db.range(start..end) {
            let (_, value) = item?;
            shares.push(bincode::deserialize(&value)?);
        }
        Ok(shares)
    }

    fn prune_shares(&self, cutoff: u64) -> Result<(), StoreError> {
        let start = PREFIX_SHARE.to_vec();
        let end = prefixed_key(PREFIX_SHARE, &cutoff.to_be_bytes());
        let stale: Vec<_> = self
            .db
            .range(start..end)
            .keys()
            .collect::<Result<Vec<_>, _>>()?;
        for key in stale {
            self.db.remove(key)?;
        }
        Ok(())
    }

    fn bump_round_shares(&self, address: &str, difficulty: u64) -> Result<(), StoreError> {
        let key = prefixed_key(PREFIX_ROUND, address.as_bytes());
        self.db.update_and_fetch(key, |old| {
            let current = old
                .and_then(|b| b.try_into().ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            Some(current.saturating_add(difficulty).to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    /// Sum and clear the per-address round counters. Called when a
    /// block is found so the candidate row can carry the round total.
    pub fn take_round_shares(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        let keys: Vec<_> = self
            .db
            .scan_prefix(PREFIX_ROUND)
            .collect::<Result<Vec<_>, _>>()?;
        for (key, value) in keys {
            if let Ok(bytes) = <[u8; 8]>::try_from(value.as_ref()) {
                total = total.saturating_add(u64::from_be_bytes(bytes));
            }
            self.db.remove(key)?;
        }
        Ok(total)
    }

    // ─── Block Rows ──────────────────────────────────────────────────

    fn block_key(status: BlockStatus, height: u64, hash: &str) -> Vec<u8> {
        let mut key = PREFIX_BLOCK.to_vec();
        key.extend_from_slice(status.as_str().as_bytes());
        key.push(b':');
        key.extend_from_slice(&height.to_be_bytes());
        key.extend_from_slice(hash.as_bytes());
        key
    }

    /// Insert a candidate row. Idempotent by (height, hash): returns
    /// false when the row already exists, so a resubmitted winning
    /// share cannot create a second candidate.
    pub fn insert_candidate(&self, block: &BlockRecord) -> Result<bool, StoreError> {
        let key = Self::block_key(BlockStatus::Candidate, block.height, &block.hash);
        if self.db.contains_key(&key)? {
            return Ok(false);
        }
        self.db.insert(key, bincode::serialize(block)?)?;
        Ok(true)
    }

    /// All rows in a given lifecycle state, lowest height first.
    pub fn blocks_by_status(&self, status: BlockStatus) -> Result<Vec<BlockRecord>, StoreError> {
        let mut prefix = PREFIX_BLOCK.to_vec();
        prefix.extend_from_slice(status.as_str().as_bytes());
        prefix.push(b':');
        let mut blocks = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (_, value) = item?;
            blocks.push(bincode::deserialize(&value)?);
        }
        Ok(blocks)
    }

    /// Move a block row between lifecycle states, persisting the
    /// updated record under the new key.
    pub fn move_block(
        &self,
        block: &BlockRecord,
        from: BlockStatus,
        to: BlockStatus,
    ) -> Result<(), StoreError> {
        let old_key = Self::block_key(from, block.height, &block.hash);
        let mut updated = block.clone();
        updated.status = to;
        let new_key = Self::block_key(to, block.height, &block.hash);
        self.db.insert(new_key, bincode::serialize(&updated)?)?;
        self.db.remove(old_key)?;
        Ok(())
    }

    /// Update a row in place (confirmations, reward) without a state
    /// change.
    pub fn update_block(&self, block: &BlockRecord) -> Result<(), StoreError> {
        let key = Self::block_key(block.status, block.height, &block.hash);
        self.db.insert(key, bincode::serialize(block)?)?;
        Ok(())
    }

    /// Drop an orphaned row entirely.
    pub fn remove_block(&self, block: &BlockRecord, status: BlockStatus) -> Result<(), StoreError> {
        self.db.remove(Self::block_key(status, block.height, &block.hash))?;
        Ok(())
    }

    // ─── Block Credits ───────────────────────────────────────────────
    // The immature amounts credited per address when a block left the
    // candidate state; consumed when the block matures.

    fn credits_key(height: u64, hash: &str) -> Vec<u8> {
        let mut key = PREFIX_CREDITS.to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        key.extend_from_slice(hash.as_bytes());
        key
    }

    pub fn store_block_credits(
        &self,
        block: &BlockRecord,
        credits: &[(String, u64)],
    ) -> Result<(), StoreError> {
        let key = Self::credits_key(block.height, &block.hash);
        self.db.insert(key, bincode::serialize(&credits.to_vec())?)?;
        Ok(())
    }

    pub fn block_credits(&self, block: &BlockRecord) -> Result<Vec<(String, u64)>, StoreError> {
        let key = Self::credits_key(block.height, &block.hash);
        match self.db.get(key)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn remove_block_credits(&self, block: &BlockRecord) -> Result<(), StoreError> {
        self.db.remove(Self::credits_key(block.height, &block.hash))?;
        Ok(())
    }

    // ─── Miner Ledger ────────────────────────────────────────────────

    fn read_ledger_raw(&self, key: &[u8]) -> Result<(Option<sled::IVec>, MinerLedger), StoreError> {
        let raw = self.db.get(key)?;
        let ledger = match &raw {
            Some(bytes) => bincode::deserialize(bytes)?,
            None => MinerLedger::default(),
        };
        Ok((raw, ledger))
    }

    pub fn ledger(&self, address: &str) -> Result<MinerLedger, StoreError> {
        let key = prefixed_key(PREFIX_LEDGER, address.as_bytes());
        Ok(self.read_ledger_raw(&key)?.1)
    }

    /// Apply `f` to an address's ledger atomically. `f` returning an
    /// error aborts without writing; a concurrent writer restarts the
    /// loop.
    fn update_ledger<F>(&self, address: &str, mut f: F) -> Result<MinerLedger, StoreError>
    where
        F: FnMut(&mut MinerLedger) -> Result<(), StoreError>,
    {
        let key = prefixed_key(PREFIX_LEDGER, address.as_bytes());
        loop {
            let (raw, mut ledger) = self.read_ledger_raw(&key)?;
            f(&mut ledger)?;
            let encoded = bincode::serialize(&ledger)?;
            match self.db.compare_and_swap(&key, raw, Some(encoded))? {
                Ok(()) => return Ok(ledger),
                Err(_) => continue,
            }
        }
    }

    /// Credit a PPLNS reward that is not yet confirmable.
    pub fn credit_immature(&self, address: &str, amount: u64) -> Result<(), StoreError> {
        self.update_ledger(address, |l| {
            l.immature = l.immature.saturating_add(amount);
            Ok(())
        })?;
        Ok(())
    }

    /// A credited block matured: immature → balance. Caps at the
    /// immature amount so an orphan race cannot go negative.
    pub fn mature_credit(&self, address: &str, amount: u64) -> Result<u64, StoreError> {
        let mut moved = 0;
        self.update_ledger(address, |l| {
            moved = amount.min(l.immature);
            l.immature -= moved;
            l.balance = l.balance.saturating_add(moved);
            Ok(())
        })?;
        Ok(moved)
    }

    /// Pre-deduct for a payout: balance → pending, atomically. Fails
    /// without side effects if the balance no longer covers `amount`.
    pub fn move_to_pending(&self, address: &str, amount: u64) -> Result<(), StoreError> {
        let addr = address.to_string();
        self.update_ledger(address, |l| {
            if l.balance < amount {
                return Err(StoreError::InsufficientBalance {
                    address: addr.clone(),
                    have: l.balance,
                    need: amount,
                });
            }
            l.balance -= amount;
            l.pending = l.pending.saturating_add(amount);
            Ok(())
        })?;
        Ok(())
    }

    /// A payout failed: pending → balance.
    pub fn rollback_pending(&self, address: &str, amount: u64) -> Result<(), StoreError> {
        self.update_ledger(address, |l| {
            let moved = amount.min(l.pending);
            l.pending -= moved;
            l.balance = l.balance.saturating_add(moved);
            Ok(())
        })?;
        Ok(())
    }

    /// A payout confirmed: pending → paid, and the transaction is
    /// recorded for the payment history.
    pub fn finalize_payment(
        &self,
        address: &str,
        amount: u64,
        tx_hash: &str,
    ) -> Result<(), StoreError> {
        self.update_ledger(address, |l| {
            let moved = amount.min(l.pending);
            l.pending -= moved;
            l.paid = l.paid.saturating_add(moved);
            Ok(())
        })?;
        let timestamp = now_secs();
        let mut suffix = Vec::with_capacity(8 + address.len());
        suffix.extend_from_slice(&timestamp.to_be_bytes());
        suffix.extend_from_slice(address.as_bytes());
        let record = PaymentRecord {
            address: address.to_string(),
            amount,
            tx_hash: tx_hash.to_string(),
            timestamp,
        };
        self.db
            .insert(prefixed_key(PREFIX_PAYMENT, &suffix), bincode::serialize(&record)?)?;
        Ok(())
    }

    /// Ledger rows with `balance >= threshold`, excluding the fee
    /// accumulator.
    pub fn miners_with_balance(
        &self,
        threshold: u64,
    ) -> Result<Vec<(String, MinerLedger)>, StoreError> {
        let mut miners = Vec::new();
        for item in self.db.scan_prefix(PREFIX_LEDGER) {
            let (key, value) = item?;
            let address = String::from_utf8_lossy(&key[PREFIX_LEDGER.len()..]).to_string();
            if address == FEE_ADDRESS {
                continue;
            }
            let ledger: MinerLedger = bincode::deserialize(&value)?;
            if ledger.balance >= threshold {
                miners.push((address, ledger));
            }
        }
        Ok(miners)
    }

    // ─── Payout Lock ─────────────────────────────────────────────────

    /// Compare-and-set the global payout lock. Succeeds when the lock
    /// is free or its previous holder's TTL has lapsed.
    pub fn lock_payouts(&self, token: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let new = bincode::serialize(&PayoutLock {
            token: token.to_string(),
            deadline: now_secs() + ttl_secs,
        })?;
        loop {
            let current = self.db.get(KEY_PAYOUT_LOCK)?;
            match &current {
                Some(raw) => {
                    let held: PayoutLock = bincode::deserialize(raw)?;
                    if held.deadline > now_secs() {
                        return Ok(false);
                    }
                    // Expired holder: replace it
                    match self
                        .db
                        .compare_and_swap(KEY_PAYOUT_LOCK, current.clone(), Some(new.clone()))?
                    {
                        Ok(()) => return Ok(true),
                        Err(_) => continue,
                    }
                }
                None => {
                    match self
                        .db
                        .compare_and_swap(KEY_PAYOUT_LOCK, None as Option<&[u8]>, Some(new.clone()))?
                    {
                        Ok(()) => return Ok(true),
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Release the payout lock, but only if `token` is the holder.
    pub fn unlock_payouts(&self, token: &str) -> Result<bool, StoreError> {
        loop {
            let current = self.db.get(KEY_PAYOUT_LOCK)?;
            let Some(raw) = &current else { return Ok(false) };
            let held: PayoutLock = bincode::deserialize(raw)?;
            if held.token != token {
                return Ok(false);
            }
            match self
                .db
                .compare_and_swap(KEY_PAYOUT_LOCK, current.clone(), None as Option<&[u8]>)?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    // ─── Lists ───────────────────────────────────────────────────────

    pub fn add_blacklist(&self, address: &str) -> Result<(), StoreError> {
        let key = prefixed_key(PREFIX_BLACKLIST, address.to_lowercase().as_bytes());
        self.db.insert(key, vec![])?;
        Ok(())
    }

    pub fn is_blacklisted(&self, address: &str) -> Result<bool, StoreError> {
        let key = prefixed_key(PREFIX_BLACKLIST, address.to_lowercase().as_bytes());
        Ok(self.db.contains_key(key)?)
    }

    pub fn blacklist(&self) -> Result<Vec<String>, StoreError> {
        self.list(PREFIX_BLACKLIST)
    }

    pub fn add_whitelist(&self, ip: &str) -> Result<(), StoreError> {
        self.db.insert(prefixed_key(PREFIX_WHITELIST, ip.as_bytes()), vec![])?;
        Ok(())
    }

    pub fn is_whitelisted(&self, ip: &str) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(prefixed_key(PREFIX_WHITELIST, ip.as_bytes()))?)
    }

    pub fn whitelist(&self) -> Result<Vec<String>, StoreError> {
        self.list(PREFIX_WHITELIST)
    }

    fn list(&self, prefix: &[u8]) -> Result<Vec<String>, StoreError> {
        let mut entries = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, _) = item?;
            entries.push(String::from_utf8_lossy(&key[prefix.len()..]).to_string());
        }
        Ok(entries)
    }

    // ─── Chart Series ────────────────────────────────────────────────

    pub fn store_pool_hashrate(&self, hashrate: u64) -> Result<(), StoreError> {
        self.push_series(PREFIX_SERIES_HASHRATE, hashrate)
    }

    pub fn store_workers_count(&self, workers: u64) -> Result<(), StoreError> {
        self.push_series(PREFIX_SERIES_WORKERS, workers)
    }

    pub fn hashrate_history(&self) -> Result<Vec<(u64, u64)>, StoreError> {
        self.series(PREFIX_SERIES_HASHRATE)
    }

    pub fn workers_history(&self) -> Result<Vec<(u64, u64)>, StoreError> {
        self.series(PREFIX_SERIES_WORKERS)
    }

    fn push_series(&self, prefix: &[u8], value: u64) -> Result<(), StoreError> {
        let key = prefixed_key(prefix, &now_secs().to_be_bytes());
        self.db.insert(key, value.to_be_bytes().to_vec())?;

        // Keep the series bounded
        let keys: Vec<_> = self
            .db
            .scan_prefix(prefix)
            .keys()
            .collect::<Result<Vec<_>, _>>()?;
        if keys.len() > SERIES_CAPACITY {
            for key in &keys[..keys.len() - SERIES_CAPACITY] {
                self.db.remove(key)?;
            }
        }
        Ok(())
    }

    fn series(&self, prefix: &[u8]) -> Result<Vec<(u64, u64)>, StoreError> {
        let mut points = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, value) = item?;
            let ts = u64::from_be_bytes(key[prefix.len()..].try_into().unwrap_or_default());
            let v = u64::from_be_bytes(value.as_ref().try_into().unwrap_or_default());
            points.push((ts, v));
        }
        Ok(points)
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    fn share(address: &str, difficulty: u64, timestamp: u64) -> ShareRecord {
        ShareRecord {
            address: address.into(),
            worker: "rig0".into(),
            job_id: "0011223344556677".into(),
            nonce: "00000000deadbeef".into(),
            difficulty,
            height: 100,
            hash_hex: String::new(),
            timestamp,
        }
    }

    fn candidate(height: u64, hash: &str) -> BlockRecord {
        BlockRecord {
            height,
            hash: hash.into(),
            nonce: "00000000deadbeef".into(),
            difficulty: 1_000_000,
            finder: "fp1qminer".into(),
            worker: "rig0".into(),
            reward: 0,
            tx_fees: 0,
            timestamp: now_secs(),
            status: BlockStatus::Candidate,
            confirmations: 0,
            round_shares: 500,
        }
    }

    #[test]
    fn test_share_window_read_and_prune() {
        let (_dir, store) = open_store();
        let now = now_secs();
        store.write_share(&share("a", 100, now - 700), 600).unwrap();
        store.write_share(&share("b", 200, now - 10), 600).unwrap();
        store.write_share(&share("c", 300, now), 600).unwrap();

        // The 700s-old share fell out of the 600s window
        let window = store.read_window(now - 600).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].address, "b");
        assert_eq!(window[1].address, "c");
    }

    #[test]
    fn test_round_shares_accumulate_and_reset() {
        let (_dir, store) = open_store();
        let now = now_secs();
        store.write_share(&share("a", 100, now), 600).unwrap();
        store.write_share(&share("a", 150, now), 600).unwrap();
        store.write_share(&share("b", 50, now), 600).unwrap();
        assert_eq!(store.take_round_shares().unwrap(), 300);
        // Counters cleared
        assert_eq!(store.take_round_shares().unwrap(), 0);
    }

    #[test]
    fn test_candidate_insert_idempotent() {
        let (_dir, store) = open_store();
        let block = candidate(100, "aabbcc");
        assert!(store.insert_candidate(&block).unwrap());
        assert!(!store.insert_candidate(&block).unwrap());
        assert_eq!(store.blocks_by_status(BlockStatus::Candidate).unwrap().len(), 1);
    }

    #[test]
    fn test_block_lifecycle_moves() {
        let (_dir, store) = open_store();
        let mut block = candidate(100, "aabbcc");
        store.insert_candidate(&block).unwrap();

        block.reward = 5000;
        store.move_block(&block, BlockStatus::Candidate, BlockStatus::Immature).unwrap();
        assert!(store.blocks_by_status(BlockStatus::Candidate).unwrap().is_empty());
        let immature = store.blocks_by_status(BlockStatus::Immature).unwrap();
        assert_eq!(immature.len(), 1);
        assert_eq!(immature[0].reward, 5000);
        assert_eq!(immature[0].status, BlockStatus::Immature);

        store.move_block(&immature[0], BlockStatus::Immature, BlockStatus::Matured).unwrap();
        assert_eq!(store.blocks_by_status(BlockStatus::Matured).unwrap().len(), 1);
    }

    #[test]
    fn test_ledger_conservation() {
        // P3: balance + immature + pending + paid stays equal to the
        // total credited, across every transition
        let (_dir, store) = open_store();
        let addr = "fp1qminer";

        store.credit_immature(addr, 1000).unwrap();
        assert_eq!(store.ledger(addr).unwrap().total(), 1000);

        store.mature_credit(addr, 1000).unwrap();
        assert_eq!(store.ledger(addr).unwrap().total(), 1000);

        store.move_to_pending(addr, 600).unwrap();
        let ledger = store.ledger(addr).unwrap();
        assert_eq!(ledger.balance, 400);
        assert_eq!(ledger.pending, 600);
        assert_eq!(ledger.total(), 1000);

        store.rollback_pending(addr, 600).unwrap();
        assert_eq!(store.ledger(addr).unwrap().balance, 1000);
        assert_eq!(store.ledger(addr).unwrap().total(), 1000);

        store.move_to_pending(addr, 1000).unwrap();
        store.finalize_payment(addr, 1000, "txhash").unwrap();
        let ledger = store.ledger(addr).unwrap();
        assert_eq!(ledger.paid, 1000);
        assert_eq!(ledger.balance, 0);
        assert_eq!(ledger.total(), 1000);
    }

    #[test]
    fn test_move_to_pending_insufficient() {
        let (_dir, store) = open_store();
        store.credit_immature("a", 100).unwrap();
        store.mature_credit("a", 100).unwrap();
        let err = store.move_to_pending("a", 200).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientBalance { have: 100, need: 200, .. }));
        // Nothing moved
        assert_eq!(store.ledger("a").unwrap().balance, 100);
        assert_eq!(store.ledger("a").unwrap().pending, 0);
    }

    #[test]
    fn test_miners_with_balance_threshold() {
        let (_dir, store) = open_store();
        for (addr, amount) in [("a", 50u64), ("b", 150), ("c", 300)] {
            store.credit_immature(addr, amount).unwrap();
            store.mature_credit(addr, amount).unwrap();
        }
        store.credit_immature(FEE_ADDRESS, 10_000).unwrap();
        store.mature_credit(FEE_ADDRESS, 10_000).unwrap();

        let mut paying: Vec<_> = store
            .miners_with_balance(100)
            .unwrap()
            .into_iter()
            .map(|(a, l)| (a, l.balance))
            .collect();
        paying.sort();
        assert_eq!(paying, vec![("b".to_string(), 150), ("c".to_string(), 300)]);
    }

    #[test]
    fn test_payout_lock_single_winner() {
        // P4: two lock attempts with distinct tokens, exactly one wins
        let (_dir, store) = open_store();
        assert!(store.lock_payouts("token-a", 600).unwrap());
        assert!(!store.lock_payouts("token-b", 600).unwrap());

        // Only the holder can unlock
        assert!(!store.unlock_payouts("token-b").unwrap());
        assert!(store.unlock_payouts("token-a").unwrap());
        assert!(store.lock_payouts("token-b", 600).unwrap());
    }

    #[test]
    fn test_payout_lock_expiry() {
        let (_dir, store) = open_store();
        assert!(store.lock_payouts("stale", 0).unwrap());
        // TTL of zero is already lapsed; a new holder may take over
        assert!(store.lock_payouts("fresh", 600).unwrap());
        assert!(!store.unlock_payouts("stale").unwrap());
        assert!(store.unlock_payouts("fresh").unwrap());
    }

    #[test]
    fn test_lists_case_insensitive_blacklist() {
        let (_dir, store) = open_store();
        store.add_blacklist("Fp1QCheater").unwrap();
        assert!(store.is_blacklisted("fp1qcheater").unwrap());
        assert!(store.is_blacklisted("FP1QCHEATER").unwrap());
        assert!(!store.is_blacklisted("fp1qhonest").unwrap());

        store.add_whitelist("10.0.0.1").unwrap();
        assert!(store.is_whitelisted("10.0.0.1").unwrap());
        assert!(!store.is_whitelisted("10.0.0.2").unwrap());
        assert_eq!(store.whitelist().unwrap(), vec!["10.0.0.1"]);
    }

    #[test]
    fn test_series_bounded() {
        let (_dir, store) = open_store();
        // Same-second inserts overwrite; just verify reads work and the
        // bound logic leaves at most SERIES_CAPACITY points
        for v in 0..10u64 {
            store.store_pool_hashrate(v).unwrap();
            store.store_workers_count(v).unwrap();
        }
        let history = store.hashrate_history().unwrap();
        assert!(!history.is_empty());
        assert!(history.len() <= SERIES_CAPACITY);
        assert_eq!(history.last().unwrap().1, 9);
        assert!(!store.workers_history().unwrap().is_empty());
    }
}
