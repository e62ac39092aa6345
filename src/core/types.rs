use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// A 32-byte hash used throughout the system
pub type Hash256 = [u8; 32];

/// Size of the miner-facing work blob
pub const MINER_WORK_SIZE: usize = 112;

/// Byte offset of the big-endian nonce inside the work blob
pub const NONCE_OFFSET: usize = 40;

// ─── Jobs ────────────────────────────────────────────────────────────

/// A published mining job. Immutable after publication; superseded jobs
/// migrate into the backlog until their height falls out of range.
#[derive(Debug, Clone)]
pub struct Job {
    /// First 8 bytes of `miner_work`, hex-encoded
    pub id: String,
    pub height: u64,
    pub miner_work: [u8; MINER_WORK_SIZE],
    /// The native header exactly as the template delivered it
    pub original_header: Vec<u8>,
    pub target: Hash256,
    pub difficulty: u64,
    pub timestamp: u64,
    pub created_at: Instant,
}

/// The job structure broadcast to mining servers. Hex fields carry no
/// 0x prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobBroadcast {
    pub id: String,
    pub height: u64,
    pub header_hash_hex: String,
    pub target_hex: String,
    pub difficulty: u64,
    pub timestamp: u64,
    pub clean_jobs: bool,
}

impl Job {
    pub fn broadcast(&self) -> JobBroadcast {
        JobBroadcast {
            id: self.id.clone(),
            height: self.height,
            header_hash_hex: hex::encode(&self.miner_work[..32]),
            target_hex: hex::encode(self.target),
            difficulty: self.difficulty,
            timestamp: self.timestamp,
            clean_jobs: true,
        }
    }
}

// ─── Shares ──────────────────────────────────────────────────────────

/// A share as submitted by a mining server on behalf of a miner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareSubmission {
    pub address: String,
    pub worker: String,
    pub job_id: String,
    /// 16 hex chars = 8 nonce bytes
    pub nonce: String,
    pub claimed_difficulty: u64,
    pub trust_score: i32,
    pub skip_validation: bool,
}

/// The pipeline's verdict on a share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareResult {
    pub valid: bool,
    pub is_block: bool,
    pub message: String,
}

impl ShareResult {
    pub fn accepted(is_block: bool, message: impl Into<String>) -> Self {
        ShareResult { valid: true, is_block, message: message.into() }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        ShareResult { valid: false, is_block: false, message: message.into() }
    }
}

/// A validated share as persisted into the sliding window.
/// `hash_hex` is empty when validation was skipped on trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    pub address: String,
    pub worker: String,
    pub job_id: String,
    pub nonce: String,
    pub difficulty: u64,
    pub height: u64,
    pub hash_hex: String,
    pub timestamp: u64,
}

// ─── Blocks ──────────────────────────────────────────────────────────

/// Lifecycle of a block the pool has found.
///
/// candidate → immature at `immature_depth` confirmations → matured at
/// `mature_depth`; orphan if the canonical block at that height was
/// mined by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Candidate,
    Immature,
    Matured,
    Orphan,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Candidate => "candidate",
            BlockStatus::Immature => "immature",
            BlockStatus::Matured => "matured",
            BlockStatus::Orphan => "orphan",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block row in the keyed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: String,
    pub nonce: String,
    pub difficulty: u64,
    pub finder: String,
    pub worker: String,
    pub reward: u64,
    pub tx_fees: u64,
    pub timestamp: u64,
    pub status: BlockStatus,
    pub confirmations: u64,
    /// Sum of share difficulties accumulated in the round that found
    /// this block
    pub round_shares: u64,
}

impl fmt::Display for BlockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block #{} [{}] {} by {} ({} conf)",
            self.height, &self.hash[..self.hash.len().min(16)], self.status, self.finder, self.confirmations,
        )
    }
}

// ─── Miner Ledger ────────────────────────────────────────────────────

/// Per-address balances. All transitions move value between fields;
/// none create or destroy it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerLedger {
    /// Confirmed, payable
    pub balance: u64,
    /// Credited from blocks not yet matured
    pub immature: u64,
    /// In-flight payout
    pub pending: u64,
    /// Cumulative paid out
    pub paid: u64,
}

impl MinerLedger {
    pub fn total(&self) -> u64 {
        self.balance + self.immature + self.pending + self.paid
    }
}

// ─── Pool Events ─────────────────────────────────────────────────────

/// Notifications broadcast to whoever subscribes (mining servers, the
/// dashboard glue).
#[derive(Debug, Clone)]
pub enum PoolEvent {
    BlockFound {
        height: u64,
        hash: String,
        finder: String,
        worker: String,
        difficulty: u64,
    },
    BlockOrphaned {
        height: u64,
        hash: String,
        finder: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_result_constructors() {
        let ok = ShareResult::accepted(false, "Share accepted");
        assert!(ok.valid && !ok.is_block);
        let blk = ShareResult::accepted(true, "Block found");
        assert!(blk.valid && blk.is_block);
        let bad = ShareResult::rejected("Stale job");
        assert!(!bad.valid && !bad.is_block);
        assert_eq!(bad.message, "Stale job");
    }

    #[test]
    fn test_block_status_strings() {
        assert_eq!(BlockStatus::Candidate.as_str(), "candidate");
        assert_eq!(BlockStatus::Orphan.to_string(), "orphan");
    }

    #[test]
    fn test_ledger_total() {
        let ledger = MinerLedger { balance: 10, immature: 20, pending: 5, paid: 65 };
        assert_eq!(ledger.total(), 100);
    }

    #[test]
    fn test_share_record_roundtrip() {
        let rec = ShareRecord {
            address: "fp1qexample".into(),
            worker: "rig0".into(),
            job_id: "0011223344556677".into(),
            nonce: "00000000deadbeef".into(),
            difficulty: 1_000,
            height: 42,
            hash_hex: String::new(),
            timestamp: 1_700_000_000,
        };
        let bytes = bincode::serialize(&rec).unwrap();
        let back: ShareRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.address, rec.address);
        assert_eq!(back.difficulty, rec.difficulty);
        assert!(back.hash_hex.is_empty());
    }
}
