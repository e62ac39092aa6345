//! Share validation pipeline: the hot path from wire-received share to
//! accept / reject / block decision.
//!
//! Submissions arrive on a bounded channel with a one-shot reply
//! sender; a single worker drains it so per-job invariants need no
//! further locking. Trusted miners with a sub-network-difficulty claim
//! skip the hash entirely; everyone else gets the full V3 check. A
//! share that also meets the job difficulty is submitted upstream as a
//! block and recorded as a candidate.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::core::header::splice_nonce;
use crate::core::params::SHARE_CHANNEL_CAPACITY;
use crate::core::types::{
    BlockRecord, BlockStatus, Job, PoolEvent, ShareRecord, ShareResult, ShareSubmission,
};
use crate::job::JobManager;
use crate::pow;
use crate::shutdown::Shutdown;
use crate::storage::Store;
use crate::upstream::UpstreamPool;

/// A submission paired with its reply slot.
pub type ShareRequest = (ShareSubmission, oneshot::Sender<ShareResult>);

pub fn share_channel() -> (mpsc::Sender<ShareRequest>, mpsc::Receiver<ShareRequest>) {
    mpsc::channel(SHARE_CHANNEL_CAPACITY)
}

pub struct SharePipeline {
    store: Arc<Store>,
    jobs: Arc<JobManager>,
    upstream: Arc<UpstreamPool>,
    events: broadcast::Sender<PoolEvent>,
    /// Share record TTL, seconds
    window_secs: u64,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl SharePipeline {
    pub fn new(
        store: Arc<Store>,
        jobs: Arc<JobManager>,
        upstream: Arc<UpstreamPool>,
        events: broadcast::Sender<PoolEvent>,
        window_secs: u64,
    ) -> Self {
        SharePipeline { store, jobs, upstream, events, window_secs }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Validate one submission end to end.
    pub async fn process(&self, submission: &ShareSubmission) -> ShareResult {
        let Some(job) = self.jobs.resolve(&submission.job_id).await else {
            return ShareResult::rejected("Stale job");
        };

        let Some(nonce) = parse_nonce(&submission.nonce) else {
            return ShareResult::rejected("Invalid nonce");
        };

        // Trusted shortcut: a miner with a good track record claiming
        // less than the network difficulty is taken at face value. The
        // difficulty gate keeps a skipped share from ever becoming a
        // block candidate.
        let trusted = submission.skip_validation && submission.claimed_difficulty < job.difficulty;

        let mut hash_hex = String::new();
        let mut actual_difficulty = None;
        if !trusted {
            let mut work = job.miner_work;
            splice_nonce(&mut work, nonce);
            let hash = pow::pow_hash_v3(&work);
            let actual = pow::difficulty_from_hash(&hash);
            if actual < submission.claimed_difficulty {
                tracing::debug!(
                    "low share from {}.{}: actual={} claimed={}",
                    submission.address, submission.worker, actual, submission.claimed_difficulty,
                );
                return ShareResult::rejected("Low difficulty share");
            }
            hash_hex = hex::encode(hash);
            actual_difficulty = Some(actual);
        }

        let record = ShareRecord {
            address: submission.address.clone(),
            worker: submission.worker.clone(),
            job_id: submission.job_id.clone(),
            nonce: submission.nonce.clone(),
            difficulty: submission.claimed_difficulty,
            // Credited at the resolved job's height, which for a
            // backlog hit is the stale height, not the current one
            height: job.height,
            hash_hex: hash_hex.clone(),
            timestamp: now_secs(),
        };
        if let Err(err) = self.store.write_share(&record, self.window_secs) {
            tracing::error!("share persistence failed: {}", err);
            return ShareResult::rejected("Internal error");
        }

        if let Some(actual) = actual_difficulty {
            if actual >= job.difficulty {
                return self.submit_block(submission, &job, nonce, &hash_hex).await;
            }
        }

        ShareResult::accepted(false, "Share accepted")
    }

    /// A validated share met the network difficulty: push it upstream
    /// and record the candidate.
    async fn submit_block(
        &self,
        submission: &ShareSubmission,
        job: &Job,
        nonce: u64,
        hash_hex: &str,
    ) -> ShareResult {
        let mut work = job.miner_work;
        splice_nonce(&mut work, nonce);
        let template_hex = hex::encode(&job.original_header);
        let work_hex = hex::encode(work);

        match self.upstream.submit_block(&template_hex, &work_hex).await {
            Ok(true) => {
                let round_shares = self.store.take_round_shares().unwrap_or_else(|err| {
                    tracing::error!("round counter read failed: {}", err);
                    0
                });
                let block = BlockRecord {
                    height: job.height,
                    hash: hash_hex.to_string(),
                    nonce: submission.nonce.clone(),
                    difficulty: job.difficulty,
                    finder: submission.address.clone(),
                    worker: submission.worker.clone(),
                    reward: 0,
                    tx_fees: 0,
                    timestamp: now_secs(),
                    status: BlockStatus::Candidate,
                    confirmations: 0,
                    round_shares,
                };
                match self.store.insert_candidate(&block) {
                    Ok(true) => {
                        tracing::info!(
                            "🎉 BLOCK FOUND by {}.{} at height {} ({})",
                            submission.address, submission.worker, job.height, hash_hex,
                        );
                        let _ = self.events.send(PoolEvent::BlockFound {
                            height: job.height,
                            hash: hash_hex.to_string(),
                            finder: submission.address.clone(),
                            worker: submission.worker.clone(),
                            difficulty: job.difficulty,
                        });
                    }
                    Ok(false) => {
                        tracing::debug!("duplicate candidate at height {} ignored", job.height);
                    }
                    Err(err) => {
                        tracing::error!("candidate persistence failed: {}", err);
                    }
                }
            }
            Ok(false) => {
                tracing::warn!("upstream rejected block at height {}", job.height);
            }
            Err(err) => {
                tracing::warn!("block submission failed at height {}: {}", job.height, err);
            }
        }

        // The miner solved it either way
        ShareResult::accepted(true, "Block found")
    }
}

/// The single pipeline worker. Finishes the in-flight share before
/// honoring shutdown.
pub async fn pipeline_loop(
    pipeline: SharePipeline,
    mut rx: mpsc::Receiver<ShareRequest>,
    mut shutdown: Shutdown,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.recv() => break,
            request = rx.recv() => request,
        };
        let Some((submission, reply)) = request else { break };
        let result = pipeline.process(&submission).await;
        let _ = reply.send(result);
    }
    // Drain whatever the servers managed to enqueue before the signal
    rx.close();
    while let Some((submission, reply)) = rx.recv().await {
        let result = pipeline.process(&submission).await;
        let _ = reply.send(result);
    }
    tracing::debug!("share pipeline stopped");
}

/// A nonce is exactly 16 hex chars = 8 bytes, big-endian.
fn parse_nonce(raw: &str) -> Option<u64> {
    if raw.len() != 16 {
        return None;
    }
    let bytes = hex::decode(raw).ok()?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UpstreamConfig, UpstreamTuning, WalletConfig};
    use crate::core::header::job_id_of;
    use crate::core::types::MINER_WORK_SIZE;
    use std::time::Instant;
    use tempfile::TempDir;

    fn test_job(difficulty: u64) -> Job {
        let mut miner_work = [0u8; MINER_WORK_SIZE];
        for (i, b) in miner_work.iter_mut().enumerate() {
            *b = i as u8;
        }
        Job {
            id: job_id_of(&miner_work),
            height: 100,
            miner_work,
            original_header: vec![0xAA; 130],
            target: pow::target_from_difficulty(difficulty),
            difficulty,
            timestamp: 1_700_000_000,
            created_at: Instant::now(),
        }
    }

    async fn pipeline_with_job(job: Job) -> (TempDir, SharePipeline, String) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let jobs = Arc::new(JobManager::new("fp1qpool".into(), 500));
        let job_id = job.id.clone();
        jobs.publish(job).await;
        // Unroutable upstream: any submission attempt fails fast
        let upstream = Arc::new(UpstreamPool::new(
            &[UpstreamConfig {
                name: "test".into(),
                url: "http://127.0.0.1:1/json_rpc".into(),
                weight: 1,
                timeout_ms: 100,
            }],
            UpstreamTuning::default(),
            &WalletConfig::default(),
        ));
        let (events, _) = broadcast::channel(16);
        (dir, SharePipeline::new(store, jobs, upstream, events, 600), job_id)
    }

    fn submission(job_id: &str, claimed: u64) -> ShareSubmission {
        ShareSubmission {
            address: "fp1qminer".into(),
            worker: "rig0".into(),
            job_id: job_id.into(),
            nonce: "00000000deadbeef".into(),
            claimed_difficulty: claimed,
            trust_score: 0,
            skip_validation: false,
        }
    }

    #[tokio::test]
    async fn test_stale_job_rejected() {
        let (_dir, pipeline, _) = pipeline_with_job(test_job(1_000_000)).await;
        let result = pipeline.process(&submission("ffffffffffffffff", 1)).await;
        assert!(!result.valid);
        assert_eq!(result.message, "Stale job");
    }

    #[tokio::test]
    async fn test_invalid_nonce_rejected() {
        let (_dir, pipeline, job_id) = pipeline_with_job(test_job(1_000_000)).await;
        for bad in ["beef", "zzzzzzzzzzzzzzzz", "00000000deadbeef00"] {
            let mut sub = submission(&job_id, 1);
            sub.nonce = bad.into();
            let result = pipeline.process(&sub).await;
            assert!(!result.valid);
            assert_eq!(result.message, "Invalid nonce");
        }
    }

    #[tokio::test]
    async fn test_valid_share_accepted_and_persisted() {
        let (_dir, pipeline, job_id) = pipeline_with_job(test_job(u64::MAX)).await;
        // Claimed difficulty of 1 is met by any hash
        let result = pipeline.process(&submission(&job_id, 1)).await;
        assert!(result.valid);
        assert!(!result.is_block);
        assert_eq!(result.message, "Share accepted");

        let window = pipeline.store.read_window(0).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].height, 100);
        assert!(!window[0].hash_hex.is_empty());
    }

    #[tokio::test]
    async fn test_low_difficulty_rejected() {
        let (_dir, pipeline, job_id) = pipeline_with_job(test_job(u64::MAX)).await;
        let result = pipeline.process(&submission(&job_id, u64::MAX)).await;
        assert!(!result.valid);
        assert_eq!(result.message, "Low difficulty share");
        assert!(pipeline.store.read_window(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trusted_share_skips_hash() {
        let (_dir, pipeline, job_id) = pipeline_with_job(test_job(1_000_000)).await;
        let mut sub = submission(&job_id, 1_000);
        sub.skip_validation = true;
        sub.trust_score = 50;
        // Nonce that would never validate; trust accepts it anyway
        sub.nonce = "ffffffffffffffff".into();
        let result = pipeline.process(&sub).await;
        assert!(result.valid);
        assert!(!result.is_block);

        let window = pipeline.store.read_window(0).unwrap();
        assert_eq!(window.len(), 1);
        assert!(window[0].hash_hex.is_empty(), "skipped share must persist an empty hash");
    }

    #[tokio::test]
    async fn test_trust_guard_forces_validation_at_block_difficulty() {
        // P6: skip_validation with claimed ≥ job.difficulty is fully
        // validated, so a bogus nonce is rejected instead of credited
        let (_dir, pipeline, job_id) = pipeline_with_job(test_job(1_000)).await;
        let mut sub = submission(&job_id, u64::MAX);
        sub.skip_validation = true;
        let result = pipeline.process(&sub).await;
        assert!(!result.valid);
        assert_eq!(result.message, "Low difficulty share");
    }

    #[tokio::test]
    async fn test_block_path_returns_block_found() {
        // Difficulty 1: every hash is a block. The unroutable upstream
        // makes submission fail, which still owes the miner credit.
        let (_dir, pipeline, job_id) = pipeline_with_job(test_job(1)).await;
        let result = pipeline.process(&submission(&job_id, 1)).await;
        assert!(result.valid);
        assert!(result.is_block);
        assert_eq!(result.message, "Block found");
        // The share itself is in the window regardless
        assert_eq!(pipeline.store.read_window(0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backlog_share_credited_at_stale_height() {
        let (_dir, pipeline, old_id) = pipeline_with_job(test_job(u64::MAX)).await;
        // Publish a newer job; the old one drops to the backlog
        let mut newer = test_job(u64::MAX);
        newer.height = 101;
        newer.miner_work[0] ^= 0xFF;
        newer.id = job_id_of(&newer.miner_work);
        pipeline.jobs.publish(newer).await;

        let result = pipeline.process(&submission(&old_id, 1)).await;
        assert!(result.valid);
        let window = pipeline.store.read_window(0).unwrap();
        assert_eq!(window[0].height, 100, "backlog share keeps its job's height");
    }

    #[test]
    fn test_parse_nonce() {
        assert_eq!(parse_nonce("00000000deadbeef"), Some(0xdeadbeef));
        assert_eq!(parse_nonce("ffffffffffffffff"), Some(u64::MAX));
        assert_eq!(parse_nonce("beef"), None);
        assert_eq!(parse_nonce("00000000deadbee"), None);
        assert_eq!(parse_nonce("gggggggggggggggg"), None);
    }
}
