//! Job manager: fetches block templates, publishes the current job,
//! keeps a bounded backlog of recently superseded jobs, and signals
//! subscribers when new work arrives.
//!
//! Publication is totally ordered here; subscribers observe
//! monotonically non-decreasing heights. The signal is a coalescing
//! `Notify` — a subscriber that misses a wakeup just re-reads
//! `current_job` on its next pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, RwLock};

use crate::core::header::{self, BlockHeader, HeaderError};
use crate::core::params::JOB_BACKLOG_DEPTH;
use crate::core::types::Job;
use crate::pow;
use crate::shutdown::Shutdown;
use crate::upstream::rpc::{self, BlockTemplate, RpcError};
use crate::upstream::UpstreamPool;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("upstream error: {0}")]
    Rpc(#[from] RpcError),
    #[error("template is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("template header: {0}")]
    Header(#[from] HeaderError),
}

pub struct JobManager {
    current: RwLock<Option<Arc<Job>>>,
    backlog: RwLock<HashMap<String, Arc<Job>>>,
    signal: Notify,
    /// Address block templates pay out to
    pool_address: String,
    refresh_interval: Duration,
}

impl JobManager {
    pub fn new(pool_address: String, refresh_ms: u64) -> Self {
        JobManager {
            current: RwLock::new(None),
            backlog: RwLock::new(HashMap::new()),
            signal: Notify::new(),
            pool_address,
            refresh_interval: Duration::from_millis(refresh_ms),
        }
    }

    pub async fn current_job(&self) -> Option<Arc<Job>> {
        self.current.read().await.clone()
    }

    /// Resolve a submitted job id: the current job, or a
    /// stale-but-recent one from the backlog.
    pub async fn resolve(&self, job_id: &str) -> Option<Arc<Job>> {
        if let Some(job) = self.current.read().await.as_ref() {
            if job.id == job_id {
                return Some(job.clone());
            }
        }
        self.backlog.read().await.get(job_id).cloned()
    }

    /// Wait for the next publication signal.
    pub async fn notified(&self) {
        self.signal.notified().await;
    }

    pub async fn backlog_len(&self) -> usize {
        self.backlog.read().await.len()
    }

    /// Build a Job from a fetched template.
    pub fn build_job(&self, template: &BlockTemplate) -> Result<Job, JobError> {
        let raw = hex::decode(&template.template)?;
        let header = BlockHeader::parse(&raw)?;
        let difficulty = rpc::parse_difficulty(&template.difficulty)?;
        let miner_work = header.miner_work();
        Ok(Job {
            id: header::job_id_of(&miner_work),
            height: template.height,
            miner_work,
            original_header: raw,
            target: pow::target_from_difficulty(difficulty),
            difficulty,
            timestamp: header.timestamp,
            created_at: Instant::now(),
        })
    }

    /// Publish a new current job: the previous one migrates into the
    /// backlog, entries older than the backlog depth are pruned, and
    /// subscribers are signalled.
    pub async fn publish(&self, job: Job) {
        let job = Arc::new(job);
        let height = job.height;

        let previous = {
            let mut current = self.current.write().await;
            current.replace(job.clone())
        };

        {
            let mut backlog = self.backlog.write().await;
            if let Some(prev) = previous {
                backlog.insert(prev.id.clone(), prev);
            }
            backlog.retain(|_, j| j.height + JOB_BACKLOG_DEPTH >= height);
        }

        tracing::info!(
            "⚒️  New job {} height={} difficulty={}",
            job.id, job.height, job.difficulty,
        );
        self.signal.notify_waiters();
    }

    /// One refresh pass: fetch a template and publish it unless the
    /// height is unchanged and a job is already out.
    pub async fn refresh(&self, upstream: &UpstreamPool) -> Result<(), JobError> {
        let template = upstream.get_block_template(&self.pool_address).await?;
        {
            let current = self.current.read().await;
            if let Some(job) = current.as_ref() {
                if job.height == template.height {
                    return Ok(());
                }
            }
        }
        let job = self.build_job(&template)?;
        self.publish(job).await;
        Ok(())
    }
}

/// Template polling loop.
pub async fn refresh_loop(
    jobs: Arc<JobManager>,
    upstream: Arc<UpstreamPool>,
    mut shutdown: Shutdown,
) {
    let mut interval = tokio::time::interval(jobs.refresh_interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }
        if let Err(err) = jobs.refresh(&upstream).await {
            tracing::debug!("job refresh failed: {}", err);
        }
    }
    tracing::debug!("job refresh loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MINER_WORK_SIZE;

    fn template_at(height: u64, nonce: u64) -> BlockTemplate {
        let header = BlockHeader {
            version: 1,
            height,
            timestamp: 1_700_000_000 + height,
            nonce,
            extra_nonce: [0xEE; 32],
            tips: vec![[0x11; 32]],
            tx_hashes: vec![],
            miner: [0x99; 32],
        };
        BlockTemplate {
            template: hex::encode(header.to_bytes()),
            algorithm: "v3".into(),
            height,
            topoheight: height,
            difficulty: "1000000".into(),
        }
    }

    fn manager() -> JobManager {
        JobManager::new("fp1qpool".into(), 500)
    }

    #[tokio::test]
    async fn test_build_and_publish() {
        let jobs = manager();
        let job = jobs.build_job(&template_at(100, 7)).unwrap();
        assert_eq!(job.height, 100);
        assert_eq!(job.difficulty, 1_000_000);
        assert_eq!(job.id.len(), 16);
        assert_eq!(job.miner_work.len(), MINER_WORK_SIZE);

        let id = job.id.clone();
        jobs.publish(job).await;
        assert_eq!(jobs.current_job().await.unwrap().id, id);
        assert!(jobs.resolve(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_bad_template_hex_rejected() {
        let jobs = manager();
        let mut tpl = template_at(1, 0);
        tpl.template = "zznothex".into();
        assert!(matches!(jobs.build_job(&tpl), Err(JobError::Hex(_))));
        tpl.template = "00ff".into();
        assert!(matches!(jobs.build_job(&tpl), Err(JobError::Header(_))));
    }

    #[tokio::test]
    async fn test_superseded_job_resolvable_from_backlog() {
        let jobs = manager();
        let old = jobs.build_job(&template_at(100, 1)).unwrap();
        let old_id = old.id.clone();
        jobs.publish(old).await;
        let new = jobs.build_job(&template_at(101, 2)).unwrap();
        let new_id = new.id.clone();
        jobs.publish(new).await;

        // Stale-but-recent resolves to the old height
        let stale = jobs.resolve(&old_id).await.unwrap();
        assert_eq!(stale.height, 100);
        assert_eq!(jobs.current_job().await.unwrap().id, new_id);
    }

    #[tokio::test]
    async fn test_backlog_bounded_and_pruned() {
        // P5: |backlog| ≤ 3 at steady state
        let jobs = manager();
        let mut old_ids = Vec::new();
        for height in 100..110 {
            let job = jobs.build_job(&template_at(height, height)).unwrap();
            old_ids.push(job.id.clone());
            jobs.publish(job).await;
        }
        assert!(jobs.backlog_len().await <= 3);

        // Jobs below current − 3 are gone
        assert!(jobs.resolve(&old_ids[0]).await.is_none());
        // The most recently superseded one survives
        assert!(jobs.resolve(&old_ids[8]).await.is_some());
    }

    #[tokio::test]
    async fn test_publish_signals_subscribers() {
        let jobs = Arc::new(manager());
        let waiter = {
            let jobs = jobs.clone();
            tokio::spawn(async move {
                jobs.notified().await;
                jobs.current_job().await.map(|j| j.height)
            })
        };
        // Give the waiter a chance to park first
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let job = jobs.build_job(&template_at(55, 0)).unwrap();
        jobs.publish(job).await;
        assert_eq!(waiter.await.unwrap(), Some(55));
    }
}
