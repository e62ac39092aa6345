//! Block unlocker: walks candidate and immature rows on a timer and
//! advances them through the lifecycle.
//!
//! candidate → immature → matured, by confirmation depth; candidate →
//! orphan when the canonical block at that height was mined by someone
//! else (the chain is a DAG, so several blocks can share a height —
//! miner identity, not hash equality, decides).
//!
//! PPLNS crediting happens exactly once, at the moment a block first
//! leaves the candidate state. The credited amounts are persisted with
//! the block so the immature → matured transition can move each
//! address's exact amount from immature to balance.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{PplnsConfig, UnlockerConfig};
use crate::core::types::{BlockRecord, BlockStatus, PoolEvent};
use crate::pplns;
use crate::shutdown::Shutdown;
use crate::storage::{Store, StoreError, FEE_ADDRESS};
use crate::upstream::rpc::RpcError;
use crate::upstream::UpstreamPool;

#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("upstream error: {0}")]
    Rpc(#[from] RpcError),
}

pub struct Unlocker {
    store: Arc<Store>,
    upstream: Arc<UpstreamPool>,
    config: UnlockerConfig,
    pplns: PplnsConfig,
    /// Pool fee retained from each reward, percent
    fee_percent: f64,
    /// Share window length, seconds
    window_secs: u64,
    events: broadcast::Sender<PoolEvent>,
}

impl Unlocker {
    pub fn new(
        store: Arc<Store>,
        upstream: Arc<UpstreamPool>,
        config: UnlockerConfig,
        pplns: PplnsConfig,
        fee_percent: f64,
        window_secs: u64,
        events: broadcast::Sender<PoolEvent>,
    ) -> Self {
        Unlocker { store, upstream, config, pplns, fee_percent, window_secs, events }
    }

    /// One unlocker pass over candidates and immature rows.
    pub async fn tick(&self) -> Result<(), UnlockError> {
        let info = self.upstream.get_info().await?;
        let current_height = info.height;
        let network_hashrate = info.network_hashrate();
        let pool_hashrate = self
            .store
            .hashrate_history()?
            .last()
            .map(|(_, v)| *v);

        for mut block in self.store.blocks_by_status(BlockStatus::Candidate)? {
            if let Err(err) = self
                .process_candidate(&mut block, current_height, pool_hashrate, network_hashrate)
                .await
            {
                tracing::warn!("unlocker: candidate {} skipped: {}", block, err);
            }
        }

        for block in self.store.blocks_by_status(BlockStatus::Immature)? {
            if let Err(err) = self.process_immature(&block, current_height) {
                tracing::warn!("unlocker: immature {} skipped: {}", block, err);
            }
        }
        Ok(())
    }

    async fn process_candidate(
        &self,
        block: &mut BlockRecord,
        current_height: u64,
        pool_hashrate: Option<u64>,
        network_hashrate: Option<u64>,
    ) -> Result<(), UnlockError> {
        let canonical = self.upstream.get_block_at_topoheight(block.height).await?;
        self.settle_candidate(block, &canonical, current_height, pool_hashrate, network_hashrate)
    }

    /// Decide a candidate's fate against the canonical block at its
    /// height.
    fn settle_candidate(
        &self,
        block: &mut BlockRecord,
        canonical: &crate::upstream::rpc::CanonicalBlock,
        current_height: u64,
        pool_hashrate: Option<u64>,
        network_hashrate: Option<u64>,
    ) -> Result<(), UnlockError> {
        let confirmations = current_height.saturating_sub(block.height);

        if canonical.miner != block.finder {
            tracing::warn!(
                "🥀 Orphan at height {}: canonical miner {} is not {}",
                block.height, canonical.miner, block.finder,
            );
            self.store.remove_block(block, BlockStatus::Candidate)?;
            let _ = self.events.send(PoolEvent::BlockOrphaned {
                height: block.height,
                hash: block.hash.clone(),
                finder: block.finder.clone(),
            });
            return Ok(());
        }

        block.reward = canonical.miner_reward + canonical.total_fees;
        block.tx_fees = canonical.total_fees;
        block.confirmations = confirmations;

        if confirmations >= self.config.mature_depth {
            // Skipped the immature stage entirely: credit, then mature
            // the same amounts in one pass
            let credits = self.credit_block(block, pool_hashrate, network_hashrate)?;
            self.store.move_block(block, BlockStatus::Candidate, BlockStatus::Matured)?;
            self.mature_credits(block, &credits)?;
        } else if confirmations >= self.config.immature_depth {
            let credits = self.credit_block(block, pool_hashrate, network_hashrate)?;
            self.store.store_block_credits(block, &credits)?;
            self.store.move_block(block, BlockStatus::Candidate, BlockStatus::Immature)?;
            tracing::info!(
                "🌱 Block {} immature: reward={} over {} addresses",
                block.height, block.reward, credits.len(),
            );
        } else {
            self.store.update_block(block)?;
        }
        Ok(())
    }

    fn process_immature(&self, block: &BlockRecord, current_height: u64) -> Result<(), UnlockError> {
        let confirmations = current_height.saturating_sub(block.height);
        if confirmations < self.config.mature_depth {
            let mut updated = block.clone();
            updated.confirmations = confirmations;
            self.store.update_block(&updated)?;
            return Ok(());
        }
        let credits = self.store.block_credits(block)?;
        let mut matured = block.clone();
        matured.confirmations = confirmations;
        self.store.move_block(&matured, BlockStatus::Immature, BlockStatus::Matured)?;
        self.mature_credits(block, &credits)?;
        self.store.remove_block_credits(block)?;
        Ok(())
    }

    /// Allocate the PPLNS window against this block's reward and add
    /// the immature credits. The pool fee plus rounding dust goes to
    /// the fee accumulator row, so the credited total always equals
    /// the block reward.
    fn credit_block(
        &self,
        block: &BlockRecord,
        pool_hashrate: Option<u64>,
        network_hashrate: Option<u64>,
    ) -> Result<Vec<(String, u64)>, UnlockError> {
        let window = pplns::window_size(
            &self.pplns,
            block.difficulty,
            pool_hashrate,
            network_hashrate,
        );
        let since = block.timestamp.saturating_sub(self.window_secs);
        let shares: Vec<_> = self
            .store
            .read_window(since)?
            .into_iter()
            .filter(|s| s.timestamp <= block.timestamp)
            .collect();

        let fee = (block.reward as f64 * self.fee_percent / 100.0) as u64;
        let miner_pot = block.reward - fee;

        let allocation = pplns::allocate(&shares, window);
        let mut credits = pplns::split_reward(&allocation, miner_pot);
        if credits.is_empty() {
            tracing::warn!(
                "empty PPLNS window for block {}; whole reward goes to the pool",
                block.height,
            );
        }
        let distributed: u64 = credits.iter().map(|(_, v)| v).sum();
        let pool_cut = block.reward - distributed;
        if pool_cut > 0 {
            credits.push((FEE_ADDRESS.to_string(), pool_cut));
        }

        for (address, amount) in &credits {
            self.store.credit_immature(address, *amount)?;
        }
        Ok(credits)
    }

    fn mature_credits(&self, block: &BlockRecord, credits: &[(String, u64)]) -> Result<(), UnlockError> {
        for (address, amount) in credits {
            self.store.mature_credit(address, *amount)?;
        }
        tracing::info!(
            "🎊 Block {} matured: {} unlocked to {} addresses",
            block.height, block.reward, credits.len(),
        );
        Ok(())
    }
}

pub async fn unlocker_loop(unlocker: Unlocker, mut shutdown: Shutdown) {
    let mut interval = tokio::time::interval(Duration::from_secs(unlocker.config.interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }
        if let Err(err) = unlocker.tick().await {
            tracing::warn!("unlocker tick failed: {}", err);
        }
    }
    tracing::debug!("unlocker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UpstreamConfig, UpstreamTuning, WalletConfig};
    use crate::core::types::ShareRecord;
    use crate::storage::now_secs;
    use tempfile::TempDir;

    fn unlocker_fixture() -> (TempDir, Unlocker) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
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
        let unlocker = Unlocker::new(
            store,
            upstream,
            UnlockerConfig::default(),
            PplnsConfig::default(),
            1.0,
            600,
            events,
        );
        (dir, unlocker)
    }

    fn block_at(height: u64, reward: u64) -> BlockRecord {
        BlockRecord {
            height,
            hash: format!("hash{}", height),
            nonce: "00000000deadbeef".into(),
            difficulty: 1_000,
            finder: "fp1qfinder".into(),
            worker: "rig0".into(),
            reward,
            tx_fees: 0,
            timestamp: now_secs(),
            status: BlockStatus::Candidate,
            confirmations: 0,
            round_shares: 0,
        }
    }

    fn share(address: &str, difficulty: u64) -> ShareRecord {
        ShareRecord {
            address: address.into(),
            worker: "rig0".into(),
            job_id: "0011223344556677".into(),
            nonce: "00000000deadbeef".into(),
            difficulty,
            height: 10,
            hash_hex: String::new(),
            timestamp: now_secs(),
        }
    }

    fn canonical(height: u64, miner: &str, reward: u64) -> crate::upstream::rpc::CanonicalBlock {
        serde_json::from_value(serde_json::json!({
            "hash": format!("canon{}", height),
            "height": height,
            "tips": [],
            "timestamp": 1_700_000_000_000u64,
            "difficulty": "1000",
            "miner_reward": reward,
            "total_fees": 25,
            "miner": miner,
            "txs_hashes": []
        }))
        .unwrap()
    }

    #[test]
    fn test_orphan_detected_and_removed() {
        // P8: the canonical miner at the height differs from the
        // finder ⇒ the candidate is dropped and an event goes out
        let (_dir, unlocker) = unlocker_fixture();
        let mut events = unlocker.events.subscribe();
        let mut block = block_at(10, 0);
        unlocker.store.insert_candidate(&block).unwrap();

        let foreign = canonical(10, "someone-else", 5_000);
        unlocker.settle_candidate(&mut block, &foreign, 15, None, None).unwrap();

        assert!(unlocker.store.blocks_by_status(BlockStatus::Candidate).unwrap().is_empty());
        assert!(unlocker.store.blocks_by_status(BlockStatus::Orphan).unwrap().is_empty());
        match events.try_recv().unwrap() {
            PoolEvent::BlockOrphaned { height, .. } => assert_eq!(height, 10),
            other => panic!("unexpected event: {:?}", other),
        }
        // Nobody got credited
        assert_eq!(unlocker.store.ledger("fp1qfinder").unwrap().total(), 0);
    }

    #[test]
    fn test_candidate_reward_and_shallow_confirmations() {
        let (_dir, unlocker) = unlocker_fixture();
        let mut block = block_at(10, 0);
        unlocker.store.insert_candidate(&block).unwrap();

        let ours = canonical(10, "fp1qfinder", 5_000);
        unlocker.settle_candidate(&mut block, &ours, 15, None, None).unwrap();

        // 5 confirmations: still a candidate, reward recorded
        let rows = unlocker.store.blocks_by_status(BlockStatus::Candidate).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reward, 5_025);
        assert_eq!(rows[0].confirmations, 5);
    }

    #[test]
    fn test_candidate_promotes_to_immature_with_credits() {
        let (_dir, unlocker) = unlocker_fixture();
        unlocker.store.write_share(&share("a", 100), 600).unwrap();
        let mut block = block_at(10, 0);
        unlocker.store.insert_candidate(&block).unwrap();

        let ours = canonical(10, "fp1qfinder", 5_000);
        unlocker.settle_candidate(&mut block, &ours, 10 + 20, None, None).unwrap();

        assert!(unlocker.store.blocks_by_status(BlockStatus::Candidate).unwrap().is_empty());
        assert_eq!(unlocker.store.blocks_by_status(BlockStatus::Immature).unwrap().len(), 1);
        let ledger = unlocker.store.ledger("a").unwrap();
        assert!(ledger.immature > 0);
        assert_eq!(ledger.balance, 0);
        assert!(!unlocker.store.block_credits(&block).unwrap().is_empty());
    }

    #[test]
    fn test_candidate_straight_to_matured() {
        let (_dir, unlocker) = unlocker_fixture();
        unlocker.store.write_share(&share("a", 100), 600).unwrap();
        let mut block = block_at(10, 0);
        unlocker.store.insert_candidate(&block).unwrap();

        let ours = canonical(10, "fp1qfinder", 5_000);
        unlocker.settle_candidate(&mut block, &ours, 10 + 150, None, None).unwrap();

        assert_eq!(unlocker.store.blocks_by_status(BlockStatus::Matured).unwrap().len(), 1);
        let ledger = unlocker.store.ledger("a").unwrap();
        assert_eq!(ledger.immature, 0);
        assert!(ledger.balance > 0);
    }

    #[test]
    fn test_credit_block_conserves_reward() {
        let (_dir, unlocker) = unlocker_fixture();
        unlocker.store.write_share(&share("a", 300), 600).unwrap();
        unlocker.store.write_share(&share("b", 100), 600).unwrap();

        let block = block_at(10, 10_000);
        let credits = unlocker.credit_block(&block, None, None).unwrap();

        let credited: u64 = credits.iter().map(|(_, v)| v).sum();
        assert_eq!(credited, 10_000, "fee row absorbs the remainder");

        // 1% fee: 9900 to miners, split 3:1
        let a = unlocker.store.ledger("a").unwrap();
        let b = unlocker.store.ledger("b").unwrap();
        let fees = unlocker.store.ledger(FEE_ADDRESS).unwrap();
        assert_eq!(a.immature, 7425);
        assert_eq!(b.immature, 2475);
        assert_eq!(fees.immature, 100);
        assert_eq!(a.immature + b.immature + fees.immature, 10_000);
    }

    #[test]
    fn test_credit_block_empty_window_goes_to_pool() {
        let (_dir, unlocker) = unlocker_fixture();
        let block = block_at(10, 5_000);
        let credits = unlocker.credit_block(&block, None, None).unwrap();
        assert_eq!(credits, vec![(FEE_ADDRESS.to_string(), 5_000)]);
        assert_eq!(unlocker.store.ledger(FEE_ADDRESS).unwrap().immature, 5_000);
    }

    #[test]
    fn test_immature_promotion_moves_credits() {
        let (_dir, unlocker) = unlocker_fixture();
        unlocker.store.write_share(&share("a", 100), 600).unwrap();

        let mut block = block_at(10, 1_000);
        unlocker.store.insert_candidate(&block).unwrap();
        let credits = unlocker.credit_block(&block, None, None).unwrap();
        unlocker.store.store_block_credits(&block, &credits).unwrap();
        unlocker
            .store
            .move_block(&block, BlockStatus::Candidate, BlockStatus::Immature)
            .unwrap();
        block.status = BlockStatus::Immature;

        // Not deep enough yet: stays immature, confirmations tracked
        unlocker.process_immature(&block, block.height + 50).unwrap();
        assert_eq!(
            unlocker.store.blocks_by_status(BlockStatus::Immature).unwrap()[0].confirmations,
            50,
        );
        assert_eq!(unlocker.store.ledger("a").unwrap().balance, 0);

        // Past mature depth: credits move immature → balance
        unlocker.process_immature(&block, block.height + 100).unwrap();
        assert!(unlocker.store.blocks_by_status(BlockStatus::Immature).unwrap().is_empty());
        assert_eq!(unlocker.store.blocks_by_status(BlockStatus::Matured).unwrap().len(), 1);
        let ledger = unlocker.store.ledger("a").unwrap();
        assert_eq!(ledger.immature, 0);
        assert!(ledger.balance > 0);
        // Credits row consumed
        assert!(unlocker.store.block_credits(&block).unwrap().is_empty());
    }
}
