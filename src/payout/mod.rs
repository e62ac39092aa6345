//! Batch payout state machine.
//!
//! Each run is guarded three ways: an upstream peer-count gate (never
//! pay against an isolated node), the store-level payout lock (never
//! two concurrent runs), and per-miner pre-deduction (balance →
//! pending before any coins move). A batch shares one transaction and
//! therefore one outcome: receipt status 1 finalizes every member,
//! status 0 or a receipt timeout rolls every member back.

use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::PayoutsConfig;
use crate::core::params::{
    MIN_PEERS, PAYOUT_LOCK_TTL_SECS, TX_CONFIRM_POLL_SECS, TX_CONFIRM_TIMEOUT_SECS,
};
use crate::shutdown::Shutdown;
use crate::storage::{Store, StoreError};
use crate::upstream::rpc::{RpcError, TransferDestination};
use crate::upstream::UpstreamPool;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("upstream error: {0}")]
    Rpc(#[from] RpcError),
}

/// What a single run accomplished.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PayoutSummary {
    pub miners_paid: usize,
    pub amount_paid: u64,
    pub batches_sent: usize,
    pub miners_rolled_back: usize,
    pub skipped: bool,
}

/// One pre-deducted batch member.
#[derive(Debug, Clone)]
struct Entry {
    address: String,
    /// Full amount deducted from the balance
    deducted: u64,
    /// Amount actually transferred (deducted minus the transfer fee)
    payout: u64,
}

pub struct PayoutEngine {
    store: Arc<Store>,
    upstream: Arc<UpstreamPool>,
    config: PayoutsConfig,
}

impl PayoutEngine {
    pub fn new(store: Arc<Store>, upstream: Arc<UpstreamPool>, config: PayoutsConfig) -> Self {
        PayoutEngine { store, upstream, config }
    }

    /// The transfer fee withheld from a payout of `amount`.
    fn fee(&self, amount: u64) -> u64 {
        (amount as f64 * self.config.tx_fee_percent / 100.0) as u64
    }

    /// One payout run: gate, lock, batch, settle, unlock.
    pub async fn run_once(&self) -> Result<PayoutSummary, PayoutError> {
        let mut summary = PayoutSummary::default();

        let peers = self.upstream.p2p_status().await?.peer_count;
        if peers < MIN_PEERS {
            tracing::info!("payouts skipped: {} peers < {}", peers, MIN_PEERS);
            summary.skipped = true;
            return Ok(summary);
        }
        match self.upstream.wallet().is_online().await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                tracing::warn!("payouts skipped: wallet offline");
                summary.skipped = true;
                return Ok(summary);
            }
        }

        let token = lock_token();
        if !self.store.lock_payouts(&token, PAYOUT_LOCK_TTL_SECS)? {
            tracing::info!("payouts skipped: lock held elsewhere");
            summary.skipped = true;
            return Ok(summary);
        }

        let result = self.pay_all(&mut summary).await;

        if !self.store.unlock_payouts(&token)? {
            tracing::warn!("payout lock expired mid-run; token no longer held");
        }
        result?;

        if summary.miners_paid > 0 {
            tracing::info!(
                "💸 Payout run complete: {} miners, {} base units, {} batches",
                summary.miners_paid, summary.amount_paid, summary.batches_sent,
            );
        }
        Ok(summary)
    }

    async fn pay_all(&self, summary: &mut PayoutSummary) -> Result<(), PayoutError> {
        let miners = self.store.miners_with_balance(self.config.threshold)?;
        if miners.is_empty() {
            return Ok(());
        }
        tracing::info!("starting payout run over {} miners", miners.len());

        for chunk in miners.chunks(self.config.max_addresses_per_tx) {
            self.pay_batch(chunk, summary).await?;
        }
        Ok(())
    }

    async fn pay_batch(
        &self,
        miners: &[(String, crate::core::types::MinerLedger)],
        summary: &mut PayoutSummary,
    ) -> Result<(), PayoutError> {
        // Pre-deduct: balance → pending, per miner. A miner whose
        // balance moved under us is skipped; the rest proceed.
        let mut entries = Vec::with_capacity(miners.len());
        for (address, ledger) in miners {
            let amount = ledger.balance;
            match self.store.move_to_pending(address, amount) {
                Ok(()) => entries.push(Entry {
                    address: address.clone(),
                    deducted: amount,
                    payout: amount - self.fee(amount),
                }),
                Err(err) => {
                    tracing::warn!("pre-deduct failed for {}: {}", address, err);
                }
            }
        }
        if entries.is_empty() {
            return Ok(());
        }

        let destinations: Vec<TransferDestination> = entries
            .iter()
            .map(|e| TransferDestination { address: e.address.clone(), amount: e.payout })
            .collect();

        let tx_hash = match self.upstream.wallet().batch_transfer(&destinations).await {
            Ok(hash) => hash,
            Err(err) => {
                tracing::error!("batch transfer failed, rolling back {} miners: {}", entries.len(), err);
                self.rollback(&entries, summary);
                return Ok(());
            }
        };
        summary.batches_sent += 1;
        tracing::info!("batch transfer sent: {} ({} destinations)", tx_hash, destinations.len());

        if self.await_confirmation(&tx_hash).await {
            for entry in &entries {
                match self.store.finalize_payment(&entry.address, entry.deducted, &tx_hash) {
                    Ok(()) => {
                        summary.miners_paid += 1;
                        summary.amount_paid += entry.deducted;
                    }
                    Err(err) => {
                        tracing::error!(
                            "CRITICAL: finalize failed for {} after confirmed tx {}: {}",
                            entry.address, tx_hash, err,
                        );
                    }
                }
            }
        } else {
            self.rollback(&entries, summary);
        }
        Ok(())
    }

    /// Poll for the receipt until it resolves or the deadline passes.
    /// Only an explicit status 1 counts as confirmed.
    async fn await_confirmation(&self, tx_hash: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(TX_CONFIRM_TIMEOUT_SECS);
        loop {
            tokio::time::sleep(Duration::from_secs(TX_CONFIRM_POLL_SECS)).await;
            if tokio::time::Instant::now() >= deadline {
                tracing::error!("receipt for {} timed out; rolling back", tx_hash);
                return false;
            }
            match self.upstream.get_transaction_receipt(tx_hash).await {
                Ok(receipt) if receipt.status == 1 => return true,
                Ok(_) => {
                    tracing::error!("tx {} failed on chain; rolling back", tx_hash);
                    return false;
                }
                Err(err) => {
                    tracing::debug!("receipt for {} not ready: {}", tx_hash, err);
                }
            }
        }
    }

    /// Pending → balance for every batch member. A rollback failure
    /// leaves coins stranded in pending and needs an operator.
    fn rollback(&self, entries: &[Entry], summary: &mut PayoutSummary) {
        for entry in entries {
            match self.store.rollback_pending(&entry.address, entry.deducted) {
                Ok(()) => summary.miners_rolled_back += 1,
                Err(err) => {
                    tracing::error!(
                        "CRITICAL: rollback of {} base units for {} failed: {}",
                        entry.deducted, entry.address, err,
                    );
                }
            }
        }
    }
}

fn lock_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub async fn payout_loop(engine: PayoutEngine, mut shutdown: Shutdown) {
    let mut interval = tokio::time::interval(Duration::from_secs(engine.config.interval_secs));
    // The first tick fires immediately; skip it so a restart does not
    // immediately race a previous run's lock TTL
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }
        if let Err(err) = engine.run_once().await {
            tracing::error!("payout run failed: {}", err);
        }
    }
    tracing::debug!("payout loop stopped");
}
