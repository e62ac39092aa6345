//! PPLNS: Pay-Per-Last-N-Shares reward allocation.
//!
//! The window is a difficulty budget, not a share count. Selection
//! walks the share window newest-first, summing share difficulties
//! until the budget is met; the oldest included share is truncated so
//! the window never over-counts. Rewards split proportionally to each
//! address's summed weight.

use std::collections::HashMap;

use crate::config::PplnsConfig;
use crate::core::types::ShareRecord;

/// Resolve the difficulty budget for one allocation.
///
/// Baseline = `window_factor × network_difficulty`. Dynamic mode
/// shrinks the window as the pool's share of the network grows:
/// `baseline / (2 × pool_hashrate / network_hashrate)`, clamped to
/// `[min_window, max_window]`. Missing ratios or a misconfigured clamp
/// fall back to the baseline.
pub fn window_size(
    config: &PplnsConfig,
    network_difficulty: u64,
    pool_hashrate: Option<u64>,
    network_hashrate: Option<u64>,
) -> u64 {
    let baseline = (config.window_factor * network_difficulty as f64).max(1.0) as u64;
    if !config.dynamic {
        return baseline;
    }
    if config.min_window > config.max_window {
        tracing::warn!(
            "pplns min_window {} > max_window {}; using baseline window",
            config.min_window, config.max_window,
        );
        return baseline;
    }
    match (pool_hashrate, network_hashrate) {
        (Some(pool), Some(network)) if pool > 0 && network > 0 => {
            let pool_ratio = pool as f64 / network as f64;
            let scaled = (baseline as f64 / (2.0 * pool_ratio)) as u64;
            scaled.clamp(config.min_window, config.max_window)
        }
        _ => baseline,
    }
}

/// Difficulty-weighted contributions inside the window.
#[derive(Debug, Default)]
pub struct Allocation {
    /// address → summed weight
    pub weights: HashMap<String, u64>,
    pub total_weight: u64,
}

/// Walk `shares` (oldest first, as the store returns them) newest-first
/// and accumulate per-address weights until the budget is spent. The
/// share that crosses the budget is truncated to exactly fill it.
pub fn allocate(shares: &[ShareRecord], window: u64) -> Allocation {
    let mut allocation = Allocation::default();
    let mut remaining = window;
    for share in shares.iter().rev() {
        if remaining == 0 {
            break;
        }
        let weight = share.difficulty.min(remaining);
        remaining -= weight;
        *allocation.weights.entry(share.address.clone()).or_insert(0) += weight;
        allocation.total_weight += weight;
    }
    allocation
}

/// Split `reward` proportionally to the allocation. Floors per
/// address; the caller keeps the rounding dust (it lands in the pool
/// fee accumulator so nothing is lost).
pub fn split_reward(allocation: &Allocation, reward: u64) -> Vec<(String, u64)> {
    if allocation.total_weight == 0 || reward == 0 {
        return Vec::new();
    }
    let mut payouts: Vec<(String, u64)> = allocation
        .weights
        .iter()
        .map(|(address, weight)| {
            let amount = (reward as u128 * *weight as u128 / allocation.total_weight as u128) as u64;
            (address.clone(), amount)
        })
        .filter(|(_, amount)| *amount > 0)
        .collect();
    payouts.sort();
    payouts
}
