//! Upstream node pool: weighted selection, health tracking, failover.
//!
//! Every configured node endpoint gets its own health state. A
//! background probe walks all of them in parallel; inline call
//! accounting keeps the consecutive success/failure counters honest
//! between probes. Selection prefers the heaviest healthy upstream,
//! breaking ties by the highest observed chain height.

pub mod rpc;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::config::{UpstreamConfig, UpstreamTuning, WalletConfig};
use crate::shutdown::Shutdown;
use rpc::{NodeClient, RpcError, WalletClient};

#[derive(Debug, Clone)]
pub struct UpstreamState {
    pub healthy: bool,
    /// Consecutive successes
    pub success_count: u32,
    /// Consecutive failures
    pub fail_count: u32,
    pub last_check: Option<Instant>,
    pub response_time: Option<Duration>,
    pub observed_height: u64,
}

impl Default for UpstreamState {
    fn default() -> Self {
        UpstreamState {
            healthy: true,
            success_count: 0,
            fail_count: 0,
            last_check: None,
            response_time: None,
            observed_height: 0,
        }
    }
}

pub struct Upstream {
    pub name: String,
    pub weight: u64,
    pub client: NodeClient,
    state: Mutex<UpstreamState>,
}

impl Upstream {
    fn new(config: &UpstreamConfig, http: reqwest::Client) -> Self {
        Upstream {
            name: config.name.clone(),
            weight: config.weight,
            client: NodeClient::new(
                http,
                config.url.clone(),
                Duration::from_millis(config.timeout_ms),
            ),
            state: Mutex::new(UpstreamState::default()),
        }
    }

    pub fn snapshot(&self) -> UpstreamState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().unwrap().healthy
    }

    /// Record a successful call. Returns true when this success tipped
    /// an unhealthy upstream back over the recovery threshold.
    pub fn record_success(&self, tuning: &UpstreamTuning) -> bool {
        let mut state = self.state.lock().unwrap();
        state.success_count += 1;
        state.fail_count = 0;
        if !state.healthy && state.success_count >= tuning.recovery_threshold {
            state.healthy = true;
            state.success_count = 0;
            state.fail_count = 0;
            return true;
        }
        false
    }

    /// Record a failed call. Returns true when this failure crossed
    /// `max_failures` and the upstream just became unhealthy.
    pub fn record_failure(&self, tuning: &UpstreamTuning) -> bool {
        let mut state = self.state.lock().unwrap();
        state.fail_count += 1;
        state.success_count = 0;
        if state.healthy && state.fail_count >= tuning.max_failures {
            state.healthy = false;
            return true;
        }
        false
    }

    fn record_probe(&self, response_time: Duration, observed_height: u64) {
        let mut state = self.state.lock().unwrap();
        state.last_check = Some(Instant::now());
        state.response_time = Some(response_time);
        state.observed_height = observed_height;
    }
}

pub struct UpstreamPool {
    upstreams: Vec<Arc<Upstream>>,
    active: AtomicUsize,
    tuning: UpstreamTuning,
    wallet: WalletClient,
}

impl UpstreamPool {
    pub fn new(
        configs: &[UpstreamConfig],
        tuning: UpstreamTuning,
        wallet_config: &WalletConfig,
    ) -> Self {
        let http = reqwest::Client::new();
        let upstreams = configs
            .iter()
            .map(|c| Arc::new(Upstream::new(c, http.clone())))
            .collect();
        let wallet = WalletClient::new(
            http,
            wallet_config.url.clone(),
            Duration::from_millis(wallet_config.timeout_ms),
        );
        UpstreamPool { upstreams, active: AtomicUsize::new(0), tuning, wallet }
    }

    pub fn wallet(&self) -> &WalletClient {
        &self.wallet
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    /// Selection rule: healthy, greatest weight, ties broken by
    /// greatest observed height.
    fn select_best(&self) -> Option<usize> {
        self.upstreams
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_healthy())
            .max_by_key(|(_, u)| (u.weight, u.snapshot().observed_height))
            .map(|(i, _)| i)
    }

    /// The upstream new calls should go to, or None when every node is
    /// down. Logs when the selection moves.
    pub fn get_client(&self) -> Option<Arc<Upstream>> {
        let best = self.select_best()?;
        let previous = self.active.swap(best, Ordering::SeqCst);
        if previous != best {
            tracing::info!(
                "⇄ Upstream switch: {} → {}",
                self.upstreams[previous].name,
                self.upstreams[best].name,
            );
        }
        Some(self.upstreams[best].clone())
    }

    /// Run `f` against the active upstream; on failure walk the other
    /// healthy upstreams and promote the first that answers.
    pub async fn call_with_failover<T, F, Fut>(&self, f: F) -> Result<T, RpcError>
    where
        F: Fn(NodeClient) -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let Some(primary) = self.get_client() else {
            return Err(RpcError::InvalidResponse("no healthy upstream".into()));
        };

        let mut last_err = match f(primary.client.clone()).await {
            Ok(value) => {
                primary.record_success(&self.tuning);
                return Ok(value);
            }
            Err(err) => {
                if primary.record_failure(&self.tuning) {
                    tracing::warn!("⚠️  Upstream {} marked unhealthy: {}", primary.name, err);
                }
                err
            }
        };

        for upstream in &self.upstreams {
            if Arc::ptr_eq(upstream, &primary) || !upstream.is_healthy() {
                continue;
            }
            match f(upstream.client.clone()).await {
                Ok(value) => {
                    upstream.record_success(&self.tuning);
                    // Promote: the next get_client sees this height
                    self.get_client();
                    return Ok(value);
                }
                Err(err) => {
                    if upstream.record_failure(&self.tuning) {
                        tracing::warn!("⚠️  Upstream {} marked unhealthy: {}", upstream.name, err);
                    }
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    // ─── Node method wrappers ────────────────────────────────────────

    pub async fn get_block_template(&self, address: &str) -> Result<rpc::BlockTemplate, RpcError> {
        let address = address.to_string();
        self.call_with_failover(move |c| {
            let address = address.clone();
            async move { c.get_block_template(&address).await }
        })
        .await
    }

    pub async fn get_info(&self) -> Result<rpc::NodeInfo, RpcError> {
        self.call_with_failover(|c| async move { c.get_info().await }).await
    }

    pub async fn p2p_status(&self) -> Result<rpc::P2pStatus, RpcError> {
        self.call_with_failover(|c| async move { c.p2p_status().await }).await
    }

    pub async fn get_block_at_topoheight(&self, topoheight: u64) -> Result<rpc::CanonicalBlock, RpcError> {
        self.call_with_failover(move |c| async move { c.get_block_at_topoheight(topoheight).await })
            .await
    }

    pub async fn submit_block(&self, block_template: &str, miner_work: &str) -> Result<bool, RpcError> {
        let template = block_template.to_string();
        let work = miner_work.to_string();
        self.call_with_failover(move |c| {
            let template = template.clone();
            let work = work.clone();
            async move { c.submit_block(&template, &work).await }
        })
        .await
    }

    pub async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<rpc::TransactionReceipt, RpcError> {
        let tx_hash = tx_hash.to_string();
        self.call_with_failover(move |c| {
            let tx_hash = tx_hash.clone();
            async move { c.get_transaction_receipt(&tx_hash).await }
        })
        .await
    }
}

/// Background probe: every upstream in parallel, each tick.
pub async fn health_loop(pool: Arc<UpstreamPool>, mut shutdown: Shutdown) {
    let tuning = pool.tuning.clone();
    let mut interval =
        tokio::time::interval(Duration::from_secs(tuning.health_check_interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }

        let mut probes = JoinSet::new();
        for upstream in pool.upstreams.iter().cloned() {
            let tuning = tuning.clone();
            probes.spawn(async move {
                let started = Instant::now();
                match upstream.client.get_info().await {
                    Ok(info) => {
                        upstream.record_probe(started.elapsed(), info.topoheight);
                        if upstream.record_success(&tuning) {
                            tracing::info!("✅ Upstream {} recovered", upstream.name);
                        }
                    }
                    Err(err) => {
                        if upstream.record_failure(&tuning) {
                            tracing::warn!("⚠️  Upstream {} marked unhealthy: {}", upstream.name, err);
                        } else {
                            tracing::debug!("Upstream {} probe failed: {}", upstream.name, err);
                        }
                    }
                }
            });
        }
        while probes.join_next().await.is_some() {}
    }
    tracing::debug!("health loop stopped");
}
