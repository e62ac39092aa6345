use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use forgepool::config::{self, Config};
use forgepool::core::params::STATS_INTERVAL_SECS;
use forgepool::job::{self, JobManager};
use forgepool::payout::{self, PayoutEngine};
use forgepool::pipeline::{self, SharePipeline};
use forgepool::policy::{self, PolicyEngine};
use forgepool::shutdown::{self, Shutdown};
use forgepool::storage::{now_secs, Store};
use forgepool::unlocker::{self, Unlocker};
use forgepool::upstream::{self, UpstreamPool};

const DEFAULT_CONFIG: &str = "config.json";

#[derive(Parser)]
#[command(name = "forgepool", version = "1.0.0")]
#[command(about = "ForgePool - mining pool coordinator")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG, global = true)]
    config: String,
    /// Coordinator role
    #[arg(long, value_enum, default_value = "combined", global = true)]
    mode: Mode,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Coordinator plus co-located mining servers
    Combined,
    /// Coordinator only
    Master,
    /// Mining server only (runs against a remote master)
    Slave,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and exit
    CheckConfig,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forgepool=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    if let Some(Commands::CheckConfig) = cli.command {
        println!("✅ {} is valid ({} upstreams)", cli.config, config.upstreams.len());
        return;
    }

    if cli.mode == Mode::Slave {
        eprintln!("❌ slave mode is served by the mining-server binary; this one is the coordinator");
        std::process::exit(1);
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(run_master(config));
}

async fn run_master(config: Config) {
    println!("🚀 ForgePool Coordinator v1.0.0");
    println!("  Store:     {}", config.store.data_dir);
    println!("  Upstreams: {}", config.upstreams.iter().map(|u| u.name.as_str()).collect::<Vec<_>>().join(", "));
    println!("  Wallet:    {}", config.wallet.url);
    println!("  Pool fee:  {}%", config.pool.fee_percent);
    println!("  PPLNS:     factor {}{}", config.pplns.window_factor, if config.pplns.dynamic { " (dynamic)" } else { "" });
    println!("  Payouts:   every {}s, threshold {}", config.payouts.interval_secs, config.payouts.threshold);

    let store = match Store::open(&config.store.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("❌ cannot open store: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_handle, shutdown) = shutdown::channel();
    let fire = Arc::new(shutdown_handle);
    {
        let fire = fire.clone();
        ctrlc::set_handler(move || {
            println!("\n🛑 Shutting down gracefully...");
            fire.fire();
        })
        .expect("Ctrl-C handler");
    }

    let upstream = Arc::new(UpstreamPool::new(&config.upstreams, config.upstream.clone(), &config.wallet));
    let jobs = Arc::new(JobManager::new(config.pool.address.clone(), config.pool.job_refresh_ms));
    let (events, _) = broadcast::channel(64);
    let (share_tx, share_rx) = pipeline::share_channel();
    let (policy_engine, ipset_rx) = PolicyEngine::new(config.policy.clone(), store.clone());

    let mut handles = Vec::new();

    handles.push(tokio::spawn(upstream::health_loop(upstream.clone(), shutdown.clone())));
    handles.push(tokio::spawn(job::refresh_loop(jobs.clone(), upstream.clone(), shutdown.clone())));

    let share_pipeline = SharePipeline::new(
        store.clone(),
        jobs.clone(),
        upstream.clone(),
        events.clone(),
        config.pool.hashrate_window_secs,
    );
    handles.push(tokio::spawn(pipeline::pipeline_loop(share_pipeline, share_rx, shutdown.clone())));

    let block_unlocker = Unlocker::new(
        store.clone(),
        upstream.clone(),
        config.unlocker.clone(),
        config.pplns.clone(),
        config.pool.fee_percent,
        config.pool.hashrate_window_secs,
        events.clone(),
    );
    handles.push(tokio::spawn(unlocker::unlocker_loop(block_unlocker, shutdown.clone())));

    let payout_engine = PayoutEngine::new(store.clone(), upstream.clone(), config.payouts.clone());
    handles.push(tokio::spawn(payout::payout_loop(payout_engine, shutdown.clone())));

    handles.push(tokio::spawn(policy::maintenance_loop(policy_engine.clone(), shutdown.clone())));

    if let Some(rx) = ipset_rx {
        let name = config.policy.ipset_name.clone().unwrap_or_default();
        handles.push(tokio::spawn(ipset_drain(rx, name, shutdown.clone())));
    }

    handles.push(tokio::spawn(stats_loop(
        store.clone(),
        policy_engine.clone(),
        jobs.clone(),
        config.pool.hashrate_window_secs,
        shutdown.clone(),
    )));

    // The mining servers hold clones of this sender; keep ours alive so
    // the pipeline outlives quiet periods.
    let _share_tx = share_tx;

    // Wait for the root signal, then let every loop drain
    let mut wait = shutdown.clone();
    wait.recv().await;
    for handle in handles {
        let _ = handle.await;
    }
    if let Err(e) = store.flush() {
        tracing::error!("final flush failed: {}", e);
    }
    tracing::info!("👋 Shutdown complete.");
}

/// Periodic pool-wide statistics: difficulty-weighted hashrate over
/// the share window and the distinct worker count, persisted for the
/// dashboard charts.
async fn stats_loop(
    store: Arc<Store>,
    policy: Arc<PolicyEngine>,
    jobs: Arc<JobManager>,
    window_secs: u64,
    mut shutdown: Shutdown,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }

        let since = now_secs().saturating_sub(window_secs);
        let shares = match store.read_window(since) {
            Ok(shares) => shares,
            Err(e) => {
                tracing::warn!("stats: window read failed: {}", e);
                continue;
            }
        };
        let total_difficulty: u64 = shares.iter().map(|s| s.difficulty).sum();
        let hashrate = total_difficulty / window_secs.max(1);
        let workers = {
            let mut seen: Vec<(&str, &str)> =
                shares.iter().map(|s| (s.address.as_str(), s.worker.as_str())).collect();
            seen.sort();
            seen.dedup();
            seen.len() as u64
        };

        if let Err(e) = store.store_pool_hashrate(hashrate) {
            tracing::warn!("stats: hashrate store failed: {}", e);
        }
        if let Err(e) = store.store_workers_count(workers) {
            tracing::warn!("stats: worker store failed: {}", e);
        }

        let height = jobs.current_job().await.map(|j| j.height).unwrap_or(0);
        tracing::info!(
            "📊 height={} hashrate={} H/s workers={} shares={} banned={}",
            height, hashrate, workers, shares.len(), policy.ban_count(),
        );
    }
    tracing::debug!("stats loop stopped");
}

/// Forward banned IPs toward the kernel packet filter. The actual
/// `ipset add` call belongs to the ops tooling; here the queue is
/// drained and logged so bans are never silently dropped.
async fn ipset_drain(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    set_name: String,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            ip = rx.recv() => {
                match ip {
                    Some(ip) => tracing::warn!("🧱 queueing {} into ipset {}", ip, set_name),
                    None => break,
                }
            }
        }
    }
}
