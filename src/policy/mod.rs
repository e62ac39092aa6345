//! Abuse policy engine: per-IP scoring, banning and connection limits.
//!
//! Tracks misbehavior per remote IP. Four independent checks feed the
//! same ban switch: blacklist hits on login, malformed traffic,
//! invalid-share ratio, and a rolling action score with periodic
//! reset. The whitelist supersedes everything. When an OS packet
//! filter set is configured, banned IPs are additionally queued for
//! out-of-band kernel filtering.
//!
//! Locking follows the map-of-mutexes shape: a read lock on the map to
//! find the entry, then the entry's own lock. Neither is ever held
//! across I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::config::PolicyConfig;
use crate::core::params::{
    SCORE_COST_AUTH, SCORE_COST_CONNECTION, SCORE_COST_INVALID_SHARE, SCORE_COST_MALFORMED,
};
use crate::shutdown::Shutdown;
use crate::storage::Store;

#[derive(Debug)]
pub struct IpStats {
    pub last_beat: Instant,
    /// Set while a temporary (score) ban is active
    pub banned_at: Option<Instant>,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub malformed: u64,
    pub conn_limit: i64,
    /// Permanent ban (blacklist, malformed, invalid ratio)
    pub banned: bool,
    pub score: u32,
    pub last_score_reset: Instant,
}

impl IpStats {
    fn new(conn_limit: i64) -> Self {
        let now = Instant::now();
        IpStats {
            last_beat: now,
            banned_at: None,
            valid_shares: 0,
            invalid_shares: 0,
            malformed: 0,
            conn_limit,
            banned: false,
            score: 0,
            last_score_reset: now,
        }
    }
}

pub struct PolicyEngine {
    config: PolicyConfig,
    store: Arc<Store>,
    started_at: Instant,
    stats: RwLock<HashMap<String, Arc<Mutex<IpStats>>>>,
    blacklist: RwLock<HashSet<String>>,
    whitelist: RwLock<HashSet<String>>,
    ipset_tx: Option<mpsc::UnboundedSender<String>>,
}

impl PolicyEngine {
    /// Returns the engine and, when an ipset is configured, the
    /// receiving end of the kernel-filter queue.
    pub fn new(
        config: PolicyConfig,
        store: Arc<Store>,
    ) -> (Arc<Self>, Option<mpsc::UnboundedReceiver<String>>) {
        let (ipset_tx, ipset_rx) = if config.ipset_name.is_some() {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let engine = Arc::new(PolicyEngine {
            config,
            store,
            started_at: Instant::now(),
            stats: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
            whitelist: RwLock::new(HashSet::new()),
            ipset_tx,
        });
        (engine, ipset_rx)
    }

    fn entry(&self, ip: &str) -> Arc<Mutex<IpStats>> {
        if let Some(entry) = self.stats.read().unwrap().get(ip) {
            return entry.clone();
        }
        let mut map = self.stats.write().unwrap();
        map.entry(ip.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(IpStats::new(self.config.connection_limit))))
            .clone()
    }

    fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.read().unwrap().contains(ip)
    }

    /// Is this IP currently locked out? Whitelist wins; a temp ban
    /// lapses after `temp_ban_secs`.
    pub fn is_banned(&self, ip: &str) -> bool {
        if self.is_whitelisted(ip) {
            return false;
        }
        let Some(entry) = self.stats.read().unwrap().get(ip).cloned() else { return false };
        let mut stats = entry.lock().unwrap();
        if stats.banned {
            return true;
        }
        match stats.banned_at {
            Some(at) if at.elapsed() < Duration::from_secs(self.config.temp_ban_secs) => true,
            Some(_) => {
                stats.banned_at = None;
                false
            }
            None => false,
        }
    }

    fn ban(&self, ip: &str, stats: &mut IpStats, reason: &str) {
        stats.banned = true;
        tracing::warn!("🚫 Banned {}: {}", ip, reason);
        self.queue_ipset(ip);
    }

    fn temp_ban(&self, ip: &str, stats: &mut IpStats) {
        stats.banned_at = Some(Instant::now());
        tracing::warn!(
            "🚫 Temp ban {} for {}s: score {} over {}",
            ip, self.config.temp_ban_secs, stats.score, self.config.max_score,
        );
        self.queue_ipset(ip);
    }

    fn queue_ipset(&self, ip: &str) {
        if let Some(tx) = &self.ipset_tx {
            let _ = tx.send(ip.to_string());
        }
    }

    /// Add `cost` to the rolling score, resetting it when the window
    /// lapsed. Crossing the maximum earns a temp ban.
    fn add_score(&self, ip: &str, stats: &mut IpStats, cost: u32) {
        if stats.last_score_reset.elapsed() >= Duration::from_secs(self.config.score_reset_secs) {
            stats.score = 0;
            stats.last_score_reset = Instant::now();
        }
        stats.score += cost;
        if stats.score >= self.config.max_score && stats.banned_at.is_none() && !stats.banned {
            self.temp_ban(ip, stats);
        }
    }

    // ─── Checks ──────────────────────────────────────────────────────

    /// Connection policy: always allow during the startup grace
    /// period, afterwards spend one connection credit.
    pub fn allow_connection(&self, ip: &str) -> bool {
        if self.is_whitelisted(ip) {
            return true;
        }
        if self.is_banned(ip) {
            return false;
        }
        let entry = self.entry(ip);
        let mut stats = entry.lock().unwrap();
        stats.last_beat = Instant::now();
        self.add_score(ip, &mut stats, SCORE_COST_CONNECTION);

        if self.started_at.elapsed() < Duration::from_secs(self.config.grace_period_secs) {
            return true;
        }
        if stats.conn_limit <= 0 {
            tracing::debug!("connection limit exhausted for {}", ip);
            return false;
        }
        stats.conn_limit -= 1;
        true
    }

    /// Login policy: a blacklisted address gets the IP banned.
    pub fn allow_login(&self, ip: &str, address: &str) -> bool {
        if self.is_banned(ip) {
            return false;
        }
        let entry = self.entry(ip);
        let mut stats = entry.lock().unwrap();
        stats.last_beat = Instant::now();
        self.add_score(ip, &mut stats, SCORE_COST_AUTH);

        if self.blacklist.read().unwrap().contains(&address.to_lowercase()) {
            self.ban(ip, &mut stats, "blacklisted address");
            return false;
        }
        true
    }

    /// A valid share earns back connection credits.
    pub fn record_valid_share(&self, ip: &str) {
        let entry = self.entry(ip);
        let mut stats = entry.lock().unwrap();
        stats.last_beat = Instant::now();
        stats.valid_shares += 1;
        stats.conn_limit += self.config.limit_jump;
        self.check_share_ratio(ip, &mut stats);
    }

    pub fn record_invalid_share(&self, ip: &str) {
        let entry = self.entry(ip);
        let mut stats = entry.lock().unwrap();
        stats.last_beat = Instant::now();
        stats.invalid_shares += 1;
        self.add_score(ip, &mut stats, SCORE_COST_INVALID_SHARE);
        self.check_share_ratio(ip, &mut stats);
    }

    /// After enough shares, ban on a high invalid ratio; either way
    /// the counters start a fresh round.
    fn check_share_ratio(&self, ip: &str, stats: &mut IpStats) {
        if stats.valid_shares + stats.invalid_shares < self.config.check_threshold {
            return;
        }
        let ratio = stats.invalid_shares * 100 / (stats.valid_shares + 1);
        stats.valid_shares = 0;
        stats.invalid_shares = 0;
        if ratio >= self.config.invalid_percent {
            self.ban(ip, stats, &format!("invalid share ratio {}%", ratio));
        }
    }

    /// Malformed traffic is banned quickly.
    pub fn record_malformed(&self, ip: &str) {
        let entry = self.entry(ip);
        let mut stats = entry.lock().unwrap();
        stats.last_beat = Instant::now();
        stats.malformed += 1;
        self.add_score(ip, &mut stats, SCORE_COST_MALFORMED);
        if stats.malformed >= self.config.malformed_limit && !stats.banned {
            self.ban(ip, &mut stats, "malformed traffic");
        }
    }

    // ─── Background maintenance ──────────────────────────────────────

    /// Drop stats for IPs not seen in a while, keeping active bans.
    pub fn reset_stale(&self) {
        let horizon = Duration::from_secs(self.config.reset_interval_secs);
        let mut map = self.stats.write().unwrap();
        map.retain(|_, entry| {
            let stats = entry.lock().unwrap();
            stats.banned || stats.banned_at.is_some() || stats.last_beat.elapsed() < horizon
        });
    }

    /// Reload the blacklist/whitelist snapshots from the store.
    pub fn refresh_lists(&self) {
        match self.store.blacklist() {
            Ok(entries) => {
                *self.blacklist.write().unwrap() = entries.into_iter().collect();
            }
            Err(err) => tracing::warn!("blacklist reload failed: {}", err),
        }
        match self.store.whitelist() {
            Ok(entries) => {
                *self.whitelist.write().unwrap() = entries.into_iter().collect();
            }
            Err(err) => tracing::warn!("whitelist reload failed: {}", err),
        }
    }

    pub fn ban_count(&self) -> usize {
        self.stats
            .read()
            .unwrap()
            .values()
            .filter(|entry| {
                let stats = entry.lock().unwrap();
                stats.banned
                    || stats
                        .banned_at
                        .is_some_and(|at| at.elapsed() < Duration::from_secs(self.config.temp_ban_secs))
            })
            .count()
    }
}

/// Stale-stat sweep and list refresh, on their configured cadences.
pub async fn maintenance_loop(engine: Arc<PolicyEngine>, mut shutdown: Shutdown) {
    engine.refresh_lists();
    let mut reset = tokio::time::interval(Duration::from_secs(engine.config.reset_interval_secs));
    let mut refresh =
        tokio::time::interval(Duration::from_secs(engine.config.refresh_interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = reset.tick() => engine.reset_stale(),
            _ = refresh.tick() => engine.refresh_lists(),
        }
    }
    tracing::debug!("policy maintenance stopped");
}
