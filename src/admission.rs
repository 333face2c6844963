//! Admission control: per-address token buckets, failure counting with
//! temporary bans, and the allow-list gate for starting the on-demand backend.
//!
//! ```text
//! login attempt
//!     |
//!     +-- BanList::banned_until      (every connection on an admission route)
//!     +-- RateLimiter::try_consume   (logins only)
//!     +-- AllowList::contains        (logins that would start the backend)
//!     |
//!     v
//! Ok(()) or Err(DenialCode)  -- denials feed BanList::record_failure
//! ```
//!
//! Both per-address maps are bounded by `max_tracked_ips`. When full, the
//! least recently seen entry is evicted; the ban list prefers evicting
//! addresses that are not currently banned.

use crate::config::{AdmissionConfig, BanConfig, RateLimitConfig};
use crate::error::DenialCode;
use anyhow::Context;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Remove the lowest-ranked entry from `map`.
///
/// Linear scan, run only when a new address arrives while the map is at
/// `max_tracked_ips`. Config caps that bound at `MAX_TRACKED_IPS`; raising the
/// cap needs an ordered index here instead.
fn evict_one<V, K>(map: &DashMap<IpAddr, V>, rank: impl Fn(&V) -> K) -> bool
where
    K: Ord,
{
    let victim = map.iter().min_by_key(|e| rank(e.value())).map(|e| *e.key());
    match victim {
        Some(ip) => map.remove(&ip).is_some(),
        None => false,
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    /// Add whole elapsed intervals; the partial interval carries over
    fn refill(&mut self, now: Instant, config: &RateLimitConfig) {
        let interval = config.refill_interval().as_nanos().max(1);
        let elapsed = now.saturating_duration_since(self.last_refill);
        let steps = elapsed.as_nanos() / interval;
        if steps == 0 {
            return;
        }

        let added = steps.saturating_mul(u128::from(config.refill_tokens));
        let tokens = (u128::from(self.tokens) + added).min(u128::from(config.max_tokens));
        self.tokens = tokens as u32;

        let remainder = Duration::from_nanos((elapsed.as_nanos() % interval) as u64);
        self.last_refill = now.checked_sub(remainder).unwrap_or(now);
    }
}

/// Per-address token bucket rate limiter
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    config: RateLimitConfig,
    max_tracked: usize,
    evicted: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, max_tracked: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            max_tracked: max_tracked.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn try_consume(&self, ip: IpAddr) -> bool {
        self.try_consume_at(ip, Instant::now())
    }

    /// Take one token for `ip` if at least one is available at `now`
    pub fn try_consume_at(&self, ip: IpAddr, now: Instant) -> bool {
        if !self.buckets.contains_key(&ip) && self.buckets.len() >= self.max_tracked {
            if evict_one(&self.buckets, |b| b.last_seen) {
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut bucket = self.buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.config.initial_tokens.min(self.config.max_tokens),
            last_refill: now,
            last_seen: now,
        });
        bucket.refill(now, &self.config);
        bucket.last_seen = now;

        if bucket.tokens >= 1 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently held for `ip`, refilled as of `now`
    pub fn tokens_at(&self, ip: IpAddr, now: Instant) -> Option<u32> {
        self.buckets.get_mut(&ip).map(|mut bucket| {
            bucket.refill(now, &self.config);
            bucket.tokens
        })
    }

    /// Forget buckets that have refilled to capacity
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill(now, &self.config);
            bucket.tokens < self.config.max_tokens
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
struct BanRecord {
    failures: u32,
    window_start: Instant,
    banned_until: Option<Instant>,
    last_seen: Instant,
}

impl BanRecord {
    fn is_banned_at(&self, now: Instant) -> bool {
        matches!(self.banned_until, Some(until) if now < until)
    }
}

/// Result of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failure counted; this many in the current window
    Counted(u32),
    /// This failure reached the threshold; banned until the given time
    Banned(Instant),
    /// The address was already banned; the ban is unchanged
    AlreadyBanned(Instant),
}

/// Per-address failure counter with temporary bans
pub struct BanList {
    records: DashMap<IpAddr, BanRecord>,
    config: BanConfig,
    max_tracked: usize,
    evicted: AtomicU64,
}

impl BanList {
    pub fn new(config: BanConfig, max_tracked: usize) -> Self {
        Self {
            records: DashMap::new(),
            config,
            max_tracked: max_tracked.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn record_failure(&self, ip: IpAddr) -> FailureOutcome {
        self.record_failure_at(ip, Instant::now())
    }

    pub fn record_failure_at(&self, ip: IpAddr, now: Instant) -> FailureOutcome {
        if !self.records.contains_key(&ip) && self.records.len() >= self.max_tracked {
            // Unbanned addresses go first, oldest first
            if evict_one(&self.records, |r| (r.is_banned_at(now), r.last_seen)) {
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut record = self.records.entry(ip).or_insert_with(|| BanRecord {
            failures: 0,
            window_start: now,
            banned_until: None,
            last_seen: now,
        });
        record.last_seen = now;

        match record.banned_until {
            Some(until) if now < until => return FailureOutcome::AlreadyBanned(until),
            Some(_) => {
                record.banned_until = None;
                record.failures = 0;
            }
            None => {}
        }

        if record.failures == 0
            || now.saturating_duration_since(record.window_start) >= self.config.failure_window()
        {
            record.failures = 1;
            record.window_start = now;
        } else {
            record.failures += 1;
        }

        if record.failures >= self.config.max_failures {
            let until = now + self.config.ban_duration();
            record.banned_until = Some(until);
            record.failures = 0;
            FailureOutcome::Banned(until)
        } else {
            FailureOutcome::Counted(record.failures)
        }
    }

    pub fn banned_until(&self, ip: IpAddr) -> Option<Instant> {
        self.banned_until_at(ip, Instant::now())
    }

    /// When `ip`'s ban ends, if it is banned at `now`. Expired bans are removed.
    pub fn banned_until_at(&self, ip: IpAddr, now: Instant) -> Option<Instant> {
        let expired = self
            .records
            .remove_if(&ip, |_, r| matches!(r.banned_until, Some(until) if now >= until));
        if expired.is_some() {
            return None;
        }
        self.records
            .get(&ip)
            .and_then(|r| r.banned_until.filter(|until| now < *until))
    }

    /// Failures counted in the current window for `ip`
    pub fn failures(&self, ip: IpAddr) -> u32 {
        self.records.get(&ip).map_or(0, |r| r.failures)
    }

    /// Drop expired bans and failure windows that have lapsed
    pub fn sweep_at(&self, now: Instant) -> usize {
        let window = self.config.failure_window();
        let before = self.records.len();
        self.records.retain(|_, r| match r.banned_until {
            Some(until) => now < until,
            None => now.saturating_duration_since(r.window_start) < window,
        });
        before.saturating_sub(self.records.len())
    }

    pub fn active_bans_at(&self, now: Instant) -> usize {
        self.records.iter().filter(|r| r.is_banned_at(now)).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Allow-list names are compared trimmed and lowercased
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Players permitted to start the on-demand backend, persisted as a JSON array
pub struct AllowList {
    path: Option<PathBuf>,
    names: RwLock<HashSet<String>>,
    /// Serializes mutations so saves land in order; readers never take it
    writer: Mutex<()>,
}

impl AllowList {
    /// An allow-list that is never written to disk
    pub fn in_memory<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            path: None,
            names: RwLock::new(names.into_iter().map(|n| normalize_name(n.as_ref())).collect()),
            writer: Mutex::new(()),
        }
    }

    /// Load from `path`; a missing file is an empty list
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let names: Vec<String> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read allow-list {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse allow-list {}", path.display()))?
        } else {
            Vec::new()
        };

        let list = Self::in_memory(&names);
        info!(path = %path.display(), names = names.len(), "Loaded allow-list");
        Ok(Self {
            path: Some(path),
            ..list
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(&normalize_name(name))
    }

    /// Add a name. Returns false if it was already present.
    pub fn insert(&self, name: &str) -> anyhow::Result<bool> {
        let name = normalize_name(name);
        if name.is_empty() {
            anyhow::bail!("name must not be empty");
        }
        self.mutate(|names| names.insert(name))
    }

    /// Remove a name. Returns false if it was not present.
    pub fn remove(&self, name: &str) -> anyhow::Result<bool> {
        let name = normalize_name(name);
        self.mutate(|names| names.remove(&name))
    }

    /// Apply `change` and save if it reports a change. The file is written
    /// from a copy, outside the lock that `contains` takes.
    fn mutate(&self, change: impl FnOnce(&mut HashSet<String>) -> bool) -> anyhow::Result<bool> {
        let _writer = self.writer.lock();
        let snapshot = {
            let mut names = self.names.write();
            if !change(&mut names) {
                return Ok(false);
            }
            names.clone()
        };
        self.save(&snapshot)?;
        Ok(true)
    }

    /// All names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.read().iter().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// Write via a temp file and rename so readers never see a partial list
    fn save(&self, names: &HashSet<String>) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&sorted)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        debug!(path = %path.display(), names = sorted.len(), "Saved allow-list");
        Ok(())
    }
}

/// Admission counters for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub rate_buckets: usize,
    pub ban_records: usize,
    pub active_bans: usize,
    pub evicted: u64,
    pub allowlist_enabled: bool,
    pub allowlist_size: usize,
}

/// Combined admission policy for routes that require it
pub struct Admission {
    rate: RateLimiter,
    bans: BanList,
    allowlist: Arc<AllowList>,
    allowlist_enabled: bool,
}

impl Admission {
    /// Build from config, loading the allow-list from `allowlist_path`.
    ///
    /// The list is loaded even when enforcement is off so that admin edits
    /// are persisted.
    pub fn from_config(config: &AdmissionConfig) -> anyhow::Result<Self> {
        let allowlist = AllowList::load(&config.allowlist_path)?;
        Ok(Self::new(config, Arc::new(allowlist)))
    }

    pub fn new(config: &AdmissionConfig, allowlist: Arc<AllowList>) -> Self {
        Self {
            rate: RateLimiter::new(config.rate_limit.clone(), config.max_tracked_ips),
            bans: BanList::new(config.ban.clone(), config.max_tracked_ips),
            allowlist,
            allowlist_enabled: config.allowlist_enabled,
        }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.bans.banned_until(ip).is_some()
    }

    /// Check a login attempt.
    ///
    /// `starts_backend` marks a login that would start the on-demand backend;
    /// only those are checked against the allow-list. Every denial is
    /// recorded as a failure for `ip`.
    pub fn admit_login(&self, ip: IpAddr, name: Option<&str>, starts_backend: bool) -> Result<(), DenialCode> {
        if !self.rate.try_consume(ip) {
            debug!(client = %ip, "Login rate limited");
            self.record_failure(ip);
            return Err(DenialCode::RateLimited);
        }

        if starts_backend && self.allowlist_enabled {
            let allowed = name.is_some_and(|n| self.allowlist.contains(n));
            if !allowed {
                info!(client = %ip, name = name.unwrap_or("-"), "Player not on allow-list");
                self.record_failure(ip);
                return Err(DenialCode::NotAuthorized);
            }
        }

        Ok(())
    }

    pub fn record_failure(&self, ip: IpAddr) -> FailureOutcome {
        let outcome = self.bans.record_failure(ip);
        if let FailureOutcome::Banned(until) = outcome {
            let secs = until.saturating_duration_since(Instant::now()).as_secs();
            warn!(client = %ip, ban_secs = secs, "Address banned after repeated failures");
        }
        outcome
    }

    /// Drop state that no longer affects any decision
    pub fn sweep(&self) {
        let now = Instant::now();
        let buckets = self.rate.sweep_at(now);
        let bans = self.bans.sweep_at(now);
        if buckets > 0 || bans > 0 {
            debug!(buckets, bans, "Swept admission state");
        }
    }

    pub fn allowlist(&self) -> &Arc<AllowList> {
        &self.allowlist
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            rate_buckets: self.rate.len(),
            ban_records: self.bans.len(),
            active_bans: self.bans.active_bans_at(Instant::now()),
            evicted: self.rate.evicted() + self.bans.evicted(),
            allowlist_enabled: self.allowlist_enabled,
            allowlist_size: self.allowlist.len(),
        }
    }
}
