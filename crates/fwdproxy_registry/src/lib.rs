//! The upstream registry: the three-state lifecycle (available, unavailable,
//! resting) that every other component reads or mutates.

mod record;
mod snapshot;

pub use record::{UpstreamRecord, UpstreamState};
pub use snapshot::{RegistrySnapshot, UpstreamStat};

use dashmap::DashMap;
use fwdproxy_config::UpstreamEntry;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// `(host, port)` pair identifying an upstream. Cheap to clone, used as the
/// registry's map key in its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamAddr {
    pub host: String,
    pub port: u16,
}

impl UpstreamAddr {
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<&UpstreamEntry> for UpstreamAddr {
    fn from(e: &UpstreamEntry) -> Self {
        UpstreamAddr {
            host: e.host.clone(),
            port: e.port,
        }
    }
}

/// Tuning the registry needs in order to compute transitions on its own;
/// kept narrow rather than threading the whole config struct through.
#[derive(Debug, Clone, Copy)]
pub struct RegistryTuning {
    pub max_retries: u32,
    pub overload_backoff_base_secs: u64,
    pub overload_backoff_cap_secs: Option<u64>,
}

/// Concurrency-safe collection of upstream records.
///
/// Backed by a `DashMap` keyed by `"host:port"`, the same sharded-lock
/// pattern the health tracker used for its per-upstream state, generalized
/// from a single up/down bit to the full three-state lifecycle.
pub struct Registry {
    records: DashMap<String, UpstreamRecord>,
    /// Stable iteration order for round-robin and deterministic snapshots.
    /// DashMap's own iteration order is not guaranteed stable across
    /// mutation, so selection needs this alongside it.
    order: RwLock<Vec<String>>,
    tuning: RegistryTuning,
}

impl Registry {
    pub fn new(proxies: &[UpstreamEntry], tuning: RegistryTuning) -> Self {
        let registry = Registry {
            records: DashMap::new(),
            order: RwLock::new(Vec::new()),
            tuning,
        };
        for entry in proxies {
            registry.insert_new(entry);
        }
        registry
    }

    fn insert_new(&self, entry: &UpstreamEntry) {
        let addr = UpstreamAddr::from(entry);
        let key = addr.key();
        if self.records.contains_key(&key) {
            return;
        }
        self.records.insert(key.clone(), UpstreamRecord::new(addr));
        self.order.write().unwrap().push(key);
    }

    /// Replace the configured upstream set: add newly present keys, drop
    /// removed ones, leave retained records (and their counters) in place.
    pub fn reconcile(&self, proxies: &[UpstreamEntry]) {
        let wanted: std::collections::HashSet<String> = proxies
            .iter()
            .map(|e| UpstreamAddr::from(e).key())
            .collect();

        for entry in proxies {
            self.insert_new(entry);
        }

        let removed: Vec<String> = self
            .records
            .iter()
            .map(|r| r.key().clone())
            .filter(|k| !wanted.contains(k))
            .collect();

        if removed.is_empty() {
            return;
        }

        for key in &removed {
            self.records.remove(key);
        }
        let mut order = self.order.write().unwrap();
        order.retain(|k| !removed.contains(k));
    }

    /// An ordered snapshot of `Available` records, safe to iterate without
    /// holding any registry lock.
    pub fn snapshot_available(&self) -> Vec<UpstreamAddr> {
        let order = self.order.read().unwrap();
        order
            .iter()
            .filter_map(|key| {
                self.records.get(key).and_then(|r| {
                    if r.state == UpstreamState::Available {
                        Some(r.addr.clone())
                    } else {
                        None
                    }
                })
            })
            .collect()
    }

    /// All configured addresses regardless of state, in stable order —
    /// used by the prober, which must probe every record each sweep.
    pub fn all_addrs(&self) -> Vec<UpstreamAddr> {
        let order = self.order.read().unwrap();
        order
            .iter()
            .filter_map(|key| self.records.get(key).map(|r| r.addr.clone()))
            .collect()
    }

    pub fn state_of(&self, addr: &str) -> Option<UpstreamState> {
        self.records.get(addr).map(|r| r.state)
    }

    pub fn mark_success(&self, addr: &str) {
        if let Some(mut r) = self.records.get_mut(addr) {
            r.request_count += 1;
            r.success_count += 1;
            r.consecutive_failures = 0;
            r.overload_count = 0;
            if r.state != UpstreamState::Available {
                tracing::info!(
                    target: "fwdproxy::registry",
                    upstream = addr,
                    from = ?r.state,
                    "upstream recovered to available"
                );
            }
            r.state = UpstreamState::Available;
            r.rest_until = None;
        }
    }

    pub fn mark_failure(&self, addr: &str) {
        if let Some(mut r) = self.records.get_mut(addr) {
            r.request_count += 1;
            r.failure_count += 1;
            r.consecutive_failures += 1;
            if r.state == UpstreamState::Available
                && r.consecutive_failures >= self.tuning.max_retries.max(1)
            {
                r.state = UpstreamState::Unavailable;
                tracing::warn!(
                    target: "fwdproxy::registry",
                    upstream = addr,
                    consecutive_failures = r.consecutive_failures,
                    "upstream marked unavailable"
                );
            }
        }
    }

    pub fn mark_overloaded(&self, addr: &str) {
        if let Some(mut r) = self.records.get_mut(addr) {
            r.request_count += 1;
            r.overload_count += 1;
            let mut delay =
                self.tuning.overload_backoff_base_secs * (1u64 << (r.overload_count - 1).min(40));
            if let Some(cap) = self.tuning.overload_backoff_cap_secs {
                delay = delay.min(cap);
            }
            r.rest_until = Some(Instant::now() + Duration::from_secs(delay));
            r.state = UpstreamState::Resting;
            tracing::info!(
                target: "fwdproxy::registry",
                upstream = addr,
                overload_count = r.overload_count,
                rest_secs = delay,
                "upstream resting after overload"
            );
        }
    }

    /// Overwrite each record's `sessions_pooled` counter from an external
    /// source (the forwarder's session pool lives in another crate and
    /// counts its own idle sessions per upstream); used just before taking
    /// a snapshot. Keys absent from `counts` are reset to zero.
    pub fn set_sessions_pooled(&self, counts: &std::collections::HashMap<String, u32>) {
        for mut r in self.records.iter_mut() {
            r.sessions_pooled = counts.get(r.key()).copied().unwrap_or(0);
        }
    }

    /// Probe hook used by the full health sweep: Available demotes on
    /// failure, Unavailable promotes on success. Resting is left untouched
    /// — its clock is driven only by `promote_expired_resting`.
    pub fn apply_probe_result(&self, addr: &str, reachable: bool) {
        if let Some(mut r) = self.records.get_mut(addr) {
            match (r.state, reachable) {
                (UpstreamState::Available, false) => {
                    r.state = UpstreamState::Unavailable;
                    tracing::warn!(
                        target: "fwdproxy::prober",
                        upstream = addr,
                        "probe failed, marking unavailable"
                    );
                }
                (UpstreamState::Unavailable, true) => {
                    r.state = UpstreamState::Available;
                    r.consecutive_failures = 0;
                    tracing::info!(
                        target: "fwdproxy::prober",
                        upstream = addr,
                        "probe succeeded, marking available"
                    );
                }
                _ => {}
            }
        }
    }

    /// Promote any Resting record whose rest period has elapsed. Returns
    /// the number promoted, useful for log/test assertions.
    pub fn promote_expired_resting(&self) -> usize {
        let now = Instant::now();
        let mut promoted = 0;
        for mut r in self.records.iter_mut() {
            if r.state == UpstreamState::Resting {
                if let Some(until) = r.rest_until {
                    if now >= until {
                        r.state = UpstreamState::Available;
                        r.consecutive_failures = 0;
                        r.rest_until = None;
                        promoted += 1;
                    }
                }
            }
        }
        promoted
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let order = self.order.read().unwrap();
        let mut stats = Vec::with_capacity(order.len());
        let mut available_count = 0;
        let mut unavailable_count = 0;
        let mut resting_count = 0;
        let mut total_requests = 0u64;
        let mut total_successes = 0u64;

        for key in order.iter() {
            if let Some(r) = self.records.get(key) {
                match r.state {
                    UpstreamState::Available => available_count += 1,
                    UpstreamState::Unavailable => unavailable_count += 1,
                    UpstreamState::Resting => resting_count += 1,
                }
                total_requests += r.request_count;
                total_successes += r.success_count;
                stats.push(UpstreamStat::from(&*r));
            }
        }

        let overall_success_rate = if total_requests == 0 {
            0.0
        } else {
            total_successes as f64 / total_requests as f64
        };

        RegistrySnapshot {
            upstreams: stats,
            total_requests,
            overall_success_rate,
            available_count,
            unavailable_count,
            resting_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tuning() -> RegistryTuning {
        RegistryTuning {
            max_retries: 2,
            overload_backoff_base_secs: 30,
            overload_backoff_cap_secs: None,
        }
    }

    fn test_entries(n: usize) -> Vec<UpstreamEntry> {
        (0..n)
            .map(|i| UpstreamEntry {
                host: "127.0.0.1".to_string(),
                port: 9000 + i as u16,
            })
            .collect()
    }

    #[test]
    fn new_records_start_available() {
        let reg = Registry::new(&test_entries(3), test_tuning());
        assert_eq!(reg.snapshot_available().len(), 3);
    }

    #[test]
    fn mark_failure_demotes_after_max_retries() {
        let entries = test_entries(1);
        let reg = Registry::new(&entries, test_tuning());
        let key = UpstreamAddr::from(&entries[0]).key();

        reg.mark_failure(&key);
        assert_eq!(reg.state_of(&key), Some(UpstreamState::Available));
        reg.mark_failure(&key);
        assert_eq!(reg.state_of(&key), Some(UpstreamState::Unavailable));
    }

    #[test]
    fn mark_success_clears_failures_and_overload() {
        let entries = test_entries(1);
        let reg = Registry::new(&entries, test_tuning());
        let key = UpstreamAddr::from(&entries[0]).key();

        reg.mark_failure(&key);
        reg.mark_overloaded(&key);
        reg.mark_success(&key);

        let snap = reg.snapshot();
        let stat = &snap.upstreams[0];
        assert_eq!(stat.consecutive_failures, 0);
        assert_eq!(stat.overload_count, 0);
        assert_eq!(stat.state, "available");
    }

    #[test]
    fn mark_overloaded_moves_to_resting_and_backs_off() {
        let entries = test_entries(1);
        let reg = Registry::new(&entries, test_tuning());
        let key = UpstreamAddr::from(&entries[0]).key();

        reg.mark_overloaded(&key);
        assert_eq!(reg.state_of(&key), Some(UpstreamState::Resting));
        assert!(reg.snapshot_available().is_empty());

        reg.mark_overloaded(&key);
        let snap = reg.snapshot();
        assert_eq!(snap.upstreams[0].overload_count, 2);
    }

    #[test]
    fn promote_expired_resting_returns_to_available() {
        let entries = test_entries(1);
        let tuning = RegistryTuning {
            max_retries: 2,
            overload_backoff_base_secs: 0,
            overload_backoff_cap_secs: None,
        };
        let reg = Registry::new(&entries, tuning);
        let key = UpstreamAddr::from(&entries[0]).key();

        reg.mark_overloaded(&key);
        assert_eq!(reg.state_of(&key), Some(UpstreamState::Resting));

        std::thread::sleep(Duration::from_millis(5));
        let promoted = reg.promote_expired_resting();
        assert_eq!(promoted, 1);
        assert_eq!(reg.state_of(&key), Some(UpstreamState::Available));
    }

    #[test]
    fn reconcile_adds_and_drops_upstreams() {
        let entries = test_entries(2);
        let reg = Registry::new(&entries, test_tuning());
        assert_eq!(reg.snapshot_available().len(), 2);

        let mut new_entries = test_entries(1);
        new_entries.push(UpstreamEntry {
            host: "127.0.0.1".to_string(),
            port: 9100,
        });
        reg.reconcile(&new_entries);

        let available = reg.snapshot_available();
        assert_eq!(available.len(), 2);
        assert!(available.iter().any(|a| a.port == 9100));
        assert!(!available.iter().any(|a| a.port == 9001));
    }

    #[test]
    fn set_sessions_pooled_overwrites_and_resets_counters() {
        let entries = test_entries(2);
        let reg = Registry::new(&entries, test_tuning());
        let key0 = UpstreamAddr::from(&entries[0]).key();

        let mut counts = std::collections::HashMap::new();
        counts.insert(key0.clone(), 3);
        reg.set_sessions_pooled(&counts);

        let snap = reg.snapshot();
        let stat0 = snap.upstreams.iter().find(|s| s.port == entries[0].port).unwrap();
        let stat1 = snap.upstreams.iter().find(|s| s.port == entries[1].port).unwrap();
        assert_eq!(stat0.sessions_pooled, 3);
        assert_eq!(stat1.sessions_pooled, 0);

        reg.set_sessions_pooled(&std::collections::HashMap::new());
        let snap = reg.snapshot();
        assert!(snap.upstreams.iter().all(|s| s.sessions_pooled == 0));
    }

    #[test]
    fn round_robin_order_is_stable_across_snapshots() {
        let entries = test_entries(3);
        let reg = Registry::new(&entries, test_tuning());
        let first = reg.snapshot_available();
        let second = reg.snapshot_available();
        assert_eq!(first, second);
    }
}
