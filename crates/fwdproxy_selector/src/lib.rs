//! Stateless selection policy over the registry's available set.
//!
//! Carries exactly one piece of state: the round-robin cursor. Generalizes
//! the round-robin rotation the proxy layer used for per-upstream fallback
//! ordering (`choose_upstream_addrs_rr_order`) into a policy that also
//! supports uniform-random selection.

use fwdproxy_config::Algorithm;
use fwdproxy_registry::UpstreamAddr;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Selector {
    algorithm: Algorithm,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(algorithm: Algorithm) -> Self {
        Selector {
            algorithm,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Returns `available` reordered so the first element is this call's
    /// pick and the rest form the fallback order for a retry loop. Empty
    /// input yields empty output — callers translate that to "no upstream".
    pub fn choose_order(&self, available: &[UpstreamAddr]) -> Vec<UpstreamAddr> {
        if available.is_empty() {
            return Vec::new();
        }
        match self.algorithm {
            Algorithm::RoundRobin => {
                let len = available.len();
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
                (0..len).map(|i| available[(start + i) % len].clone()).collect()
            }
            Algorithm::Random => {
                let mut shuffled = available.to_vec();
                shuffled.shuffle(&mut rand::thread_rng());
                shuffled
            }
        }
    }

    pub fn choose_one(&self, available: &[UpstreamAddr]) -> Option<UpstreamAddr> {
        self.choose_order(available).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<UpstreamAddr> {
        (0..n)
            .map(|i| UpstreamAddr {
                host: "127.0.0.1".to_string(),
                port: 9000 + i as u16,
            })
            .collect()
    }

    #[test]
    fn empty_snapshot_yields_no_candidates() {
        let sel = Selector::new(Algorithm::RoundRobin);
        assert!(sel.choose_order(&[]).is_empty());
    }

    #[test]
    fn round_robin_cycles_through_every_record_exactly_once() {
        let sel = Selector::new(Algorithm::RoundRobin);
        let available = addrs(3);
        let mut hits = std::collections::HashMap::new();
        for _ in 0..6 {
            let picked = sel.choose_one(&available).unwrap();
            *hits.entry(picked.port).or_insert(0) += 1;
        }
        for a in &available {
            assert_eq!(hits[&a.port], 2);
        }
    }

    #[test]
    fn round_robin_order_advances_on_every_call() {
        let sel = Selector::new(Algorithm::RoundRobin);
        let available = addrs(3);
        let first = sel.choose_one(&available).unwrap();
        let second = sel.choose_one(&available).unwrap();
        assert_ne!(first.port, second.port);
    }

    #[test]
    fn random_preserves_full_candidate_set() {
        let sel = Selector::new(Algorithm::Random);
        let available = addrs(4);
        let order = sel.choose_order(&available);
        assert_eq!(order.len(), available.len());
        for a in &available {
            assert!(order.iter().any(|o| o.port == a.port));
        }
    }
}
