//! Pooling of SOCKS5-dialed upstream connections.
//!
//! A pooled connection is bound to a `(upstream, target)` pair: the same
//! upstream proxy may be asked to dial many different origins, so the pool
//! key includes both rather than just the upstream address.

use bytes::BytesMut;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;

pub struct PooledSession {
    pub stream: Socks5Stream<tokio::net::TcpStream>,
    pub read_buf: BytesMut,
    pub last_used: Instant,
}

impl PooledSession {
    fn new(stream: Socks5Stream<tokio::net::TcpStream>) -> Self {
        PooledSession {
            stream,
            read_buf: BytesMut::new(),
            last_used: Instant::now(),
        }
    }
}

/// Per-(upstream, target) LIFO connection pools, generalizing the proxy
/// layer's single-key pool to the extra origin dimension a forward proxy
/// has to account for.
#[derive(Default)]
pub struct SessionPool {
    pools: DashMap<String, Vec<PooledSession>>,
}

fn pool_key(upstream_addr: &str, target: &str) -> String {
    format!("{upstream_addr}|{target}")
}

impl SessionPool {
    pub fn new() -> Self {
        SessionPool::default()
    }

    pub async fn checkout(
        &self,
        upstream_addr: &str,
        target: &str,
        connect_timeout: Duration,
        idle_ttl: Duration,
    ) -> anyhow::Result<PooledSession> {
        let key = pool_key(upstream_addr, target);
        if let Some(mut entry) = self.pools.get_mut(&key) {
            while let Some(pooled) = entry.pop() {
                if idle_ttl.is_zero() || pooled.last_used.elapsed() <= idle_ttl {
                    tracing::debug!(
                        target: "fwdproxy::forwarder",
                        upstream = upstream_addr,
                        dest = target,
                        "reusing pooled upstream session"
                    );
                    return Ok(pooled);
                }
                tracing::debug!(
                    target: "fwdproxy::forwarder",
                    upstream = upstream_addr,
                    "dropping idle pooled session"
                );
            }
        }

        connect_fresh(upstream_addr, target, connect_timeout).await
    }

    pub fn checkin(&self, upstream_addr: &str, target: &str, mut pooled: PooledSession, max_pool: usize) {
        pooled.last_used = Instant::now();
        let key = pool_key(upstream_addr, target);
        let mut entry = self.pools.entry(key).or_insert_with(Vec::new);
        if entry.len() >= max_pool {
            return;
        }
        entry.push(pooled);
    }

    /// Idle session count per upstream address, summed across every
    /// destination target that upstream has pooled sessions for. Used to
    /// populate the `sessions_pooled` field of the observability snapshot.
    pub fn counts_by_upstream(&self) -> std::collections::HashMap<String, u32> {
        let mut counts = std::collections::HashMap::new();
        for entry in self.pools.iter() {
            let Some((upstream_addr, _target)) = entry.key().split_once('|') else {
                continue;
            };
            *counts.entry(upstream_addr.to_string()).or_insert(0u32) += entry.value().len() as u32;
        }
        counts
    }
}

pub async fn connect_fresh(
    upstream_addr: &str,
    target: &str,
    connect_timeout: Duration,
) -> anyhow::Result<PooledSession> {
    let stream = match timeout(connect_timeout, Socks5Stream::connect(upstream_addr, target)).await
    {
        Ok(res) => res.map_err(|e| anyhow::anyhow!("SOCKS5 connect via {upstream_addr} failed: {e}"))?,
        Err(_) => anyhow::bail!("SOCKS5 connect via {upstream_addr} timed out"),
    };

    Ok(PooledSession::new(stream))
}
