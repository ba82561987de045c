//! Background health probing, generalized from the proxy layer's single
//! active-health-check ticker into the two independent cadences the
//! three-state lifecycle needs: a full liveness sweep, and a separate,
//! faster sweep that only promotes upstreams out of Resting once their
//! backoff has elapsed.

use fwdproxy_registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout};
use tokio_socks::tcp::Socks5Stream;

#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub health_check_interval: Duration,
    pub rest_check_interval: Duration,
    pub connection_timeout: Duration,
    /// Fixed downstream target dialed *through* each upstream. Defaults to
    /// the upstream's own address, i.e. a bare SOCKS5 handshake with no
    /// further HTTP traffic (see the probe-target design decision).
    pub probe_target: Option<String>,
}

pub struct Prober {
    registry: Arc<Registry>,
    config: ProberConfig,
}

impl Prober {
    pub fn new(registry: Arc<Registry>, config: ProberConfig) -> Self {
        Prober { registry, config }
    }

    /// Spawn both sweeps as background tasks. Returns their handles so the
    /// caller can abort them on shutdown.
    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let health_task = {
            let prober = Arc::clone(&self);
            tokio::spawn(async move { prober.run_health_sweep().await })
        };
        let rest_task = {
            let prober = Arc::clone(&self);
            tokio::spawn(async move { prober.run_rest_sweep().await })
        };
        (health_task, rest_task)
    }

    async fn run_health_sweep(&self) {
        let mut ticker = interval(self.config.health_check_interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            for addr in self.registry.all_addrs() {
                let key = addr.key();
                let reachable = self.probe(&key).await;
                tracing::debug!(
                    target: "fwdproxy::prober",
                    upstream = %key,
                    reachable,
                    "health probe result"
                );
                self.registry.apply_probe_result(&key, reachable);
            }
        }
    }

    async fn run_rest_sweep(&self) {
        let mut ticker = interval(self.config.rest_check_interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let promoted = self.registry.promote_expired_resting();
            if promoted > 0 {
                tracing::info!(
                    target: "fwdproxy::prober",
                    count = promoted,
                    "promoted resting upstream(s) to available"
                );
            }
        }
    }

    /// A bare SOCKS5 CONNECT handshake through `upstream_addr` to the
    /// configured probe target (or the upstream itself).
    async fn probe(&self, upstream_addr: &str) -> bool {
        let target = self
            .config
            .probe_target
            .clone()
            .unwrap_or_else(|| upstream_addr.to_string());

        matches!(
            timeout(
                self.config.connection_timeout,
                Socks5Stream::connect(upstream_addr, target.as_str()),
            )
            .await,
            Ok(Ok(_))
        )
    }
}
