use std::sync::Arc;

use fwdproxy_config::FwdProxyConfig;
use fwdproxy_forwarder::Forwarder;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::worker::handle_connection;

/// Binds the configured listen address and admits connections behind a
/// global semaphore, the same admission pattern the reverse-proxy layer
/// this is grounded on used for its own accept loop.
pub struct Listener {
    cfg: Arc<FwdProxyConfig>,
    forwarder: Arc<Forwarder>,
}

impl Listener {
    pub fn new(cfg: Arc<FwdProxyConfig>, forwarder: Arc<Forwarder>) -> Self {
        Listener { cfg, forwarder }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listen_addr = self.cfg.server.listen_addr();
        info!(target: "fwdproxy::core", listen = %listen_addr, "binding listener");
        let tcp = TcpListener::bind(&listen_addr).await?;

        let max_conns = self.cfg.global.worker_connections as usize;
        let semaphore = Arc::new(Semaphore::new(max_conns));
        info!(target: "fwdproxy::core", max_conns, "connection semaphore initialized");

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = tcp.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(target: "fwdproxy::core", error = ?e, "accept failed");
                            continue;
                        }
                    };

                    let permit = match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };

                    debug!(
                        target: "fwdproxy::core",
                        client = %addr,
                        available_permits = semaphore.available_permits(),
                        "connection accepted"
                    );

                    let forwarder = Arc::clone(&self.forwarder);
                    let cfg = Arc::clone(&self.cfg);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(stream, addr, cfg, forwarder).await {
                            error!(target: "fwdproxy::core", client = %addr, error = ?e, "error while handling connection");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!(target: "fwdproxy::core", "shutdown signal received, draining in-flight connections");
                    break;
                }
            }
        }

        let grace = Duration::from_secs(self.cfg.shutdown_grace_secs);
        let drain = async {
            loop {
                if semaphore.available_permits() >= max_conns {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(target: "fwdproxy::core", "shutdown grace period elapsed with connections still in flight");
        }

        Ok(())
    }
}
