use std::sync::Arc;
use std::time::Duration;

use fwdproxy_config::FwdProxyConfig;
use fwdproxy_core::Listener;
use fwdproxy_forwarder::{Forwarder, ForwarderTuning};
use fwdproxy_prober::{Prober, ProberConfig};
use fwdproxy_registry::{Registry, RegistryTuning};
use fwdproxy_selector::Selector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = FwdProxyConfig::from_file_or_default("fwdproxy.json");

    let report = cfg.validate();
    for warning in report.warnings() {
        eprintln!("config warning: {warning}");
    }
    if report.has_errors() {
        for error in report.errors() {
            eprintln!("config error: {error}");
        }
        anyhow::bail!("configuration has {} error(s)", report.errors().len());
    }

    utils::init_tracing(&cfg.global.log_level);
    cfg.print();

    let cfg = Arc::new(cfg);

    let registry = Arc::new(Registry::new(
        &cfg.proxies,
        RegistryTuning {
            max_retries: cfg.max_retries,
            overload_backoff_base_secs: cfg.overload_backoff_base_secs,
            overload_backoff_cap_secs: cfg.proxy_rest_duration,
        },
    ));

    let selector = Selector::new(cfg.load_balancing_algorithm);

    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&registry),
        selector,
        ForwarderTuning {
            connect_timeout: Duration::from_secs(cfg.connection_timeout),
            read_timeout: Duration::from_secs(cfg.connection_timeout),
            pool_idle_timeout: Duration::from_secs(cfg.keepalive_timeout_secs),
            max_pool_per_key: 32,
            max_response_headers_bytes: cfg.max_request_headers_bytes,
            max_response_body_bytes: cfg.max_request_body_bytes,
        },
    ));

    let prober = Arc::new(Prober::new(
        Arc::clone(&registry),
        ProberConfig {
            health_check_interval: Duration::from_secs(cfg.health_check_interval),
            rest_check_interval: Duration::from_secs(cfg.rest_check_interval()),
            connection_timeout: Duration::from_secs(cfg.connection_timeout),
            probe_target: cfg.probe_target.clone(),
        },
    ));
    let (_health_task, _rest_task) = prober.spawn();

    let stats_forwarder = Arc::clone(&forwarder);
    let _stats_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let snap = stats_forwarder.snapshot();
            tracing::info!(
                target: "fwdproxy::core",
                total_requests = snap.total_requests,
                success_rate = snap.overall_success_rate,
                available = snap.available_count,
                unavailable = snap.unavailable_count,
                resting = snap.resting_count,
                "stats snapshot"
            );
        }
    });

    tracing::info!(
        target: "fwdproxy::core",
        upstreams = cfg.proxies.len(),
        algorithm = ?cfg.load_balancing_algorithm,
        "starting forward proxy"
    );

    let listener = Listener::new(cfg, forwarder);
    listener.run().await
}
