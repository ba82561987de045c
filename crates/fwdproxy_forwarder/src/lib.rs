//! Turns a parsed client request into upstream traffic: selects a
//! candidate upstream, dials or reuses a pooled SOCKS5 session, forwards
//! the request, and retries on overload (HTTP 429) across the remaining
//! candidates before giving up.

mod body;
mod connect;
mod headers;
mod pool;
mod response;

pub use body::read_request_body;
pub use connect::splice;
pub use headers::{rewrite_proxy_headers, strip_hop_by_hop_response_headers};
pub use pool::{PooledSession, SessionPool};
pub use response::{read_full_response, BufferedResponse};

use fwdproxy_registry::{Registry, RegistrySnapshot};
use fwdproxy_selector::Selector;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone)]
pub struct ForwarderTuning {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub max_pool_per_key: usize,
    pub max_response_headers_bytes: usize,
    pub max_response_body_bytes: usize,
}

pub struct ForwardRequest<'a> {
    pub method: &'a str,
    pub request_line: &'a str,
    pub raw_headers: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub body: &'a [u8],
    pub client_ip: &'a str,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The upstream's response (successful or not) was written to the client.
    Delivered { status_code: Option<u16> },
    /// Every candidate upstream returned 429 before one succeeded.
    Overloaded,
    /// No Available upstream existed to try.
    NoUpstream,
    /// Every candidate failed at the transport level (connect/read errors).
    UpstreamError,
}

pub struct Forwarder {
    registry: Arc<Registry>,
    selector: Selector,
    pool: SessionPool,
    tuning: ForwarderTuning,
}

impl Forwarder {
    pub fn new(registry: Arc<Registry>, selector: Selector, tuning: ForwarderTuning) -> Self {
        Forwarder {
            registry,
            selector,
            pool: SessionPool::new(),
            tuning,
        }
    }

    pub async fn forward_http<C>(&self, client: &mut C, req: &ForwardRequest<'_>) -> anyhow::Result<ForwardOutcome>
    where
        C: AsyncWrite + Unpin,
    {
        let target = format!("{}:{}", req.host, req.port);
        let candidates = self.selector.choose_order(&self.registry.snapshot_available());
        if candidates.is_empty() {
            return Ok(ForwardOutcome::NoUpstream);
        }

        let rewritten = rewrite_proxy_headers(req.raw_headers, req.client_ip, true, req.body.len(), false);
        let mut wire = Vec::with_capacity(req.request_line.len() + rewritten.len() + req.body.len() + 4);
        wire.extend_from_slice(req.request_line.as_bytes());
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(rewritten.as_bytes());
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(req.body);

        // Only a 429 opens the overload-retry loop (spec: "retries occur
        // only on 429"). A transport error on the first attempt is fatal
        // for this request — no failover — so Failover scenarios actually
        // exercise `max_retries` instead of silently succeeding on B.
        let mut saw_overload = false;
        let mut in_retry_loop = false;

        for upstream in &candidates {
            let upstream_key = upstream.key();
            let mut session = match self
                .pool
                .checkout(&upstream_key, &target, self.tuning.connect_timeout, self.tuning.pool_idle_timeout)
                .await
            {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(target: "fwdproxy::forwarder", upstream = %upstream_key, error = %err, "failed to obtain upstream session");
                    self.registry.mark_failure(&upstream_key);
                    if !in_retry_loop {
                        return Ok(ForwardOutcome::UpstreamError);
                    }
                    continue;
                }
            };

            if let Err(err) = tokio::io::AsyncWriteExt::write_all(&mut session.stream, &wire).await {
                tracing::warn!(target: "fwdproxy::forwarder", upstream = %upstream_key, error = %err, "failed to write request to upstream");
                self.registry.mark_failure(&upstream_key);
                if !in_retry_loop {
                    return Ok(ForwardOutcome::UpstreamError);
                }
                continue;
            }

            let response = match read_full_response(
                &mut session,
                req.method,
                self.tuning.read_timeout,
                self.tuning.max_response_headers_bytes,
                self.tuning.max_response_body_bytes,
            )
            .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    tracing::warn!(target: "fwdproxy::forwarder", upstream = %upstream_key, error = %err, "failed to read upstream response");
                    self.registry.mark_failure(&upstream_key);
                    if !in_retry_loop {
                        return Ok(ForwardOutcome::UpstreamError);
                    }
                    continue;
                }
            };

            if response.status_code == Some(429) {
                saw_overload = true;
                in_retry_loop = true;
                tracing::info!(target: "fwdproxy::forwarder", upstream = %upstream_key, "upstream reports overload, retrying next candidate");
                self.registry.mark_overloaded(&upstream_key);
                continue;
            }

            self.registry.mark_success(&upstream_key);
            if response.reusable {
                self.pool.checkin(&upstream_key, &target, session, self.tuning.max_pool_per_key);
            }

            let status_line = response
                .header_text
                .lines()
                .next()
                .unwrap_or("HTTP/1.1 502 Bad Gateway");
            let filtered_headers = strip_hop_by_hop_response_headers(&response.header_text);

            let mut out = Vec::with_capacity(status_line.len() + response.body.len() + 64);
            out.extend_from_slice(status_line.as_bytes());
            out.extend_from_slice(b"\r\n");
            for (name, value) in &filtered_headers {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&response.body);

            client.write_all(&out).await?;
            client.flush().await?;
            return Ok(ForwardOutcome::Delivered { status_code: response.status_code });
        }

        if saw_overload {
            Ok(ForwardOutcome::Overloaded)
        } else {
            Ok(ForwardOutcome::UpstreamError)
        }
    }

    /// The stats reporter's entry point: a registry snapshot with
    /// `sessions_pooled` filled in from the forwarder's own session pool,
    /// which the registry has no visibility into on its own.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.set_sessions_pooled(&self.pool.counts_by_upstream());
        self.registry.snapshot()
    }

    pub async fn forward_connect<C>(&self, client: &mut C, host: &str, port: u16) -> anyhow::Result<ForwardOutcome>
    where
        C: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        let target = format!("{host}:{port}");
        let candidates = self.selector.choose_order(&self.registry.snapshot_available());
        if candidates.is_empty() {
            return Ok(ForwardOutcome::NoUpstream);
        }

        for upstream in &candidates {
            let upstream_key = upstream.key();
            match pool::connect_fresh(&upstream_key, &target, self.tuning.connect_timeout).await {
                Ok(mut session) => {
                    fwdproxy_http::send_connect_established(client).await?;
                    // The 200 line is already on the wire, so a mid-tunnel
                    // error can't be turned into a 502 — just tear down.
                    match connect::splice(client, &mut session).await {
                        Ok(_) => self.registry.mark_success(&upstream_key),
                        Err(err) => {
                            tracing::warn!(target: "fwdproxy::forwarder", upstream = %upstream_key, error = %err, "CONNECT tunnel ended with error");
                            self.registry.mark_failure(&upstream_key);
                        }
                    }
                    return Ok(ForwardOutcome::Delivered { status_code: Some(200) });
                }
                Err(err) => {
                    tracing::warn!(target: "fwdproxy::forwarder", upstream = %upstream_key, error = %err, "CONNECT dial failed");
                    self.registry.mark_failure(&upstream_key);
                    continue;
                }
            }
        }

        Ok(ForwardOutcome::UpstreamError)
    }
}
