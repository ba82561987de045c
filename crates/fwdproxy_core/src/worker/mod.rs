//! Per-connection HTTP/1.1 handler: reads client requests and dispatches
//! each one to the forwarder, respecting keep-alive and the configured
//! idle timeouts.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use fwdproxy_config::FwdProxyConfig;
use fwdproxy_forwarder::{read_request_body, ForwardOutcome, ForwardRequest, Forwarder};
use fwdproxy_http::{send_400, send_413, send_429, send_502, send_503};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use tracing::{debug, info, warn};

mod request;
mod target;
mod timeouts;

use request::read_http_request;
use target::{parse_connect_authority, resolve_target};

pub async fn handle_connection<S>(
    mut stream: S,
    client_addr: SocketAddr,
    cfg: Arc<FwdProxyConfig>,
    forwarder: Arc<Forwarder>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    info!(target: "fwdproxy::core", %client_addr, "handling new client connection");

    let mut buf = BytesMut::new();
    let mut first_request = true;
    let client_ip = client_addr.ip().to_string();

    loop {
        let idle_timeout = if first_request {
            Duration::from_secs(cfg.client_read_timeout_secs)
        } else {
            Duration::from_secs(cfg.keepalive_timeout_secs)
        };

        let req = match read_http_request(&mut stream, &mut buf, &cfg, idle_timeout).await? {
            Some(req) => req,
            None => break,
        };

        if req.headers.is_empty() {
            debug!(target: "fwdproxy::core", "empty request line; closing connection");
            break;
        }

        debug!(target: "fwdproxy::core", method = %req.method, target = %req.path, "parsed request line");

        if req.body_start > 0 {
            buf.advance(req.body_start);
        }

        if req.method.eq_ignore_ascii_case("CONNECT") {
            let Some((host, port)) = parse_connect_authority(&req.path) else {
                send_400(&mut stream).await?;
                break;
            };

            match forwarder.forward_connect(&mut stream, &host, port).await {
                Ok(ForwardOutcome::Delivered { .. }) => {}
                Ok(ForwardOutcome::NoUpstream) => send_503(&mut stream).await?,
                _ => send_502(&mut stream).await?,
            }
            // The tunnel either consumed the connection or the attempt
            // failed outright; either way there is nothing left to pipeline.
            break;
        }

        let Some((host, port, origin_path)) = resolve_target(&req) else {
            send_400(&mut stream).await?;
            break;
        };

        let body = match read_request_body(
            &mut stream,
            &mut buf,
            if req.is_chunked { None } else { Some(req.content_length) },
            req.is_chunked,
            Duration::from_secs(cfg.client_read_timeout_secs),
            cfg.max_request_body_bytes,
        )
        .await
        {
            Ok(body) => body,
            Err(err) => {
                warn!(target: "fwdproxy::core", error = %err, "failed to read request body");
                send_413(&mut stream).await?;
                break;
            }
        };

        let request_line = format!("{} {} {}", req.method, origin_path, req.http_version);
        let fwd_req = ForwardRequest {
            method: &req.method,
            request_line: &request_line,
            raw_headers: &req.headers,
            host: &host,
            port,
            body: &body,
            client_ip: &client_ip,
        };

        let outcome = forwarder.forward_http(&mut stream, &fwd_req).await;
        let delivered = match outcome {
            Ok(ForwardOutcome::Delivered { status_code }) => {
                debug!(target: "fwdproxy::core", ?status_code, "response delivered to client");
                true
            }
            Ok(ForwardOutcome::Overloaded) => {
                send_429(&mut stream).await?;
                false
            }
            Ok(ForwardOutcome::NoUpstream) => {
                send_503(&mut stream).await?;
                false
            }
            Ok(ForwardOutcome::UpstreamError) => {
                send_502(&mut stream).await?;
                false
            }
            Err(err) => {
                warn!(target: "fwdproxy::core", error = %err, "forwarding error");
                send_502(&mut stream).await?;
                false
            }
        };

        // Every non-delivered outcome above is sent via the fixed
        // `Connection: close` error responses, so the connection must end
        // here regardless of the client's own keep-alive preference.
        if !delivered || req.close_after {
            break;
        }

        first_request = false;
    }

    info!(target: "fwdproxy::core", %client_addr, "connection closed");
    Ok(())
}
