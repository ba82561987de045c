//! Hop-by-hop header filtering and `X-Forwarded-*` rewriting, applied to
//! the request on the way out and (symmetrically, for hop-by-hop only) to
//! the response on the way back.

use std::collections::HashSet;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

/// Hop-by-hop headers to strip from an upstream response. Unlike the
/// request side, the response body is forwarded exactly as it arrived on
/// the wire (chunked framing included), so `transfer-encoding` stays —
/// removing it while leaving a chunk-encoded body would desync the client.
const RESPONSE_HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

fn split_header_tokens(value: &str) -> impl Iterator<Item = String> + '_ {
    value.split(',').filter_map(|token| {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(
                trimmed
                    .trim_matches(|c| c == '"' || c == '\'')
                    .to_ascii_lowercase(),
            )
        }
    })
}

fn collect_connection_tokens(req_headers: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for line in req_headers.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("connection") {
            continue;
        }
        tokens.extend(split_header_tokens(value));
    }
    tokens
}

/// Rewrite a client request's header block before forwarding it to the
/// selected upstream: strips hop-by-hop headers and any headers named by
/// the client's own `Connection:` token list, strips pre-existing
/// `X-Forwarded-*`/`X-Real-IP`, and appends fresh forwarding headers plus
/// this hop's own `Connection`/body-framing headers.
pub fn rewrite_proxy_headers(
    req_headers: &str,
    client_ip: &str,
    keep_alive: bool,
    body_len: usize,
    is_chunked: bool,
) -> String {
    let connection_tokens = collect_connection_tokens(req_headers);
    let mut lines = req_headers.lines();
    let _ = lines.next(); // request line

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut host_value: Option<String> = None;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name_trim = name.trim().to_string();
        let value_trim = value.trim().to_string();
        let name_lower = name_trim.to_ascii_lowercase();

        if name_trim.eq_ignore_ascii_case("host") {
            host_value = Some(value_trim.clone());
        }

        if matches!(
            name_lower.as_str(),
            "x-forwarded-for" | "x-real-ip" | "x-forwarded-proto" | "x-forwarded-host"
        ) {
            continue;
        }

        if HOP_BY_HOP.contains(&name_lower.as_str()) || name_lower == "content-length" {
            continue;
        }

        if connection_tokens.contains(&name_lower) {
            continue;
        }

        headers.push((name_trim, value_trim));
    }

    headers.push(("X-Forwarded-For".to_string(), client_ip.to_string()));
    headers.push(("X-Real-IP".to_string(), client_ip.to_string()));
    headers.push(("X-Forwarded-Proto".to_string(), "http".to_string()));
    if let Some(h) = host_value {
        headers.push(("X-Forwarded-Host".to_string(), h));
    }

    let connection_value = if keep_alive { "keep-alive" } else { "close" };
    headers.push(("Connection".to_string(), connection_value.to_string()));

    if is_chunked {
        headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
    } else {
        headers.push(("Content-Length".to_string(), body_len.to_string()));
    }

    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(&name);
        out.push_str(": ");
        out.push_str(&value);
        out.push_str("\r\n");
    }
    out
}

/// Strip hop-by-hop headers from an upstream response header block before
/// it is rewritten onto the wire to the client (the status line is left
/// untouched and passed through separately).
pub fn strip_hop_by_hop_response_headers(resp_headers: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in resp_headers.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name_lower = name.trim().to_ascii_lowercase();
        if RESPONSE_HOP_BY_HOP.contains(&name_lower.as_str()) {
            continue;
        }
        out.push((name.trim().to_string(), value.trim().to_string()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{rewrite_proxy_headers, strip_hop_by_hop_response_headers};

    #[test]
    fn strip_hop_by_hop_response_headers_keeps_transfer_encoding() {
        let resp = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\nX-Test: ok\r\n\r\n";
        let out = strip_hop_by_hop_response_headers(resp);
        assert!(out.iter().any(|(n, v)| n == "Transfer-Encoding" && v == "chunked"));
        assert!(!out.iter().any(|(n, _)| n.eq_ignore_ascii_case("connection")));
        assert!(out.iter().any(|(n, v)| n == "X-Test" && v == "ok"));
    }

    #[test]
    fn rewrite_proxy_headers_drops_connection_token_headers() {
        let req = "GET http://example/ HTTP/1.1\r\nHost: example\r\nConnection: \"Foo\", keep-alive\r\nFoo: bar\r\nX-Test: ok\r\n\r\n";
        let out = rewrite_proxy_headers(req, "127.0.0.1", true, 0, false);
        assert!(!out.contains("\r\nFoo:"));
        assert!(out.contains("\r\nX-Test: ok\r\n"));
        assert!(out.contains("\r\nConnection: keep-alive\r\n"));
    }

    #[test]
    fn rewrite_proxy_headers_sets_chunked_without_content_length() {
        let req = "POST http://example/upload HTTP/1.1\r\nHost: example\r\nTransfer-Encoding: chunked\r\nContent-Length: 10\r\n\r\n";
        let out = rewrite_proxy_headers(req, "127.0.0.1", true, 10, true);
        assert!(out.contains("\r\nTransfer-Encoding: chunked\r\n"));
        assert!(!out.contains("\r\nContent-Length: 10\r\n"));
    }

    #[test]
    fn rewrite_proxy_headers_strips_stale_forwarded_headers() {
        let req = "GET http://example/ HTTP/1.1\r\nHost: example\r\nX-Forwarded-For: 1.2.3.4\r\n\r\n";
        let out = rewrite_proxy_headers(req, "9.9.9.9", false, 0, false);
        assert_eq!(out.matches("X-Forwarded-For").count(), 1);
        assert!(out.contains("X-Forwarded-For: 9.9.9.9"));
    }
}
