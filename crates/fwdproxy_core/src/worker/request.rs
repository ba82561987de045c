//! HTTP/1.1 request-line-and-header parsing for the forward-proxy case:
//! the request-target is either absolute-form (`GET http://host/path`),
//! authority-form (`CONNECT host:port`), or plain origin-form paired with
//! a `Host:` header, rather than the origin-form-only a reverse proxy
//! expects.

use bytes::BytesMut;
use fwdproxy_config::FwdProxyConfig;
use fwdproxy_http::{send_400, send_408, send_413, send_431};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use tracing::{debug, warn};

use super::timeouts::{read_more, ReadOutcome};

#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub(crate) headers: String,
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) http_version: String,
    pub(crate) content_length: usize,
    pub(crate) is_chunked: bool,
    pub(crate) close_after: bool,
    pub(crate) body_start: usize,
}

pub(crate) async fn read_http_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    cfg: &FwdProxyConfig,
    idle_timeout: Duration,
) -> anyhow::Result<Option<ParsedRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read_timeout = Duration::from_secs(cfg.client_read_timeout_secs);
    let max_headers = cfg.max_request_headers_bytes;
    let max_body = cfg.max_request_body_bytes;

    let headers_end = loop {
        if let Some(pos) = find_headers_end(buf) {
            break pos;
        }

        if max_headers > 0 && buf.len() > max_headers {
            send_431(stream).await?;
            return Ok(None);
        }

        let timeout_dur = if buf.is_empty() { idle_timeout } else { read_timeout };
        match read_more(stream, buf, timeout_dur).await? {
            ReadOutcome::Timeout => {
                if buf.is_empty() {
                    return Ok(None);
                }
                send_408(stream).await?;
                return Ok(None);
            }
            ReadOutcome::Read(0) => return Ok(None),
            ReadOutcome::Read(_) => {}
        }
    };

    let header_bytes = &buf[..headers_end];
    let headers_str = String::from_utf8_lossy(header_bytes).to_string();

    debug!(target: "fwdproxy::core", header_len = headers_str.len(), "parsed request headers");

    let meta = match parse_request_metadata(&headers_str) {
        Ok(meta) => meta,
        Err(err) => {
            warn!(target: "fwdproxy::core", error = ?err, "invalid request headers");
            send_400(stream).await?;
            return Ok(None);
        }
    };

    if !meta.is_chunked && meta.content_length > 0 && max_body > 0 && meta.content_length > max_body {
        send_413(stream).await?;
        return Ok(None);
    }

    Ok(Some(ParsedRequest {
        headers: headers_str,
        method: meta.method,
        path: meta.path,
        http_version: meta.http_version,
        content_length: meta.content_length,
        is_chunked: meta.is_chunked,
        close_after: meta.close_after,
        body_start: headers_end + 4,
    }))
}

fn find_headers_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug)]
struct RequestMetadata {
    method: String,
    path: String,
    http_version: String,
    content_length: usize,
    close_after: bool,
    is_chunked: bool,
}

#[derive(Debug)]
enum HeaderParseError {
    InvalidContentLength,
    ConflictingContentLength,
    InvalidTransferEncoding,
    TransferEncodingContentLength,
}

#[derive(Default)]
struct ContentLengthState {
    value: Option<usize>,
    invalid: bool,
    conflict: bool,
}

impl ContentLengthState {
    fn add(&mut self, raw: &str) {
        let mut any = false;
        for part in raw.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            any = true;
            match trimmed.parse::<usize>() {
                Ok(len) => {
                    if let Some(prev) = self.value {
                        if prev != len {
                            self.conflict = true;
                            self.invalid = true;
                        }
                    } else {
                        self.value = Some(len);
                    }
                }
                Err(_) => self.invalid = true,
            }
        }
        if !any {
            self.invalid = true;
        }
    }
}

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

fn parse_request_metadata(headers: &str) -> Result<RequestMetadata, HeaderParseError> {
    let mut lines = headers.lines();
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("-").to_string();
    let path = parts.next().unwrap_or("/").to_string();
    let http_version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut content_length = ContentLengthState::default();
    let mut connection_close = false;
    let mut connection_keep_alive = false;
    let mut is_chunked = false;
    let mut transfer_encoding_present = false;
    let mut transfer_encoding_invalid = false;
    let mut transfer_encoding_last: Option<String> = None;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let name_lower = name.trim().to_ascii_lowercase();

        match name_lower.as_str() {
            "content-length" => content_length.add(value),
            "connection" | "proxy-connection" => {
                for token in split_header_tokens(value) {
                    match token.as_str() {
                        "close" => connection_close = true,
                        "keep-alive" => connection_keep_alive = true,
                        _ => {}
                    }
                }
            }
            "transfer-encoding" => {
                transfer_encoding_present = true;
                let mut saw_token = false;
                for token in split_header_tokens(value) {
                    saw_token = true;
                    if token == "chunked" {
                        is_chunked = true;
                    }
                    transfer_encoding_last = Some(token);
                }
                if !saw_token {
                    transfer_encoding_invalid = true;
                }
            }
            _ => {}
        }
    }

    if content_length.invalid {
        return Err(if content_length.conflict {
            HeaderParseError::ConflictingContentLength
        } else {
            HeaderParseError::InvalidContentLength
        });
    }

    if transfer_encoding_present {
        if transfer_encoding_invalid || transfer_encoding_last.as_deref() != Some("chunked") {
            return Err(HeaderParseError::InvalidTransferEncoding);
        }
        if content_length.value.is_some() {
            return Err(HeaderParseError::TransferEncodingContentLength);
        }
    }

    let close_after = if http_version == "HTTP/1.0" {
        !connection_keep_alive || connection_close
    } else {
        connection_close
    };

    Ok(RequestMetadata {
        method,
        path,
        http_version,
        content_length: content_length.value.unwrap_or(0),
        close_after,
        is_chunked,
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_request_metadata, HeaderParseError};

    #[test]
    fn parse_request_metadata_accepts_absolute_form_target() {
        let headers = "GET http://example.com:8080/path HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let meta = parse_request_metadata(headers).expect("expected ok");
        assert_eq!(meta.path, "http://example.com:8080/path");
    }

    #[test]
    fn parse_request_metadata_accepts_connect_authority_form() {
        let headers = "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let meta = parse_request_metadata(headers).expect("expected ok");
        assert_eq!(meta.method, "CONNECT");
        assert_eq!(meta.path, "example.com:443");
    }

    #[test]
    fn parse_request_metadata_rejects_conflicting_content_length() {
        let headers = "POST http://example/upload HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        let err = parse_request_metadata(headers).unwrap_err();
        assert!(matches!(err, HeaderParseError::ConflictingContentLength));
    }

    #[test]
    fn parse_request_metadata_rejects_transfer_encoding_with_content_length() {
        let headers = "POST http://example/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 10\r\n\r\n";
        let err = parse_request_metadata(headers).unwrap_err();
        assert!(matches!(err, HeaderParseError::TransferEncodingContentLength));
    }

    #[test]
    fn parse_request_metadata_tracks_close_after() {
        let headers = "GET http://example/ HTTP/1.1\r\nConnection: close\r\n\r\n";
        let meta = parse_request_metadata(headers).expect("expected ok");
        assert!(meta.close_after);
    }
}
