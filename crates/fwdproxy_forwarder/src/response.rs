//! Parsing and buffering of upstream HTTP/1 responses.
//!
//! The overload retry loop (§4.4) needs to inspect a response's status
//! code *before* deciding whether the client ever sees it, so responses
//! are read fully into memory (bounded by the configured max-body limit)
//! rather than streamed straight through as the reverse-proxy layer this
//! is grounded on did — see DESIGN.md for the trade-off.

use crate::pool::PooledSession;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, Duration};

pub struct BufferedResponse {
    pub status_code: Option<u16>,
    /// The status line plus the upstream's header block, unfiltered —
    /// callers writing this to a client should run it through
    /// `strip_hop_by_hop_response_headers` first.
    pub header_text: String,
    /// Body bytes exactly as received on the wire (still chunk-framed if
    /// the upstream sent `Transfer-Encoding: chunked`).
    pub body: Vec<u8>,
    pub reusable: bool,
}

pub async fn read_full_response(
    upstream: &mut PooledSession,
    method: &str,
    read_timeout: Duration,
    max_headers: usize,
    max_body: usize,
) -> anyhow::Result<BufferedResponse> {
    let headers_end = read_response_headers(upstream, read_timeout, max_headers).await?;
    let headers_bytes = upstream.read_buf.split_to(headers_end + 4);
    let header_len = headers_bytes.len().saturating_sub(4);

    let info = parse_response_headers(&headers_bytes[..header_len])?;
    let no_body = is_no_body(method, info.status_code);
    let header_text = String::from_utf8_lossy(&headers_bytes[..header_len]).into_owned();

    let mut body = Vec::new();

    let mut reusable = if info.is_http10 {
        info.connection_keep_alive && !info.connection_close
    } else {
        !info.connection_close
    };

    if no_body {
        return Ok(BufferedResponse {
            status_code: info.status_code,
            header_text,
            body,
            reusable,
        });
    }

    if info.is_chunked {
        read_chunked_body(upstream, &mut body, read_timeout, max_body).await?;
        return Ok(BufferedResponse {
            status_code: info.status_code,
            header_text,
            body,
            reusable,
        });
    }

    if let Some(cl) = info.content_length {
        if max_body > 0 && cl > max_body {
            anyhow::bail!("upstream response body too large");
        }
        let complete = read_content_length(upstream, &mut body, cl, read_timeout).await?;
        if !complete {
            reusable = false;
        }
        return Ok(BufferedResponse {
            status_code: info.status_code,
            header_text,
            body,
            reusable,
        });
    }

    read_until_eof(upstream, &mut body, read_timeout, max_body).await?;
    Ok(BufferedResponse {
        status_code: info.status_code,
        header_text,
        body,
        reusable: false,
    })
}

async fn read_response_headers(
    upstream: &mut PooledSession,
    read_timeout: Duration,
    max_headers: usize,
) -> anyhow::Result<usize> {
    loop {
        if let Some(pos) = find_headers_end(&upstream.read_buf) {
            return Ok(pos);
        }
        if max_headers > 0 && upstream.read_buf.len() > max_headers {
            anyhow::bail!("upstream response headers too large");
        }
        let n = read_more(upstream, read_timeout).await?;
        if n == 0 {
            anyhow::bail!("upstream closed connection while reading headers");
        }
    }
}

async fn read_more(upstream: &mut PooledSession, read_timeout: Duration) -> anyhow::Result<usize> {
    let mut tmp = [0u8; 8192];
    let n = match timeout(read_timeout, upstream.stream.read(&mut tmp)).await {
        Ok(res) => res?,
        Err(_) => anyhow::bail!("upstream read timeout"),
    };
    if n > 0 {
        upstream.read_buf.extend_from_slice(&tmp[..n]);
    }
    Ok(n)
}

fn find_headers_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug, Default)]
struct ResponseInfo {
    content_length: Option<usize>,
    connection_close: bool,
    connection_keep_alive: bool,
    is_http10: bool,
    is_chunked: bool,
    status_code: Option<u16>,
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

fn parse_response_headers(header_bytes: &[u8]) -> anyhow::Result<ResponseInfo> {
    let header_str = String::from_utf8_lossy(header_bytes);
    let mut info = ResponseInfo::default();
    let mut content_length = ContentLengthState::default();

    let mut lines = header_str.lines();
    if let Some(status_line) = lines.next() {
        if status_line.starts_with("HTTP/1.0") {
            info.is_http10 = true;
        }
        info.status_code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok());
    }

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name_lower = name.trim().to_ascii_lowercase();
        let value = value.trim();

        match name_lower.as_str() {
            "content-length" => content_length.add(value),
            "connection" => {
                for token in split_header_tokens(value) {
                    match token.as_str() {
                        "close" => info.connection_close = true,
                        "keep-alive" => info.connection_keep_alive = true,
                        _ => {}
                    }
                }
            }
            "transfer-encoding" => {
                for token in split_header_tokens(value) {
                    if token == "chunked" {
                        info.is_chunked = true;
                    }
                }
            }
            _ => {}
        }
    }

    if content_length.invalid {
        if content_length.conflict {
            anyhow::bail!("conflicting Content-Length in upstream response");
        }
        anyhow::bail!("invalid Content-Length in upstream response");
    }
    info.content_length = content_length.value;

    Ok(info)
}

fn is_no_body(method: &str, status_code: Option<u16>) -> bool {
    if method.eq_ignore_ascii_case("HEAD") {
        return true;
    }
    matches!(status_code, Some(100..=199) | Some(204) | Some(304))
}

async fn read_content_length(
    upstream: &mut PooledSession,
    out: &mut Vec<u8>,
    mut remaining: usize,
    read_timeout: Duration,
) -> anyhow::Result<bool> {
    while remaining > 0 {
        if upstream.read_buf.is_empty() {
            let n = read_more(upstream, read_timeout).await?;
            if n == 0 {
                return Ok(false);
            }
        }
        let take = remaining.min(upstream.read_buf.len());
        let chunk = upstream.read_buf.split_to(take);
        out.extend_from_slice(&chunk);
        remaining -= take;
    }
    Ok(true)
}

async fn read_until_eof(
    upstream: &mut PooledSession,
    out: &mut Vec<u8>,
    read_timeout: Duration,
    max_body: usize,
) -> anyhow::Result<()> {
    let mut body_bytes = 0usize;

    if !upstream.read_buf.is_empty() {
        body_bytes += upstream.read_buf.len();
        if max_body > 0 && body_bytes > max_body {
            anyhow::bail!("upstream response body too large");
        }
        let chunk = upstream.read_buf.split_to(upstream.read_buf.len());
        out.extend_from_slice(&chunk);
    }

    loop {
        let n = read_more(upstream, read_timeout).await?;
        if n == 0 {
            break;
        }
        body_bytes += n;
        if max_body > 0 && body_bytes > max_body {
            anyhow::bail!("upstream response body too large");
        }
        let chunk = upstream.read_buf.split_to(n);
        out.extend_from_slice(&chunk);
    }
    Ok(())
}

async fn read_chunked_body(
    upstream: &mut PooledSession,
    out: &mut Vec<u8>,
    read_timeout: Duration,
    max_body: usize,
) -> anyhow::Result<()> {
    let mut body_bytes = 0usize;

    loop {
        let line = read_line(upstream, read_timeout).await?;
        out.extend_from_slice(&line);

        let line_str = String::from_utf8_lossy(&line);
        let size_str = line_str.trim().trim_end_matches('\r').trim_end_matches('\n');
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let chunk_size =
            usize::from_str_radix(size_str, 16).map_err(|_| anyhow::anyhow!("invalid chunk size"))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_line(upstream, read_timeout).await?;
                out.extend_from_slice(&trailer);
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }

        if max_body > 0 && body_bytes + chunk_size > max_body {
            anyhow::bail!("upstream response body too large");
        }

        read_exact_into(upstream, out, read_timeout, chunk_size + 2).await?;
        body_bytes += chunk_size;
    }
}

async fn read_line(upstream: &mut PooledSession, read_timeout: Duration) -> anyhow::Result<Vec<u8>> {
    loop {
        if let Some(pos) = upstream.read_buf.windows(2).position(|w| w == b"\r\n") {
            let line = upstream.read_buf.split_to(pos + 2);
            return Ok(line.to_vec());
        }
        let n = read_more(upstream, read_timeout).await?;
        if n == 0 {
            anyhow::bail!("upstream closed connection while reading chunked line");
        }
    }
}

async fn read_exact_into(
    upstream: &mut PooledSession,
    out: &mut Vec<u8>,
    read_timeout: Duration,
    mut remaining: usize,
) -> anyhow::Result<()> {
    while remaining > 0 {
        if upstream.read_buf.is_empty() {
            let n = read_more(upstream, read_timeout).await?;
            if n == 0 {
                anyhow::bail!("upstream closed connection while reading chunked body");
            }
        }
        let take = remaining.min(upstream.read_buf.len());
        let chunk = upstream.read_buf.split_to(take);
        out.extend_from_slice(&chunk);
        remaining -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_response_headers;

    #[test]
    fn parse_response_headers_accepts_duplicate_content_length() {
        let headers = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n";
        let info = parse_response_headers(headers).expect("expected ok");
        assert_eq!(info.content_length, Some(5));
    }

    #[test]
    fn parse_response_headers_rejects_conflicting_content_length() {
        let headers = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        let err = parse_response_headers(headers).unwrap_err();
        assert!(err.to_string().contains("conflicting Content-Length"));
    }

    #[test]
    fn parse_response_headers_detects_429_status() {
        let headers = b"HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\n\r\n";
        let info = parse_response_headers(headers).expect("expected ok");
        assert_eq!(info.status_code, Some(429));
    }

    #[test]
    fn parse_response_headers_detects_chunked_and_connection_tokens() {
        let headers = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, \"chunked\"\r\nConnection: \"close\"\r\n\r\n";
        let info = parse_response_headers(headers).expect("expected ok");
        assert!(info.is_chunked);
        assert!(info.connection_close);
    }
}
