//! Reads a client request body into memory, bounded by the configured
//! max-body limit, so the overload retry loop can resend the same body to
//! a different upstream without asking the client to resend it.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Duration};

pub async fn read_request_body<R>(
    client: &mut R,
    leftover: &mut BytesMut,
    content_length: Option<usize>,
    is_chunked: bool,
    read_timeout: Duration,
    max_body: usize,
) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if is_chunked {
        return read_chunked(client, leftover, read_timeout, max_body).await;
    }

    let Some(len) = content_length else {
        return Ok(Vec::new());
    };
    if max_body > 0 && len > max_body {
        anyhow::bail!("client request body too large");
    }
    read_content_length(client, leftover, len, read_timeout).await
}

async fn fill(client: &mut (impl AsyncRead + Unpin), leftover: &mut BytesMut, read_timeout: Duration) -> anyhow::Result<usize> {
    let mut tmp = [0u8; 8192];
    let n = match timeout(read_timeout, client.read(&mut tmp)).await {
        Ok(res) => res?,
        Err(_) => anyhow::bail!("client read timeout"),
    };
    if n > 0 {
        leftover.extend_from_slice(&tmp[..n]);
    }
    Ok(n)
}

async fn read_content_length(
    client: &mut (impl AsyncRead + Unpin),
    leftover: &mut BytesMut,
    mut remaining: usize,
    read_timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(remaining);
    while remaining > 0 {
        if leftover.is_empty() {
            let n = fill(client, leftover, read_timeout).await?;
            if n == 0 {
                anyhow::bail!("client closed connection while sending request body");
            }
        }
        let take = remaining.min(leftover.len());
        let chunk = leftover.split_to(take);
        out.extend_from_slice(&chunk);
        remaining -= take;
    }
    Ok(out)
}

async fn read_line(client: &mut (impl AsyncRead + Unpin), leftover: &mut BytesMut, read_timeout: Duration) -> anyhow::Result<Vec<u8>> {
    loop {
        if let Some(pos) = leftover.windows(2).position(|w| w == b"\r\n") {
            let line = leftover.split_to(pos + 2);
            return Ok(line.to_vec());
        }
        let n = fill(client, leftover, read_timeout).await?;
        if n == 0 {
            anyhow::bail!("client closed connection while sending chunked body");
        }
    }
}

async fn read_chunked(
    client: &mut (impl AsyncRead + Unpin),
    leftover: &mut BytesMut,
    read_timeout: Duration,
    max_body: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut total = 0usize;

    loop {
        let size_line = read_line(client, leftover, read_timeout).await?;
        let size_str = String::from_utf8_lossy(&size_line);
        let size_str = size_str.trim().split(';').next().unwrap_or("").trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .map_err(|_| anyhow::anyhow!("invalid chunk size in client request body"))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_line(client, leftover, read_timeout).await?;
                if trailer == b"\r\n" {
                    return Ok(out);
                }
            }
        }

        total += chunk_size;
        if max_body > 0 && total > max_body {
            anyhow::bail!("client request body too large");
        }

        while leftover.len() < chunk_size + 2 {
            let n = fill(client, leftover, read_timeout).await?;
            if n == 0 {
                anyhow::bail!("client closed connection while sending chunked body");
            }
        }
        let chunk = leftover.split_to(chunk_size);
        out.extend_from_slice(&chunk);
        let _crlf = leftover.split_to(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_content_length_body_exactly() {
        let mut client = Cursor::new(b"hello world".to_vec());
        let mut leftover = BytesMut::new();
        let body = read_request_body(&mut client, &mut leftover, Some(11), false, Duration::from_secs(5), 0)
            .await
            .unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn reads_chunked_body_and_stops_at_terminator() {
        let mut client = Cursor::new(b"5\r\nhello\r\n0\r\n\r\n".to_vec());
        let mut leftover = BytesMut::new();
        let body = read_request_body(&mut client, &mut leftover, None, true, Duration::from_secs(5), 0)
            .await
            .unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn rejects_body_over_max_size() {
        let mut client = Cursor::new(b"hello world".to_vec());
        let mut leftover = BytesMut::new();
        let err = read_request_body(&mut client, &mut leftover, Some(11), false, Duration::from_secs(5), 4)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
