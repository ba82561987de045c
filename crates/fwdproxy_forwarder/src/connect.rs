//! CONNECT tunneling: once the upstream SOCKS5 session has dialed the
//! requested origin, bytes are spliced verbatim in both directions. No
//! HTTP framing applies past the `200 Connection Established` line, so
//! this is plain byte copying rather than anything response.rs owns.

use crate::pool::PooledSession;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};

/// Splice `client` and the upstream SOCKS5 stream until either side closes
/// or errors. Returns the byte counts copied in each direction.
pub async fn splice<C>(client: &mut C, upstream: &mut PooledSession) -> anyhow::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    if !upstream.read_buf.is_empty() {
        anyhow::bail!("upstream had buffered bytes before CONNECT splice started");
    }
    let (from_client, from_upstream) = copy_bidirectional(client, &mut upstream.stream).await?;
    Ok((from_client, from_upstream))
}
