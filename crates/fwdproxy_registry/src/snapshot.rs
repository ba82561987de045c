use crate::record::{UpstreamRecord, UpstreamState};
use serde::Serialize;

/// Observability view of one upstream, consumed by the external stats
/// reporter.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStat {
    pub host: String,
    pub port: u16,
    pub state: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub overload_count: u32,
    pub sessions_pooled: u32,
    pub resting_secs_remaining: Option<u64>,
}

impl From<&UpstreamRecord> for UpstreamStat {
    fn from(r: &UpstreamRecord) -> Self {
        let resting_secs_remaining = match (r.state, r.rest_until) {
            (UpstreamState::Resting, Some(until)) => {
                Some(until.saturating_duration_since(std::time::Instant::now()).as_secs())
            }
            _ => None,
        };
        UpstreamStat {
            host: r.addr.host.clone(),
            port: r.addr.port,
            state: match r.state {
                UpstreamState::Available => "available",
                UpstreamState::Unavailable => "unavailable",
                UpstreamState::Resting => "resting",
            }
            .to_string(),
            requests: r.request_count,
            successes: r.success_count,
            failures: r.failure_count,
            consecutive_failures: r.consecutive_failures,
            overload_count: r.overload_count,
            sessions_pooled: r.sessions_pooled,
            resting_secs_remaining,
        }
    }
}

/// Aggregate registry snapshot exposed to the external stats reporter.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub upstreams: Vec<UpstreamStat>,
    pub total_requests: u64,
    pub overall_success_rate: f64,
    pub available_count: usize,
    pub unavailable_count: usize,
    pub resting_count: usize,
}
