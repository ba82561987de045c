use crate::UpstreamAddr;
use std::time::Instant;

/// Which of the three disjoint sets an upstream currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Available,
    Unavailable,
    Resting,
}

/// Everything the registry tracks about one upstream.
#[derive(Debug, Clone)]
pub struct UpstreamRecord {
    pub addr: UpstreamAddr,
    pub state: UpstreamState,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub overload_count: u32,
    pub rest_until: Option<Instant>,
    /// Idle pooled sessions currently held open to this upstream, across
    /// all destination targets. Maintained by the forwarder's pool
    /// checkout/checkin, not by the registry itself.
    pub sessions_pooled: u32,
}

impl UpstreamRecord {
    pub fn new(addr: UpstreamAddr) -> Self {
        UpstreamRecord {
            addr,
            state: UpstreamState::Available,
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            overload_count: 0,
            rest_until: None,
            sessions_pooled: 0,
        }
    }
}
