use serde::Deserialize;

/// One configured SOCKS5 upstream proxy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Hash)]
pub struct UpstreamEntry {
    pub host: String,
    pub port: u16,
}

impl UpstreamEntry {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for UpstreamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
