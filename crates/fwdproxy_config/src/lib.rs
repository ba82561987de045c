mod algorithm;
mod global;
mod server;
mod upstream;
mod validation;

pub use algorithm::Algorithm;
pub use global::GlobalConfig;
pub use server::ServerConfig;
pub use upstream::UpstreamEntry;
pub use validation::ConfigReport;

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("configuration has {0} error(s), see report for details")]
    Invalid(usize),
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_overload_backoff_base_secs() -> u64 {
    30
}

fn default_client_read_timeout_secs() -> u64 {
    15
}

fn default_keepalive_timeout_secs() -> u64 {
    65
}

fn default_max_request_headers_bytes() -> usize {
    64 * 1024
}

fn default_max_request_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

/// Top-level forward-proxy configuration document.
///
/// Loaded from a JSON file; any field omitted from the file falls back to
/// the default named alongside it below.
#[derive(Debug, Clone, Deserialize)]
pub struct FwdProxyConfig {
    pub server: ServerConfig,

    #[serde(default)]
    pub proxies: Vec<UpstreamEntry>,

    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub load_balancing_algorithm: Algorithm,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Cadence of the resting-eligibility sweep. `None` means "derive from
    /// `health_check_interval`" (see [`FwdProxyConfig::apply_defaults`]).
    #[serde(default)]
    pub rest_check_interval: Option<u64>,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_overload_backoff_base_secs")]
    pub overload_backoff_base_secs: u64,

    /// Optional hard cap on the exponential overload delay (§9 decision:
    /// caps, does not replace, the `base * 2^(overload_count - 1)` formula).
    #[serde(default)]
    pub proxy_rest_duration: Option<u64>,

    #[serde(default)]
    pub probe_target: Option<String>,

    #[serde(default = "default_client_read_timeout_secs")]
    pub client_read_timeout_secs: u64,

    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,

    #[serde(default = "default_max_request_headers_bytes")]
    pub max_request_headers_bytes: usize,

    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for FwdProxyConfig {
    fn default() -> Self {
        let mut cfg = FwdProxyConfig {
            server: ServerConfig::default(),
            proxies: Vec::new(),
            global: GlobalConfig::default(),
            load_balancing_algorithm: Algorithm::default(),
            health_check_interval: default_health_check_interval(),
            rest_check_interval: None,
            connection_timeout: default_connection_timeout(),
            max_retries: default_max_retries(),
            overload_backoff_base_secs: default_overload_backoff_base_secs(),
            proxy_rest_duration: None,
            probe_target: None,
            client_read_timeout_secs: default_client_read_timeout_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            max_request_headers_bytes: default_max_request_headers_bytes(),
            max_request_body_bytes: default_max_request_body_bytes(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        };
        cfg.apply_defaults();
        cfg
    }
}

impl FwdProxyConfig {
    /// Back-fill values that have no static `serde(default)` because they
    /// are derived from another field, mirroring the zero-fill pass the
    /// config layer has always used after deserialization.
    pub fn apply_defaults(&mut self) {
        if self.rest_check_interval.is_none() {
            self.rest_check_interval = Some(std::cmp::max(5, self.health_check_interval / 6));
        }
    }

    /// Load configuration from a JSON file. A missing file is not an
    /// error: the returned config falls back to built-in defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let builder = config::Config::builder().add_source(
            config::File::new(&path.to_string_lossy(), config::FileFormat::Json).required(false),
        );
        let raw = builder.build()?;
        let mut cfg: FwdProxyConfig = raw.try_deserialize().unwrap_or_default();
        cfg.apply_defaults();
        Ok(cfg)
    }

    /// Load from file, falling back to a warning and built-in defaults on
    /// any failure rather than aborting startup.
    pub fn from_file_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("failed to load configuration, using defaults: {err}");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> ConfigReport {
        validation::validate(self)
    }

    pub fn rest_check_interval(&self) -> u64 {
        self.rest_check_interval
            .unwrap_or_else(|| std::cmp::max(5, self.health_check_interval / 6))
    }

    pub fn print(&self) {
        println!("global:");
        println!("  worker_connections = {}", self.global.worker_connections);
        println!("  log_level          = {}", self.global.log_level);
        println!("server:");
        println!("  listen = {}:{}", self.server.host, self.server.port);
        println!("proxies ({}):", self.proxies.len());
        for p in &self.proxies {
            println!("  - {}:{}", p.host, p.port);
        }
        println!("load_balancing_algorithm = {:?}", self.load_balancing_algorithm);
        println!("health_check_interval    = {}s", self.health_check_interval);
        println!("rest_check_interval      = {}s", self.rest_check_interval());
        println!("connection_timeout       = {}s", self.connection_timeout);
        println!("max_retries              = {}", self.max_retries);
        println!(
            "overload_backoff_base_secs = {}s",
            self.overload_backoff_base_secs
        );
    }
}
