use serde::Deserialize;

fn default_worker_connections() -> u32 {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Ambient tunables that don't belong to any single component.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_worker_connections")]
    pub worker_connections: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            worker_connections: default_worker_connections(),
            log_level: default_log_level(),
        }
    }
}
