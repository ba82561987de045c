use serde::Deserialize;

/// Selection policy over the registry's available set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Random,
    RoundRobin,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Random
    }
}
