use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8317;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_MAX_RETRY_WAIT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// How the pool rotates credentials inside a priority bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    FillFirst,
}

impl RotationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStrategy::RoundRobin => "round-robin",
            RotationStrategy::FillFirst => "fill-first",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" => Some(RotationStrategy::RoundRobin),
            "fill-first" | "fill_first" => Some(RotationStrategy::FillFirst),
            _ => None,
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Root of the on-disk configuration (credential store, fallback config).
    pub data_dir: String,
    /// Inbound API keys; empty list means open access on localhost.
    pub api_keys: Vec<String>,
    /// Extra full-attempt rounds after the first one.
    pub retry_count: u32,
    /// Upper bound on the inter-round cooldown sleep.
    pub max_retry_wait_ms: u64,
    pub strategy: RotationStrategy,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<String>,
    pub api_keys: Option<Vec<String>>,
    pub retry_count: Option<u32>,
    pub max_retry_wait_ms: Option<u64>,
    pub strategy: Option<RotationStrategy>,
    pub proxy: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.api_keys.is_some() {
            self.api_keys = other.api_keys;
        }
        if other.retry_count.is_some() {
            self.retry_count = other.retry_count;
        }
        if other.max_retry_wait_ms.is_some() {
            self.max_retry_wait_ms = other.max_retry_wait_ms;
        }
        if other.strategy.is_some() {
            self.strategy = other.strategy;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            data_dir: self
                .data_dir
                .ok_or(GlobalConfigError::MissingField("data_dir"))?,
            api_keys: self.api_keys.unwrap_or_default(),
            retry_count: self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            max_retry_wait_ms: self.max_retry_wait_ms.unwrap_or(DEFAULT_MAX_RETRY_WAIT_MS),
            strategy: self.strategy.unwrap_or_default(),
            proxy: self.proxy,
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            data_dir: Some(value.data_dir),
            api_keys: Some(value.api_keys),
            retry_count: Some(value.retry_count),
            max_retry_wait_ms: Some(value.max_retry_wait_ms),
            strategy: Some(value.strategy),
            proxy: value.proxy,
        }
    }
}
