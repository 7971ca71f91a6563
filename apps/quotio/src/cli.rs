use clap::Parser;

use quotio_common::{GlobalConfigPatch, RotationStrategy};

#[derive(Parser)]
#[command(name = "quotio", about = "Local multi-provider proxy for AI coding assistants")]
pub(crate) struct Cli {
    #[arg(long, default_value = "127.0.0.1", env = "QUOTIO_HOST")]
    pub(crate) host: String,
    #[arg(long, default_value_t = quotio_common::DEFAULT_PORT, env = "QUOTIO_PORT")]
    pub(crate) port: u16,
    /// Configuration root; defaults to the OS config directory.
    #[arg(long, env = "QUOTIO_DATA_DIR")]
    pub(crate) data_dir: Option<String>,
    /// Inbound API key; repeat for multiple keys. Empty means open access.
    #[arg(long = "api-key", env = "QUOTIO_API_KEY")]
    pub(crate) api_keys: Vec<String>,
    #[arg(long, default_value_t = quotio_common::DEFAULT_RETRY_COUNT)]
    pub(crate) retry_count: u32,
    #[arg(long, default_value_t = quotio_common::DEFAULT_MAX_RETRY_WAIT_MS)]
    pub(crate) max_retry_wait_ms: u64,
    /// round-robin or fill-first.
    #[arg(long, default_value = "round-robin")]
    pub(crate) strategy: String,
    /// Outbound proxy for upstream egress.
    #[arg(long, env = "QUOTIO_PROXY")]
    pub(crate) proxy: Option<String>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> anyhow::Result<GlobalConfigPatch> {
        let strategy = RotationStrategy::parse(&self.strategy)
            .ok_or_else(|| anyhow::anyhow!("unknown strategy {:?}", self.strategy))?;
        Ok(GlobalConfigPatch {
            host: Some(self.host),
            port: Some(self.port),
            data_dir: self.data_dir,
            api_keys: Some(self.api_keys),
            retry_count: Some(self.retry_count),
            max_retry_wait_ms: Some(self.max_retry_wait_ms),
            strategy: Some(strategy),
            proxy: self.proxy,
        })
    }
}
