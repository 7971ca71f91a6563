//! Concrete provider executors.
//!
//! Each executor turns the pool's opaque `(model, payload)` pair into one
//! upstream HTTP call and maps the provider's error and rate-limit signals
//! back into `ExecuteError`. All executors share one `UpstreamClient`.

pub mod anthropic;
pub mod client;
pub mod codex;
pub mod custom;
pub mod gemini;
mod headers;
mod stream;

use std::sync::Arc;

use quotio_provider_core::ExecutorRegistry;

pub use anthropic::AnthropicExecutor;
pub use client::{UpstreamClient, UpstreamClientConfig, UpstreamResponse};
pub use codex::CodexExecutor;
pub use custom::CustomExecutor;
pub use gemini::GeminiExecutor;

/// Registry with every built-in provider wired to the shared client.
pub fn default_registry(client: Arc<UpstreamClient>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(AnthropicExecutor::new(client.clone())));
    registry.register(Arc::new(GeminiExecutor::new(client.clone())));
    registry.register(Arc::new(CodexExecutor::new(client.clone())));
    registry.register(Arc::new(CustomExecutor::new(client)));
    registry
}
