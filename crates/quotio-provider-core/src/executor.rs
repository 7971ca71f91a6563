use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::credential::StoredCredential;
use crate::errors::ExecuteError;

pub type ChunkResult = Result<Bytes, ExecuteError>;
pub type ChunkStream = mpsc::Receiver<ChunkResult>;

/// One request as seen by an executor: a target model plus the original body
/// bytes. Translation between dialects happens elsewhere; the payload is
/// opaque here.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub model: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
}

impl ExecuteRequest {
    pub fn new(model: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            model: model.into(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub stream: bool,
    /// Streaming response encoding hint (gemini's `$alt=sse`).
    pub alt: Option<String>,
    pub source_format: Option<String>,
    pub original_request: Option<Bytes>,
}

/// A generic outbound request being prepared for a pass-through route.
#[derive(Debug, Clone)]
pub struct HttpRequestParts {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Clients append a thinking-budget suffix to the model they dial, e.g.
/// `claude-sonnet-4(8k)`. Upstream only knows the bare name.
pub fn base_model_name(model: &str) -> &str {
    match model.find('(') {
        Some(open) if model.ends_with(')') => model[..open].trim_end(),
        _ => model,
    }
}

/// Per-provider adapter performing one request against one credential.
///
/// Executors hold no shared mutable state; concurrency control and failure
/// accounting are the pool's job.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    /// Lower-case provider tag, stable across the process lifetime.
    fn identifier(&self) -> &'static str;

    /// One non-streaming request. Errors carry an HTTP-like status and any
    /// upstream `retry-after` header.
    async fn execute(
        &self,
        auth: &StoredCredential,
        req: &ExecuteRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError>;

    /// One streaming request. The first chunk bearing an error marks the
    /// attempt failed; a clean channel close marks it succeeded.
    async fn execute_stream(
        &self,
        auth: &StoredCredential,
        req: &ExecuteRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError>;

    /// Best-effort token refresh. On failure the credential comes back with
    /// `status = Error` and a message; this never returns an error.
    async fn refresh(&self, auth: StoredCredential) -> StoredCredential;

    async fn count_tokens(
        &self,
        _auth: &StoredCredential,
        _req: &ExecuteRequest,
        _opts: &ExecuteOptions,
        _cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        Err(ExecuteError::unsupported("count_tokens"))
    }

    /// Attach auth headers to a pass-through request.
    fn prepare_request(
        &self,
        _auth: &StoredCredential,
        _req: &mut HttpRequestParts,
    ) -> Result<(), ExecuteError> {
        Err(ExecuteError::unsupported("prepare_request"))
    }
}
