use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use quotio_protocol::openai::{ChatEnvelope, ModelEntry, ModelList, rewrite_model};
use quotio_provider_core::{
    ChunkStream, CredentialPool, ExecuteOptions, ExecuteRequest, ExecutionResult,
    ExecutorRegistry, HttpRequestParts, PoolError, normalize_provider,
};
use quotio_provider_impl::{UpstreamClient, UpstreamResponse};
use quotio_storage::FallbackConfig;

use crate::error::ProxyError;

#[derive(Debug)]
pub enum DispatchOutcome {
    Body(Bytes),
    Stream(ChunkStream),
}

/// How a requested model maps onto the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Every fallback entry shares one model id, so a single pool call with
    /// mixed-provider rotation covers the whole chain.
    Mixed {
        providers: Vec<String>,
        model: String,
    },
    /// Heterogeneous model ids: one pool call per entry, in chain order.
    Legs(Vec<(String, String)>),
}

impl DispatchPlan {
    fn legs(self) -> Vec<(Vec<String>, String)> {
        match self {
            DispatchPlan::Mixed { providers, model } => vec![(providers, model)],
            DispatchPlan::Legs(entries) => entries
                .into_iter()
                .map(|(provider, model)| (vec![provider], model))
                .collect(),
        }
    }
}

/// Entry point invoked once per inbound request: resolves the model name,
/// walks the fallback chain, and maps pool failures to HTTP-shaped errors.
pub struct DispatchFacade {
    pool: Arc<CredentialPool>,
    registry: Arc<ExecutorRegistry>,
    client: Arc<UpstreamClient>,
    fallback: Arc<ArcSwap<FallbackConfig>>,
}

impl DispatchFacade {
    pub fn new(
        pool: Arc<CredentialPool>,
        registry: Arc<ExecutorRegistry>,
        client: Arc<UpstreamClient>,
        fallback: Arc<ArcSwap<FallbackConfig>>,
    ) -> Self {
        Self {
            pool,
            registry,
            client,
            fallback,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Map a requested model to its dispatch plan. Virtual models expand to
    /// their chains; anything else forwards as a one-leg chain against the
    /// provider its name implies, or all providers when ambiguous.
    pub fn resolve(&self, model: &str) -> DispatchPlan {
        let config = self.fallback.load();
        if let Some(vm) = config.resolve(model) {
            let entries = vm.ordered_entries();
            if let Some(first) = entries.first()
                && entries.iter().all(|entry| entry.model_id == first.model_id)
            {
                return DispatchPlan::Mixed {
                    providers: entries.iter().map(|entry| entry.provider.clone()).collect(),
                    model: first.model_id.clone(),
                };
            }
            return DispatchPlan::Legs(
                entries
                    .into_iter()
                    .map(|entry| (entry.provider, entry.model_id))
                    .collect(),
            );
        }

        let providers = match infer_provider(model) {
            Some(provider) if self.registry.get(&provider).is_some() => vec![provider],
            _ => self.registry.providers(),
        };
        DispatchPlan::Mixed {
            providers,
            model: model.to_string(),
        }
    }

    /// One OpenAI-compatible chat request, streaming or not.
    pub async fn dispatch_chat(
        &self,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, ProxyError> {
        let envelope = ChatEnvelope::from_slice(&payload).unwrap_or_default();
        if envelope.model.is_empty() {
            return Err(ProxyError::bad_request("missing model"));
        }
        let legs = self.resolve(&envelope.model).legs();
        if legs.is_empty() || legs.iter().all(|(providers, _)| providers.is_empty()) {
            return Err(ProxyError::no_provider());
        }
        info!(
            event = "dispatch",
            model = %envelope.model,
            stream = envelope.stream,
            legs = legs.len()
        );

        let mut last: Option<(PoolError, String)> = None;
        for (providers, model) in legs {
            let body = rewrite_model(&payload, &model)
                .map(Bytes::from)
                .unwrap_or_else(|| payload.clone());
            let request = ExecuteRequest::new(model.clone(), body);
            let opts = ExecuteOptions {
                stream: envelope.stream,
                ..Default::default()
            };
            let outcome = if envelope.stream {
                self.pool
                    .clone()
                    .execute_stream(&providers, &request, &opts, cancel)
                    .await
                    .map(DispatchOutcome::Stream)
            } else {
                self.pool
                    .execute(&providers, &request, &opts, cancel)
                    .await
                    .map(DispatchOutcome::Body)
            };
            match outcome {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let advance =
                        matches!(err, PoolError::ModelCooldown { .. }) || err.is_retryable();
                    debug!(
                        event = "dispatch_leg_failed",
                        model = %model,
                        error = %err,
                        advance
                    );
                    if advance {
                        last = Some((err, model));
                        continue;
                    }
                    return Err(ProxyError::from_pool(err, &model));
                }
            }
        }
        match last {
            Some((err, model)) => Err(ProxyError::from_pool(err, &model)),
            None => Err(ProxyError::no_provider()),
        }
    }

    /// Token counting walks the same chain without streaming.
    pub async fn count_tokens(
        &self,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ProxyError> {
        let envelope = ChatEnvelope::from_slice(&payload).unwrap_or_default();
        if envelope.model.is_empty() {
            return Err(ProxyError::bad_request("missing model"));
        }
        let legs = self.resolve(&envelope.model).legs();
        if legs.is_empty() {
            return Err(ProxyError::no_provider());
        }

        let mut last: Option<(PoolError, String)> = None;
        for (providers, model) in legs {
            let body = rewrite_model(&payload, &model)
                .map(Bytes::from)
                .unwrap_or_else(|| payload.clone());
            let request = ExecuteRequest::new(model.clone(), body);
            match self
                .pool
                .count_tokens(&providers, &request, &ExecuteOptions::default(), cancel)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    let advance =
                        matches!(err, PoolError::ModelCooldown { .. }) || err.is_retryable();
                    if advance {
                        last = Some((err, model));
                        continue;
                    }
                    return Err(ProxyError::from_pool(err, &model));
                }
            }
        }
        match last {
            Some((err, model)) => Err(ProxyError::from_pool(err, &model)),
            None => Err(ProxyError::no_provider()),
        }
    }

    /// Native provider pass-through: pick a credential, let the executor
    /// attach its auth headers, forward verbatim. Results still feed the
    /// credential-wide cooldown state.
    pub async fn pass_through(
        &self,
        provider: &str,
        method: &str,
        path_and_query: &str,
        body: Option<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse, ProxyError> {
        let provider = normalize_provider(provider);
        let Some(executor) = self.registry.get(&provider) else {
            return Err(ProxyError::new(404, "unknown_provider", "unknown provider"));
        };
        let picked = self
            .pool
            .pick(std::slice::from_ref(&provider), "", &HashSet::new())
            .await
            .map_err(|err| ProxyError::from_pool(err, ""))?
            .ok_or_else(|| ProxyError::from_pool(PoolError::NoAuthAvailable, ""))?;
        let auth = self.pool.auth_for_execution(&picked).await;

        let base = auth
            .base_url()
            .map(str::to_string)
            .or_else(|| default_base(&provider).map(str::to_string))
            .ok_or_else(|| {
                ProxyError::new(400, "no_base_url", "credential has no base url to forward to")
            })?;
        let url = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path_and_query.trim_start_matches('/')
        );
        let mut parts = HttpRequestParts {
            method: method.to_string(),
            url,
            headers: Vec::new(),
        };
        executor
            .prepare_request(&auth, &mut parts)
            .map_err(|err| ProxyError::from_pool(PoolError::Upstream(err), ""))?;

        match self
            .client
            .send(&parts.method, &parts.url, &parts.headers, body, cancel)
            .await
        {
            Ok(response) => {
                self.pool
                    .mark_result(&ExecutionResult::success(&picked.auth.id, &provider, ""))
                    .await;
                Ok(response)
            }
            Err(err) => {
                self.pool
                    .mark_result(&ExecutionResult::failure(
                        &picked.auth.id,
                        &provider,
                        "",
                        err.clone(),
                    ))
                    .await;
                Err(ProxyError::from_pool(PoolError::Upstream(err), ""))
            }
        }
    }

    /// Virtual models plus the registered provider tags, OpenAI list shape.
    pub fn models(&self) -> ModelList {
        let config = self.fallback.load();
        let mut entries: Vec<ModelEntry> = Vec::new();
        if config.enabled {
            for vm in &config.virtual_models {
                entries.push(ModelEntry::new(&vm.name, "quotio"));
            }
        }
        ModelList::new(entries)
    }
}

/// Providers recognisable from the model name alone.
fn infer_provider(model: &str) -> Option<String> {
    let lower = model.trim().to_ascii_lowercase();
    if lower.starts_with("claude") {
        return Some("claude".to_string());
    }
    if lower.starts_with("gemini") {
        return Some("gemini".to_string());
    }
    if lower.starts_with("gpt")
        || lower.starts_with("codex")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("o4")
    {
        return Some("codex".to_string());
    }
    None
}

fn default_base(provider: &str) -> Option<&'static str> {
    match provider {
        "claude" => Some(quotio_provider_impl::anthropic::DEFAULT_BASE_URL),
        "gemini" => Some(quotio_provider_impl::gemini::DEFAULT_BASE_URL),
        "codex" => Some(quotio_provider_impl::codex::DEFAULT_BASE_URL),
        _ => None,
    }
}
