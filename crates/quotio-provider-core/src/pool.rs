use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quotio_common::RotationStrategy;

use crate::credential::{StoredCredential, normalize_provider};
use crate::errors::{ExecuteError, ExecuteErrorKind, PoolError};
use crate::executor::{ChunkResult, ChunkStream, ExecuteOptions, ExecuteRequest};
use crate::registry::ExecutorRegistry;
use crate::selector::{
    BlockReason, CURSOR_WRAP, Eligibility, SelectorState, eligibility, select_candidate,
};
use crate::state::{ExecutionResult, RuntimeCredential};

/// Where stored records go when the pool mutates them (registration, update,
/// token refresh write-back).
#[async_trait]
pub trait CredentialSink: Send + Sync {
    async fn persist(&self, auth: &StoredCredential) -> io::Result<()>;

    async fn remove(&self, _id: &str) -> io::Result<()> {
        Ok(())
    }
}

/// Sink for tests and ephemeral pools.
pub struct NoopSink;

#[async_trait]
impl CredentialSink for NoopSink {
    async fn persist(&self, _auth: &StoredCredential) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub strategy: RotationStrategy,
    /// Extra full-attempt rounds after the first one.
    pub retry_count: u32,
    /// Upper bound on the inter-round cooldown sleep.
    pub max_retry_wait_ms: u64,
    /// Refresh a credential inline when its token expires this close to now.
    pub refresh_ahead: time::Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::RoundRobin,
            retry_count: quotio_common::DEFAULT_RETRY_COUNT,
            max_retry_wait_ms: quotio_common::DEFAULT_MAX_RETRY_WAIT_MS,
            refresh_ahead: time::Duration::seconds(60),
        }
    }
}

struct PoolState {
    auths: HashMap<String, RuntimeCredential>,
    /// Per-model rotation offset over the provider preference list.
    provider_offsets: HashMap<String, u32>,
    selector: SelectorState,
}

enum AttemptOutcome {
    Success(Bytes),
    Cancelled,
    Exhausted { cooldown: Option<PoolError> },
}

#[derive(Clone, Copy)]
enum CallKind {
    Generate,
    CountTokens,
}

/// Owns runtime state for every credential, applies the cooldown state
/// machine on each result, rotates across mixed-provider fallback lists, and
/// drives retries.
///
/// All shared state sits behind one lock; critical sections are the pick,
/// the result application, and the cursor/offset advances. Upstream IO never
/// happens under the lock.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    registry: Arc<ExecutorRegistry>,
    sink: Arc<dyn CredentialSink>,
    config: PoolConfig,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialPool {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        sink: Arc<dyn CredentialSink>,
        config: PoolConfig,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState {
                auths: HashMap::new(),
                provider_offsets: HashMap::new(),
                selector: SelectorState::default(),
            }),
            registry,
            sink,
            config,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Insert a fresh runtime entry and persist the stored record.
    pub async fn register(&self, auth: StoredCredential) -> io::Result<()> {
        if auth.id.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "credential id must not be empty",
            ));
        }
        let now = OffsetDateTime::now_utc();
        {
            let mut state = self.state.lock().await;
            state
                .auths
                .insert(auth.id.clone(), RuntimeCredential::new(auth.clone(), now));
        }
        info!(event = "credential_registered", id = %auth.id, provider = %auth.provider);
        self.sink.persist(&auth).await
    }

    /// Insert a runtime entry for a record that is already on disk, without
    /// writing it back. Startup path.
    pub async fn load(&self, auth: StoredCredential) {
        if auth.id.is_empty() {
            return;
        }
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        state
            .auths
            .insert(auth.id.clone(), RuntimeCredential::new(auth, now));
    }

    /// Replace the stored record, preserving live model states, quota, and
    /// runtime status for the same id.
    pub async fn update(&self, auth: StoredCredential) -> io::Result<()> {
        if auth.id.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "credential id must not be empty",
            ));
        }
        let now = OffsetDateTime::now_utc();
        {
            let mut state = self.state.lock().await;
            match state.auths.get_mut(&auth.id) {
                Some(existing) => existing.apply_update(auth.clone(), now),
                None => {
                    state
                        .auths
                        .insert(auth.id.clone(), RuntimeCredential::new(auth.clone(), now));
                }
            }
        }
        self.sink.persist(&auth).await
    }

    pub async fn remove(&self, id: &str) -> io::Result<bool> {
        let removed = self.state.lock().await.auths.remove(id).is_some();
        if removed {
            self.sink.remove(id).await?;
        }
        Ok(removed)
    }

    pub async fn set_disabled(&self, id: &str, disabled: bool) -> io::Result<bool> {
        let auth = {
            let mut state = self.state.lock().await;
            let Some(cred) = state.auths.get_mut(id) else {
                return Ok(false);
            };
            cred.auth.disabled = disabled;
            cred.runtime_status = if disabled {
                crate::state::RuntimeStatus::Disabled
            } else {
                crate::state::RuntimeStatus::Active
            };
            cred.runtime_updated_at = OffsetDateTime::now_utc();
            cred.auth.clone()
        };
        self.sink.persist(&auth).await?;
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Option<RuntimeCredential> {
        self.state.lock().await.auths.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<RuntimeCredential> {
        let state = self.state.lock().await;
        let mut rows: Vec<RuntimeCredential> = state.auths.values().cloned().collect();
        rows.sort_by(|a, b| a.auth.id.cmp(&b.auth.id));
        rows
    }

    /// Normalise and deduplicate a provider preference list, then rotate it
    /// by the per-model offset so the first-choice provider cycles across
    /// requests. Advances the offset.
    pub async fn rotate_providers(&self, providers: &[String], model: &str) -> Vec<String> {
        let providers = normalize_provider_list(providers);
        if providers.len() < 2 {
            return providers;
        }
        let mut state = self.state.lock().await;
        let entry = state
            .provider_offsets
            .entry(model.to_string())
            .or_insert(0);
        let current = *entry;
        *entry = if current + 1 >= CURSOR_WRAP {
            0
        } else {
            current + 1
        };
        let offset = current as usize % providers.len();
        providers[offset..]
            .iter()
            .chain(providers[..offset].iter())
            .cloned()
            .collect()
    }

    /// Select one credential across a mixed-provider preference list, taken
    /// in the given order. Raises `ModelCooldown` only when every remaining
    /// candidate is blocked and all blocks are cooldowns.
    pub async fn pick(
        &self,
        providers: &[String],
        model: &str,
        tried: &HashSet<String>,
    ) -> Result<Option<RuntimeCredential>, PoolError> {
        let rotated = normalize_provider_list(providers);
        if rotated.is_empty() {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;

        let mut blocked_any = false;
        let mut all_cooldown = true;
        let mut earliest_reset: Option<OffsetDateTime> = None;

        let PoolState {
            auths, selector, ..
        } = &mut *state;
        for provider in &rotated {
            let mut eligible: Vec<&RuntimeCredential> = Vec::new();
            for cred in auths.values() {
                if cred.auth.normalized_provider() != *provider || tried.contains(&cred.auth.id) {
                    continue;
                }
                match eligibility(cred, model, now) {
                    Eligibility::Eligible => eligible.push(cred),
                    Eligibility::Blocked { reason, next_retry } => {
                        blocked_any = true;
                        if reason == BlockReason::Cooldown {
                            if let Some(at) = next_retry
                                && earliest_reset.is_none_or(|current| at < current)
                            {
                                earliest_reset = Some(at);
                            }
                        } else {
                            all_cooldown = false;
                        }
                    }
                }
            }
            if let Some(id) =
                select_candidate(selector, self.config.strategy, provider, model, &eligible)
            {
                return Ok(auths.get(&id).cloned());
            }
        }

        if blocked_any && all_cooldown {
            let provider = if rotated.len() == 1 {
                Some(rotated[0].clone())
            } else {
                None
            };
            let reset_at = earliest_reset.unwrap_or(now);
            return Err(PoolError::model_cooldown(model, provider, reset_at));
        }
        Ok(None)
    }

    /// Apply one attempt outcome to runtime state. Cooldown math happens here
    /// exactly once per failure.
    pub async fn mark_result(&self, result: &ExecutionResult) {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let Some(cred) = state.auths.get_mut(&result.auth_id) else {
            return;
        };
        if result.success {
            cred.record_success(&result.model, now);
            info!(
                event = "attempt_succeeded",
                auth_id = %result.auth_id,
                provider = %result.provider,
                model = %result.model
            );
        } else {
            let (status, message) = match &result.error {
                Some(err) => (err.status, err.message.clone()),
                None => (0, "unknown error".to_string()),
            };
            cred.record_failure(&result.model, status, result.retry_after_ms, &message, now);
            warn!(
                event = "attempt_failed",
                auth_id = %result.auth_id,
                provider = %result.provider,
                model = %result.model,
                status,
                retry_after_ms = result.retry_after_ms,
                backoff_level = cred.quota.backoff_level
            );
        }
    }

    /// One non-streaming request across the fallback providers, with the
    /// full attempt loop and inter-round cooldown retries.
    pub async fn execute(
        &self,
        providers: &[String],
        request: &ExecuteRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, PoolError> {
        self.run_with_retries(providers, request, opts, cancel, CallKind::Generate)
            .await
    }

    pub async fn count_tokens(
        &self,
        providers: &[String],
        request: &ExecuteRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, PoolError> {
        self.run_with_retries(providers, request, opts, cancel, CallKind::CountTokens)
            .await
    }

    async fn run_with_retries(
        &self,
        providers: &[String],
        request: &ExecuteRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
        kind: CallKind,
    ) -> Result<Bytes, PoolError> {
        let providers = self.rotate_providers(providers, &request.model).await;
        let mut last_error: Option<ExecuteError> = None;
        let mut rounds = 0u32;
        loop {
            let mut tried = HashSet::new();
            let outcome = self
                .run_attempt_loop(
                    &providers,
                    request,
                    opts,
                    cancel,
                    kind,
                    &mut tried,
                    &mut last_error,
                )
                .await;
            match outcome {
                AttemptOutcome::Success(bytes) => return Ok(bytes),
                AttemptOutcome::Cancelled => return Err(PoolError::Cancelled),
                AttemptOutcome::Exhausted { cooldown } => {
                    rounds += 1;
                    if rounds <= self.config.retry_count
                        && self
                            .sleep_until_closest_recovery(&providers, &request.model, cancel)
                            .await?
                    {
                        continue;
                    }
                    return Err(final_error(cooldown, last_error));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt_loop(
        &self,
        providers: &[String],
        request: &ExecuteRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
        kind: CallKind,
        tried: &mut HashSet<String>,
        last_error: &mut Option<ExecuteError>,
    ) -> AttemptOutcome {
        loop {
            let picked = match self.pick(providers, &request.model, tried).await {
                Ok(Some(cred)) => cred,
                Ok(None) => return AttemptOutcome::Exhausted { cooldown: None },
                Err(err) => {
                    return AttemptOutcome::Exhausted {
                        cooldown: Some(err),
                    };
                }
            };
            let auth_id = picked.auth.id.clone();
            let provider = picked.auth.normalized_provider();
            tried.insert(auth_id.clone());

            let Some(executor) = self.registry.get(&provider) else {
                *last_error = Some(ExecuteError::status_error(
                    500,
                    format!("no executor registered for provider {provider}"),
                    Vec::new(),
                ));
                continue;
            };
            let auth = self.auth_for_execution(&picked).await;

            let call = async {
                match kind {
                    CallKind::Generate => executor.execute(&auth, request, opts, cancel).await,
                    CallKind::CountTokens => {
                        executor.count_tokens(&auth, request, opts, cancel).await
                    }
                }
            };
            // Biased toward the call so a completed attempt racing
            // cancellation still records its result.
            let outcome = tokio::select! {
                biased;
                result = call => result,
                _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
            };

            match outcome {
                Ok(bytes) => {
                    self.mark_result(&ExecutionResult::success(&auth_id, &provider, &request.model))
                        .await;
                    return AttemptOutcome::Success(bytes);
                }
                Err(err) if err.kind == ExecuteErrorKind::Cancelled => {
                    return AttemptOutcome::Cancelled;
                }
                Err(err) => {
                    self.mark_result(&ExecutionResult::failure(
                        &auth_id,
                        &provider,
                        &request.model,
                        err.clone(),
                    ))
                    .await;
                    *last_error = Some(err);
                }
            }
        }
    }

    /// One streaming request. The returned channel is live once the first
    /// upstream stream opened; mid-stream failures rotate to the next
    /// candidate and keep feeding the same channel.
    pub async fn execute_stream(
        self: Arc<Self>,
        providers: &[String],
        request: &ExecuteRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, PoolError> {
        let providers = self.rotate_providers(providers, &request.model).await;
        let mut last_error: Option<ExecuteError> = None;
        let mut rounds = 0u32;
        loop {
            let mut tried = HashSet::new();
            let mut cooldown: Option<PoolError> = None;
            loop {
                let picked = match self.pick(&providers, &request.model, &tried).await {
                    Ok(Some(cred)) => cred,
                    Ok(None) => break,
                    Err(err) => {
                        cooldown = Some(err);
                        break;
                    }
                };
                let auth_id = picked.auth.id.clone();
                let provider = picked.auth.normalized_provider();
                tried.insert(auth_id.clone());

                let Some(executor) = self.registry.get(&provider) else {
                    last_error = Some(ExecuteError::status_error(
                        500,
                        format!("no executor registered for provider {provider}"),
                        Vec::new(),
                    ));
                    continue;
                };
                let auth = self.auth_for_execution(&picked).await;
                let opened = tokio::select! {
                    biased;
                    result = executor.execute_stream(&auth, request, opts, cancel) => result,
                    _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                };
                match opened {
                    Ok(upstream) => {
                        let (tx, rx) = mpsc::channel(16);
                        let forward = StreamForward {
                            pool: self.clone(),
                            providers: providers.clone(),
                            request: request.clone(),
                            opts: opts.clone(),
                            cancel: cancel.clone(),
                            tried,
                        };
                        tokio::spawn(forward.run(upstream, tx, auth_id, provider));
                        return Ok(rx);
                    }
                    Err(err) if err.kind == ExecuteErrorKind::Cancelled => {
                        return Err(PoolError::Cancelled);
                    }
                    Err(err) => {
                        self.mark_result(&ExecutionResult::failure(
                            &auth_id,
                            &provider,
                            &request.model,
                            err.clone(),
                        ))
                        .await;
                        last_error = Some(err);
                    }
                }
            }

            rounds += 1;
            if rounds <= self.config.retry_count
                && self
                    .sleep_until_closest_recovery(&providers, &request.model, cancel)
                    .await?
            {
                continue;
            }
            return Err(final_error(cooldown, last_error));
        }
    }

    /// Sleep until the closest recovery instant for `model` across the
    /// requested providers, if that wait fits the configured budget. Returns
    /// whether a retry round should run.
    async fn sleep_until_closest_recovery(
        &self,
        providers: &[String],
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, PoolError> {
        let Some(wait) = self.closest_retry_wait(providers, model).await else {
            return Ok(false);
        };
        if wait.is_zero() || wait.as_millis() as u64 > self.config.max_retry_wait_ms {
            return Ok(false);
        }
        info!(
            event = "cooldown_wait",
            model,
            wait_ms = wait.as_millis() as u64
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(true),
        }
    }

    async fn closest_retry_wait(
        &self,
        providers: &[String],
        model: &str,
    ) -> Option<std::time::Duration> {
        let providers = normalize_provider_list(providers);
        let now = OffsetDateTime::now_utc();
        let state = self.state.lock().await;
        let mut earliest: Option<OffsetDateTime> = None;
        for cred in state.auths.values() {
            if !providers.contains(&cred.auth.normalized_provider()) {
                continue;
            }
            if let Some(at) = cred.next_recovery(model, now)
                && earliest.is_none_or(|current| at < current)
            {
                earliest = Some(at);
            }
        }
        let wait = earliest? - now;
        let millis = wait.whole_milliseconds();
        if millis <= 0 {
            return None;
        }
        Some(std::time::Duration::from_millis(millis as u64))
    }

    /// Hand back the stored record to execute with, refreshing it inline
    /// when the token is about to expire. Every path that follows a pick
    /// with upstream IO goes through here, pass-through included.
    pub async fn auth_for_execution(&self, cred: &RuntimeCredential) -> StoredCredential {
        let now = OffsetDateTime::now_utc();
        if cred.auth.refresh_token.is_some()
            && cred.auth.expires_within(now, self.config.refresh_ahead)
            && let Some(refreshed) = self.refresh_credential(&cred.auth.id).await
        {
            return refreshed;
        }
        cred.auth.clone()
    }

    /// Run the executor's refresh for one credential. Serialised per id: a
    /// refresh in flight blocks a concurrent refresh of the same credential.
    pub async fn refresh_credential(&self, id: &str) -> Option<StoredCredential> {
        let id_lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = id_lock.lock().await;

        // Re-read under the state lock: a concurrent refresh may have already
        // replaced the tokens while we waited.
        let auth = {
            let state = self.state.lock().await;
            state.auths.get(id)?.auth.clone()
        };
        let executor = self.registry.get(&auth.normalized_provider())?;
        let refreshed = executor.refresh(auth).await;
        let now = OffsetDateTime::now_utc();
        {
            let mut state = self.state.lock().await;
            if let Some(cred) = state.auths.get_mut(id) {
                cred.apply_refresh(refreshed.clone(), now);
            }
        }
        if let Err(err) = self.sink.persist(&refreshed).await {
            warn!(event = "credential_persist_failed", id = %id, error = %err);
        }
        Some(refreshed)
    }
}

struct StreamForward {
    pool: Arc<CredentialPool>,
    providers: Vec<String>,
    request: ExecuteRequest,
    opts: ExecuteOptions,
    cancel: CancellationToken,
    tried: HashSet<String>,
}

impl StreamForward {
    /// Forward upstream chunks downstream, recording exactly one result per
    /// attempt: success when the channel closes cleanly, failure on the first
    /// error chunk. On failure, rotate to the next candidate and keep going.
    async fn run(
        mut self,
        mut upstream: ChunkStream,
        tx: mpsc::Sender<ChunkResult>,
        mut auth_id: String,
        mut provider: String,
    ) {
        'attempt: loop {
            let failure: ExecuteError;
            loop {
                let chunk = tokio::select! {
                    biased;
                    chunk = upstream.recv() => chunk,
                    _ = self.cancel.cancelled() => return,
                };
                match chunk {
                    None => {
                        self.pool
                            .mark_result(&ExecutionResult::success(
                                &auth_id,
                                &provider,
                                &self.request.model,
                            ))
                            .await;
                        return;
                    }
                    Some(Ok(bytes)) => {
                        // Downstream gone: drop the upstream reader and stop.
                        if tx.send(Ok(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) if err.kind == ExecuteErrorKind::Cancelled => return,
                    Some(Err(err)) => {
                        self.pool
                            .mark_result(&ExecutionResult::failure(
                                &auth_id,
                                &provider,
                                &self.request.model,
                                err.clone(),
                            ))
                            .await;
                        failure = err;
                        break;
                    }
                }
            }

            // Mid-stream failover: no inter-round sleeping here, just walk the
            // remaining candidates.
            let mut latest = failure;
            loop {
                let picked = match self
                    .pool
                    .pick(&self.providers, &self.request.model, &self.tried)
                    .await
                {
                    Ok(Some(cred)) => cred,
                    Ok(None) | Err(_) => {
                        let _ = tx.send(Err(latest)).await;
                        return;
                    }
                };
                let next_id = picked.auth.id.clone();
                let next_provider = picked.auth.normalized_provider();
                self.tried.insert(next_id.clone());
                let Some(executor) = self.pool.registry.get(&next_provider) else {
                    continue;
                };
                let auth = self.pool.auth_for_execution(&picked).await;
                match executor
                    .execute_stream(&auth, &self.request, &self.opts, &self.cancel)
                    .await
                {
                    Ok(next_stream) => {
                        upstream = next_stream;
                        auth_id = next_id;
                        provider = next_provider;
                        continue 'attempt;
                    }
                    Err(err) if err.kind == ExecuteErrorKind::Cancelled => return,
                    Err(err) => {
                        self.pool
                            .mark_result(&ExecutionResult::failure(
                                &next_id,
                                &next_provider,
                                &self.request.model,
                                err.clone(),
                            ))
                            .await;
                        latest = err;
                    }
                }
            }
        }
    }
}

fn final_error(cooldown: Option<PoolError>, last_error: Option<ExecuteError>) -> PoolError {
    if let Some(err) = cooldown {
        return err;
    }
    if let Some(err) = last_error {
        return PoolError::Upstream(err);
    }
    PoolError::NoAuthAvailable
}

fn normalize_provider_list(providers: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for provider in providers {
        let normalized = normalize_provider(provider);
        if normalized.is_empty() || !seen.insert(normalized.clone()) {
            continue;
        }
        out.push(normalized);
    }
    out
}
