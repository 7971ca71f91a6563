use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use quotio_common::RotationStrategy;
use quotio_provider_core::{
    AuthStatus, ChunkStream, CredentialPool, ExecuteError, ExecuteOptions, ExecuteRequest,
    ExecutionResult, ExecutorRegistry, NoopSink, PoolConfig, PoolError, ProviderExecutor,
    RuntimeStatus, StoredCredential,
};

enum Step {
    Ok(&'static str),
    Status {
        status: u16,
        retry_after: Option<&'static str>,
    },
    /// Stream these chunks, then either close cleanly or emit an error chunk.
    Stream {
        chunks: Vec<&'static str>,
        error: Option<u16>,
    },
    /// Stall for a while before answering, to race cancellation.
    Hang {
        ms: u64,
    },
}

struct FakeExecutor {
    tag: &'static str,
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    seen_tokens: Mutex<Vec<Option<String>>>,
    refresh_fails: bool,
}

impl FakeExecutor {
    fn new(tag: &'static str) -> Arc<Self> {
        Arc::new(Self {
            tag,
            steps: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            seen_tokens: Mutex::new(Vec::new()),
            refresh_fails: false,
        })
    }

    fn refresh_failing(tag: &'static str) -> Arc<Self> {
        Arc::new(Self {
            tag,
            steps: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            seen_tokens: Mutex::new(Vec::new()),
            refresh_fails: true,
        })
    }

    fn script(&self, auth_id: &str, step: Step) {
        self.steps
            .lock()
            .unwrap()
            .entry(auth_id.to_string())
            .or_default()
            .push_back(step);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn pop(&self, auth_id: &str) -> Option<Step> {
        self.steps
            .lock()
            .unwrap()
            .get_mut(auth_id)
            .and_then(VecDeque::pop_front)
    }

    fn record(&self, auth: &StoredCredential) {
        self.calls.lock().unwrap().push(auth.id.clone());
        self.seen_tokens
            .lock()
            .unwrap()
            .push(auth.access_token.clone());
    }

    fn error_for(status: u16, retry_after: Option<&'static str>) -> ExecuteError {
        let headers = retry_after
            .map(|value| vec![("retry-after".to_string(), value.to_string())])
            .unwrap_or_default();
        ExecuteError::status_error(status, "upstream error", headers)
    }
}

#[async_trait]
impl ProviderExecutor for FakeExecutor {
    fn identifier(&self) -> &'static str {
        self.tag
    }

    async fn execute(
        &self,
        auth: &StoredCredential,
        _req: &ExecuteRequest,
        _opts: &ExecuteOptions,
        _cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        self.record(auth);
        match self.pop(&auth.id) {
            None | Some(Step::Ok("")) => Ok(Bytes::from_static(b"default")),
            Some(Step::Ok(body)) => Ok(Bytes::from(body.as_bytes())),
            Some(Step::Status {
                status,
                retry_after,
            }) => Err(Self::error_for(status, retry_after)),
            Some(Step::Hang { ms }) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Bytes::from_static(b"late"))
            }
            Some(Step::Stream { .. }) => panic!("stream step in non-stream call"),
        }
    }

    async fn execute_stream(
        &self,
        auth: &StoredCredential,
        _req: &ExecuteRequest,
        _opts: &ExecuteOptions,
        _cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError> {
        self.record(auth);
        match self.pop(&auth.id) {
            Some(Step::Stream { chunks, error }) => {
                let (tx, rx) = tokio::sync::mpsc::channel(chunks.len() + 2);
                for chunk in chunks {
                    tx.try_send(Ok(Bytes::from(chunk.as_bytes()))).unwrap();
                }
                if let Some(status) = error {
                    tx.try_send(Err(Self::error_for(status, None))).unwrap();
                }
                Ok(rx)
            }
            Some(Step::Status {
                status,
                retry_after,
            }) => Err(Self::error_for(status, retry_after)),
            other => panic!("unexpected step for stream call: scripted={}", other.is_some()),
        }
    }

    async fn refresh(&self, mut auth: StoredCredential) -> StoredCredential {
        if self.refresh_fails {
            auth.status = AuthStatus::Error;
            auth.status_message = Some("refresh token invalid".to_string());
        } else {
            auth.access_token = Some("refreshed".to_string());
            auth.expires_at = Some(OffsetDateTime::now_utc() + time::Duration::hours(8));
            auth.status = AuthStatus::Ready;
        }
        auth.updated_at = OffsetDateTime::now_utc();
        auth
    }
}

fn pool_with(
    executors: &[Arc<FakeExecutor>],
    retry_count: u32,
    max_retry_wait_ms: u64,
) -> Arc<CredentialPool> {
    let mut registry = ExecutorRegistry::new();
    for executor in executors {
        registry.register(executor.clone());
    }
    Arc::new(CredentialPool::new(
        Arc::new(registry),
        Arc::new(NoopSink),
        PoolConfig {
            strategy: RotationStrategy::RoundRobin,
            retry_count,
            max_retry_wait_ms,
            refresh_ahead: time::Duration::seconds(60),
        },
    ))
}

fn cred(id: &str, provider: &str) -> StoredCredential {
    StoredCredential::new(id, provider)
}

fn providers(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn request(model: &str) -> ExecuteRequest {
    ExecuteRequest::new(model, Bytes::from_static(b"{}"))
}

async fn precool(pool: &CredentialPool, id: &str, model: &str, retry_after_ms: u64) {
    let mut result = ExecutionResult::failure(
        id,
        "claude",
        model,
        ExecuteError::status_error(429, "rate limited", Vec::new()),
    );
    result.retry_after_ms = Some(retry_after_ms);
    pool.mark_result(&result).await;
}

#[tokio::test]
async fn round_robin_distributes_sequential_requests() {
    let claude = FakeExecutor::new("claude");
    claude.script("a", Step::Ok("first"));
    claude.script("b", Step::Ok("second"));
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();
    pool.register(cred("b", "claude")).await.unwrap();

    let cancel = CancellationToken::new();
    let first = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    let second = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(first, Bytes::from_static(b"first"));
    assert_eq!(second, Bytes::from_static(b"second"));
    assert_eq!(claude.calls(), ["a", "b"]);
    for id in ["a", "b"] {
        let snapshot = pool.get(id).await.unwrap();
        assert_eq!(snapshot.quota.backoff_level, 0);
        assert_eq!(snapshot.runtime_status, RuntimeStatus::Active);
    }
}

#[tokio::test]
async fn rate_limit_fails_over_within_provider() {
    let claude = FakeExecutor::new("claude");
    claude.script(
        "a",
        Step::Status {
            status: 429,
            retry_after: Some("2"),
        },
    );
    claude.script("b", Step::Ok("from-b"));
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();
    pool.register(cred("b", "claude")).await.unwrap();

    let started = OffsetDateTime::now_utc();
    let cancel = CancellationToken::new();
    let body = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(body, Bytes::from_static(b"from-b"));
    assert_eq!(claude.calls(), ["a", "b"]);

    let blocked = pool.get("a").await.unwrap();
    assert!(blocked.quota.exceeded);
    let recover = blocked.quota.next_recover_at.unwrap();
    let window = (recover - started).whole_milliseconds();
    assert!((1900..=2300).contains(&window), "window {window}ms");
    let model_state = blocked.model_states.get("claude-opus").unwrap();
    assert_eq!(model_state.next_retry_after, Some(recover));
}

#[tokio::test]
async fn virtual_model_falls_back_across_providers() {
    let claude = FakeExecutor::new("claude");
    let gemini = FakeExecutor::new("gemini");
    claude.script(
        "a1",
        Step::Status {
            status: 429,
            retry_after: None,
        },
    );
    claude.script(
        "a2",
        Step::Status {
            status: 429,
            retry_after: None,
        },
    );
    gemini.script("g1", Step::Ok("gemini-ok"));
    let pool = pool_with(&[claude.clone(), gemini.clone()], 0, 0);
    pool.register(cred("a1", "claude")).await.unwrap();
    pool.register(cred("a2", "claude")).await.unwrap();
    pool.register(cred("g1", "gemini")).await.unwrap();

    let cancel = CancellationToken::new();
    let body = pool
        .execute(
            &providers(&["claude", "gemini"]),
            &request("claude-3-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(body, Bytes::from_static(b"gemini-ok"));
    assert_eq!(claude.calls(), ["a1", "a2"]);
    assert_eq!(gemini.calls(), ["g1"]);
    for id in ["a1", "a2"] {
        let snapshot = pool.get(id).await.unwrap();
        assert_eq!(snapshot.quota.backoff_level, 1);
        assert!(snapshot.quota.exceeded);
    }
    assert_eq!(
        pool.get("g1").await.unwrap().runtime_status,
        RuntimeStatus::Active
    );
}

#[tokio::test]
async fn all_cooling_down_surfaces_model_cooldown() {
    let claude = FakeExecutor::new("claude");
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();
    pool.register(cred("b", "claude")).await.unwrap();
    precool(&pool, "a", "claude-opus", 1500).await;
    precool(&pool, "b", "claude-opus", 2500).await;

    let cancel = CancellationToken::new();
    let err = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();

    match err {
        PoolError::ModelCooldown {
            model,
            provider,
            reset_seconds,
            ..
        } => {
            assert_eq!(model, "claude-opus");
            assert_eq!(provider.as_deref(), Some("claude"));
            // Earliest candidate recovers 1.5s out; seconds round up.
            assert_eq!(reset_seconds, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(claude.calls(), Vec::<String>::new());
}

#[tokio::test]
async fn cooldown_retry_waits_and_recovers() {
    let claude = FakeExecutor::new("claude");
    claude.script("a", Step::Ok("recovered"));
    let pool = pool_with(&[claude.clone()], 1, 2000);
    pool.register(cred("a", "claude")).await.unwrap();
    precool(&pool, "a", "claude-opus", 300).await;

    let started = std::time::Instant::now();
    let cancel = CancellationToken::new();
    let body = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(body, Bytes::from_static(b"recovered"));
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(pool.get("a").await.unwrap().quota.backoff_level, 0);
}

#[tokio::test]
async fn cooldown_wait_beyond_budget_fails_fast() {
    let claude = FakeExecutor::new("claude");
    let pool = pool_with(&[claude.clone()], 3, 1000);
    pool.register(cred("a", "claude")).await.unwrap();
    precool(&pool, "a", "claude-opus", 60_000).await;

    let started = std::time::Instant::now();
    let cancel = CancellationToken::new();
    let err = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::ModelCooldown { .. }));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn streaming_failure_rotates_mid_stream() {
    let claude = FakeExecutor::new("claude");
    claude.script(
        "a",
        Step::Stream {
            chunks: vec!["abc"],
            error: Some(503),
        },
    );
    claude.script(
        "b",
        Step::Stream {
            chunks: vec!["defgh"],
            error: None,
        },
    );
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();
    pool.register(cred("b", "claude")).await.unwrap();

    let cancel = CancellationToken::new();
    let mut rx = pool
        .clone()
        .execute_stream(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions {
                stream: true,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    let bodies: Vec<Bytes> = chunks.into_iter().map(|c| c.unwrap()).collect();
    assert_eq!(
        bodies,
        [Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")]
    );

    let failed = pool.get("a").await.unwrap();
    let state = failed.model_states.get("claude-opus").unwrap();
    assert!(state.unavailable);
    assert_eq!(
        pool.get("b").await.unwrap().runtime_status,
        RuntimeStatus::Active
    );
}

#[tokio::test]
async fn stream_exhaustion_delivers_error_chunk() {
    let claude = FakeExecutor::new("claude");
    claude.script(
        "a",
        Step::Stream {
            chunks: vec!["abc"],
            error: Some(503),
        },
    );
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();

    let cancel = CancellationToken::new();
    let mut rx = pool
        .clone()
        .execute_stream(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions {
                stream: true,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
    let err = rx.recv().await.unwrap().unwrap_err();
    assert_eq!(err.status, 503);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn refresh_failure_leaves_credential_ineligible() {
    let claude = FakeExecutor::refresh_failing("claude");
    let pool = pool_with(&[claude.clone()], 0, 0);
    let mut auth = cred("a", "claude");
    auth.refresh_token = Some("rt".to_string());
    pool.register(auth).await.unwrap();

    let refreshed = pool.refresh_credential("a").await.unwrap();
    assert_eq!(refreshed.status, AuthStatus::Error);

    let cancel = CancellationToken::new();
    let err = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NoAuthAvailable));
    assert_eq!(err.http_status(), 500);
    assert_eq!(claude.calls(), Vec::<String>::new());
}

#[tokio::test]
async fn expiring_token_is_refreshed_before_execution() {
    let claude = FakeExecutor::new("claude");
    claude.script("a", Step::Ok("done"));
    let pool = pool_with(&[claude.clone()], 0, 0);
    let mut auth = cred("a", "claude");
    auth.refresh_token = Some("rt".to_string());
    auth.access_token = Some("stale".to_string());
    auth.expires_at = Some(OffsetDateTime::now_utc() + time::Duration::seconds(10));
    pool.register(auth).await.unwrap();

    let cancel = CancellationToken::new();
    pool.execute(
        &providers(&["claude"]),
        &request("claude-opus"),
        &ExecuteOptions::default(),
        &cancel,
    )
    .await
    .unwrap();

    let seen = claude.seen_tokens.lock().unwrap().clone();
    assert_eq!(seen, [Some("refreshed".to_string())]);
    assert!(pool.get("a").await.unwrap().last_refreshed_at.is_some());
}

#[tokio::test]
async fn no_credential_is_executed_twice_per_request() {
    let claude = FakeExecutor::new("claude");
    for id in ["a", "b"] {
        claude.script(
            id,
            Step::Status {
                status: 500,
                retry_after: None,
            },
        );
    }
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();
    pool.register(cred("b", "claude")).await.unwrap();

    let cancel = CancellationToken::new();
    let err = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();

    match err {
        PoolError::Upstream(err) => assert_eq!(err.status, 500),
        other => panic!("unexpected {other:?}"),
    }
    let mut calls = claude.calls();
    calls.sort();
    assert_eq!(calls, ["a", "b"]);
}

#[tokio::test]
async fn mixed_block_reasons_do_not_masquerade_as_cooldown() {
    let claude = FakeExecutor::new("claude");
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();
    let mut disabled = cred("b", "claude");
    disabled.disabled = true;
    pool.register(disabled).await.unwrap();
    precool(&pool, "a", "claude-opus", 60_000).await;

    let cancel = CancellationToken::new();
    let err = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NoAuthAvailable));
}

#[tokio::test]
async fn update_preserves_runtime_state_register_resets_it() {
    let claude = FakeExecutor::new("claude");
    claude.script(
        "a",
        Step::Status {
            status: 429,
            retry_after: None,
        },
    );
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();

    let cancel = CancellationToken::new();
    let _ = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await;

    let mut replacement = cred("a", "claude");
    replacement.access_token = Some("new-token".to_string());
    pool.update(replacement).await.unwrap();
    let updated = pool.get("a").await.unwrap();
    assert!(updated.model_states.contains_key("claude-opus"));
    assert_eq!(updated.quota.backoff_level, 1);
    assert_eq!(updated.auth.access_token.as_deref(), Some("new-token"));

    pool.register(cred("fresh", "claude")).await.unwrap();
    let fresh = pool.get("fresh").await.unwrap();
    assert!(fresh.model_states.is_empty());
    assert_eq!(fresh.quota.backoff_level, 0);
}

#[tokio::test]
async fn round_robin_pick_is_fair_across_bucket() {
    let claude = FakeExecutor::new("claude");
    let pool = pool_with(&[claude.clone()], 0, 0);
    for id in ["a", "b", "c"] {
        pool.register(cred(id, "claude")).await.unwrap();
    }

    let tried = HashSet::new();
    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..7 {
        let picked = pool
            .pick(&providers(&["claude"]), "claude-opus", &tried)
            .await
            .unwrap()
            .unwrap();
        *counts.entry(picked.auth.id).or_default() += 1;
    }
    for id in ["a", "b", "c"] {
        let count = counts.get(id).copied().unwrap_or(0);
        assert!((2..=3).contains(&count), "{id} picked {count} times");
    }
}

#[tokio::test]
async fn higher_priority_bucket_wins() {
    let claude = FakeExecutor::new("claude");
    let pool = pool_with(&[claude.clone()], 0, 0);
    let mut preferred = cred("z-preferred", "claude");
    preferred
        .token_data
        .insert("priority".to_string(), json!(5));
    pool.register(preferred).await.unwrap();
    pool.register(cred("a-default", "claude")).await.unwrap();

    let tried = HashSet::new();
    for _ in 0..3 {
        let picked = pool
            .pick(&providers(&["claude"]), "claude-opus", &tried)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked.auth.id, "z-preferred");
    }
}

#[tokio::test]
async fn cancellation_during_cooldown_sleep_propagates() {
    let claude = FakeExecutor::new("claude");
    let pool = pool_with(&[claude.clone()], 1, 30_000);
    pool.register(cred("a", "claude")).await.unwrap();
    precool(&pool, "a", "claude-opus", 10_000).await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn cancelled_in_flight_attempt_records_no_result() {
    let claude = FakeExecutor::new("claude");
    claude.script("a", Step::Hang { ms: 500 });
    let pool = pool_with(&[claude.clone()], 0, 0);
    pool.register(cred("a", "claude")).await.unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = pool
        .execute(
            &providers(&["claude"]),
            &request("claude-opus"),
            &ExecuteOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Cancelled));

    let snapshot = pool.get("a").await.unwrap();
    assert!(snapshot.model_states.is_empty());
    assert_eq!(snapshot.runtime_status, RuntimeStatus::Active);
}
