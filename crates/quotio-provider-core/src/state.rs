use std::collections::HashMap;

use time::{Duration, OffsetDateTime};

use crate::credential::{AuthStatus, StoredCredential};
use crate::errors::ExecuteError;

/// Base and ceiling for the exponential quota cooldown.
pub const QUOTA_BACKOFF_BASE_MS: u64 = 1_000;
pub const QUOTA_BACKOFF_CAP_MS: u64 = 30 * 60 * 1_000;

const AUTH_FAILURE_COOLDOWN: Duration = Duration::minutes(30);
const NOT_FOUND_COOLDOWN: Duration = Duration::hours(12);
const TRANSIENT_COOLDOWN: Duration = Duration::seconds(60);

/// `min(1s * 2^level, 30min)` in milliseconds.
pub fn quota_cooldown_ms(level: u32) -> u64 {
    QUOTA_BACKOFF_BASE_MS
        .saturating_mul(1u64 << level.min(31))
        .min(QUOTA_BACKOFF_CAP_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Active,
    Error,
    Disabled,
    Pending,
}

/// Per-credential (or per-credential-per-model) rate-limit tracking.
#[derive(Debug, Clone, Default)]
pub struct QuotaState {
    pub exceeded: bool,
    pub reason: Option<String>,
    /// Absent while `exceeded` means: retryable on the next selection pass.
    pub next_recover_at: Option<OffsetDateTime>,
    pub backoff_level: u32,
}

impl QuotaState {
    fn reset(&mut self) {
        self.exceeded = false;
        self.reason = None;
        self.next_recover_at = None;
        self.backoff_level = 0;
    }
}

/// A credential's runtime state for one model string.
///
/// Created lazily on the first failure for that model, never removed while
/// the pool lives.
#[derive(Debug, Clone)]
pub struct ModelState {
    pub status: RuntimeStatus,
    pub status_message: Option<String>,
    pub unavailable: bool,
    /// Absent while `unavailable` means: retry at the next opportunity.
    pub next_retry_after: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub quota: QuotaState,
    pub updated_at: OffsetDateTime,
}

impl ModelState {
    fn new(now: OffsetDateTime) -> Self {
        Self {
            status: RuntimeStatus::Active,
            status_message: None,
            unavailable: false,
            next_retry_after: None,
            last_error: None,
            quota: QuotaState::default(),
            updated_at: now,
        }
    }
}

/// Outcome record produced after each attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub retry_after_ms: Option<u64>,
    pub error: Option<ExecuteError>,
}

impl ExecutionResult {
    pub fn success(auth_id: &str, provider: &str, model: &str) -> Self {
        Self {
            auth_id: auth_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            success: true,
            retry_after_ms: None,
            error: None,
        }
    }

    pub fn failure(auth_id: &str, provider: &str, model: &str, error: ExecuteError) -> Self {
        Self {
            auth_id: auth_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            success: false,
            retry_after_ms: error.retry_after_ms(),
            error: Some(error),
        }
    }
}

/// One stored credential composed with its live state.
#[derive(Debug, Clone)]
pub struct RuntimeCredential {
    pub auth: StoredCredential,
    pub runtime_status: RuntimeStatus,
    pub status_message: Option<String>,
    pub unavailable: bool,
    pub next_retry_after: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub quota: QuotaState,
    pub model_states: HashMap<String, ModelState>,
    pub loaded_at: OffsetDateTime,
    pub runtime_updated_at: OffsetDateTime,
    pub last_refreshed_at: Option<OffsetDateTime>,
}

impl RuntimeCredential {
    pub fn new(auth: StoredCredential, now: OffsetDateTime) -> Self {
        let runtime_status = if auth.disabled || auth.status == AuthStatus::Disabled {
            RuntimeStatus::Disabled
        } else {
            RuntimeStatus::Active
        };
        Self {
            auth,
            runtime_status,
            status_message: None,
            unavailable: false,
            next_retry_after: None,
            last_error: None,
            quota: QuotaState::default(),
            model_states: HashMap::new(),
            loaded_at: now,
            runtime_updated_at: now,
            last_refreshed_at: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.auth.disabled || self.runtime_status == RuntimeStatus::Disabled
    }

    /// Replace the stored record while preserving live state.
    pub fn apply_update(&mut self, auth: StoredCredential, now: OffsetDateTime) {
        let disabled = auth.disabled || auth.status == AuthStatus::Disabled;
        self.auth = auth;
        if disabled {
            self.runtime_status = RuntimeStatus::Disabled;
        } else if self.runtime_status == RuntimeStatus::Disabled {
            self.runtime_status = RuntimeStatus::Active;
        }
        self.runtime_updated_at = now;
    }

    /// Token fields written back after an executor refresh.
    pub fn apply_refresh(&mut self, refreshed: StoredCredential, now: OffsetDateTime) {
        if refreshed.status == AuthStatus::Error {
            self.status_message = refreshed.status_message.clone();
            self.runtime_status = RuntimeStatus::Error;
        }
        self.auth = refreshed;
        self.last_refreshed_at = Some(now);
        self.runtime_updated_at = now;
    }

    pub fn record_success(&mut self, model: &str, now: OffsetDateTime) {
        if !model.is_empty()
            && let Some(state) = self.model_states.get_mut(model)
        {
            state.unavailable = false;
            state.status = RuntimeStatus::Active;
            state.status_message = None;
            state.last_error = None;
            state.next_retry_after = None;
            state.quota.reset();
            state.updated_at = now;
        }
        self.unavailable = false;
        self.runtime_status = RuntimeStatus::Active;
        self.status_message = None;
        self.last_error = None;
        self.next_retry_after = None;
        self.quota.reset();
        self.runtime_updated_at = now;
    }

    pub fn record_failure(
        &mut self,
        model: &str,
        status: u16,
        retry_after_ms: Option<u64>,
        message: &str,
        now: OffsetDateTime,
    ) {
        // 429 updates the credential-wide quota first so the model state can
        // inherit the recovery deadline.
        if status == 429 {
            self.quota.exceeded = true;
            self.quota.reason = Some("quota".to_string());
            match retry_after_ms {
                Some(ms) => {
                    self.quota.next_recover_at = Some(now + Duration::milliseconds(ms as i64));
                }
                None => {
                    let cooldown = quota_cooldown_ms(self.quota.backoff_level);
                    self.quota.next_recover_at = Some(now + Duration::milliseconds(cooldown as i64));
                    if cooldown < QUOTA_BACKOFF_CAP_MS {
                        self.quota.backoff_level += 1;
                    }
                }
            }
        }

        let next_retry_after = match status {
            429 => self.quota.next_recover_at,
            401 | 402 | 403 => Some(now + AUTH_FAILURE_COOLDOWN),
            404 => Some(now + NOT_FOUND_COOLDOWN),
            408 | 500 | 502 | 503 | 504 => Some(now + TRANSIENT_COOLDOWN),
            _ => None,
        };

        if !model.is_empty() {
            let state = self
                .model_states
                .entry(model.to_string())
                .or_insert_with(|| ModelState::new(now));
            state.unavailable = true;
            state.status = RuntimeStatus::Error;
            state.status_message = Some(message.to_string());
            state.last_error = Some(message.to_string());
            state.next_retry_after = next_retry_after;
            state.updated_at = now;
            if status == 429 {
                state.quota.exceeded = true;
                state.quota.reason = Some("quota".to_string());
                state.quota.next_recover_at = self.quota.next_recover_at;
                state.quota.backoff_level = self.quota.backoff_level;
            }
        } else {
            self.unavailable = true;
            self.next_retry_after = next_retry_after;
        }

        self.runtime_status = RuntimeStatus::Error;
        self.status_message = Some(message.to_string());
        self.last_error = Some(message.to_string());
        self.runtime_updated_at = now;
    }

    /// The closest future instant at which this credential may recover for
    /// `model`, if any.
    pub fn next_recovery(&self, model: &str, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let mut earliest: Option<OffsetDateTime> = None;
        let mut consider = |candidate: Option<OffsetDateTime>| {
            if let Some(at) = candidate
                && at > now
                && earliest.is_none_or(|current| at < current)
            {
                earliest = Some(at);
            }
        };
        if let Some(state) = self.model_states.get(model) {
            consider(state.next_retry_after);
            consider(state.quota.next_recover_at);
        }
        consider(self.next_retry_after);
        consider(self.quota.next_recover_at);
        earliest
    }
}
