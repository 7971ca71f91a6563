use time::OffsetDateTime;

pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteErrorKind {
    /// Non-2xx upstream response.
    Status,
    /// No HTTP response at all (connect, TLS, timeout, reset).
    Transport,
    Cancelled,
    Unsupported,
}

/// One failed attempt against one credential.
///
/// Always carries an HTTP-like status so the pool's cooldown table can key on
/// it even for transport-level failures.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} {status}: {message}")]
pub struct ExecuteError {
    pub kind: ExecuteErrorKind,
    pub status: u16,
    pub message: String,
    pub headers: Headers,
    pub retryable: bool,
}

impl ExecuteError {
    pub fn status_error(status: u16, message: impl Into<String>, headers: Headers) -> Self {
        Self {
            kind: ExecuteErrorKind::Status,
            status,
            message: message.into(),
            headers,
            retryable: is_retryable_status(status),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ExecuteErrorKind::Transport,
            status: 502,
            message: message.into(),
            headers: Vec::new(),
            retryable: true,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ExecuteErrorKind::Cancelled,
            status: 499,
            message: "request cancelled".to_string(),
            headers: Vec::new(),
            retryable: false,
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self {
            kind: ExecuteErrorKind::Unsupported,
            status: 501,
            message: format!("unsupported operation: {operation}"),
            headers: Vec::new(),
            retryable: false,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Upstream `retry-after` in milliseconds, when present and integral
    /// seconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        let value = self.header("retry-after")?.trim();
        if value.is_empty() {
            return None;
        }
        value.parse::<u64>().ok().map(|secs| secs * 1000)
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Errors surfaced by the pool to the dispatch facade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// Every candidate is blocked and every block is a cooldown.
    #[error("model {model} is cooling down, retry in {reset_seconds}s")]
    ModelCooldown {
        model: String,
        provider: Option<String>,
        reset_at: OffsetDateTime,
        reset_seconds: i64,
    },
    /// The attempt loop exhausted with no upstream error to surface.
    #[error("no credential available")]
    NoAuthAvailable,
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Upstream(#[from] ExecuteError),
}

impl PoolError {
    pub fn model_cooldown(model: &str, provider: Option<String>, reset_at: OffsetDateTime) -> Self {
        let wait_ms = (reset_at - OffsetDateTime::now_utc()).whole_milliseconds();
        let reset_seconds = if wait_ms <= 0 {
            0
        } else {
            ((wait_ms + 999) / 1000) as i64
        };
        PoolError::ModelCooldown {
            model: model.to_string(),
            provider,
            reset_at,
            reset_seconds,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            PoolError::ModelCooldown { .. } => 429,
            PoolError::NoAuthAvailable => 500,
            PoolError::Cancelled => 499,
            PoolError::Upstream(err) => err.status,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::ModelCooldown { .. } => true,
            PoolError::Upstream(err) => err.retryable,
            PoolError::NoAuthAvailable | PoolError::Cancelled => false,
        }
    }
}
