use time::OffsetDateTime;

use quotio_protocol::openai::ErrorBody;
use quotio_provider_core::PoolError;

/// An HTTP-shaped failure: the router turns this into a response verbatim.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ProxyError {
    pub fn new(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::new(code, message).to_bytes(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "invalid_request", message)
    }

    pub fn no_provider() -> Self {
        Self::new(400, "no_provider", "no provider resolved for the requested model")
    }

    pub fn unauthorized() -> Self {
        Self::new(401, "invalid_api_key", "missing or invalid api key")
    }

    /// Render a pool failure. Cooldowns carry the machine-readable reset
    /// fields so clients can schedule their retry.
    pub fn from_pool(err: PoolError, model: &str) -> Self {
        match err {
            PoolError::ModelCooldown {
                model,
                provider,
                reset_at,
                reset_seconds,
            } => {
                let mut body = ErrorBody::new(
                    "model_cooldown",
                    format!("model {model} is cooling down, retry in {reset_seconds}s"),
                );
                body.error.model = Some(model);
                body.error.provider = provider;
                body.error.reset_time = Some(reset_at.unix_timestamp());
                body.error.reset_seconds = Some(reset_seconds);
                Self {
                    status: 429,
                    body: body.to_bytes(),
                }
            }
            PoolError::NoAuthAvailable => {
                let mut body =
                    ErrorBody::new("no_auth_available", "no credential available for request");
                body.error.model = Some(model.to_string());
                Self {
                    status: 500,
                    body: body.to_bytes(),
                }
            }
            PoolError::Cancelled => Self::new(499, "cancelled", "request cancelled"),
            PoolError::Upstream(err) => {
                let mut body = ErrorBody::new("upstream_error", err.message.clone());
                body.error.model = Some(model.to_string());
                Self {
                    status: err.status,
                    body: body.to_bytes(),
                }
            }
        }
    }
}

/// Shared clock helper for reset-time rendering in tests.
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
