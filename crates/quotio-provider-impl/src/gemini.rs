use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use quotio_provider_core::{
    AuthStatus, ChunkStream, ExecuteError, ExecuteOptions, ExecuteRequest, HttpRequestParts,
    ProviderExecutor, StoredCredential, base_model_name,
};

use crate::client::UpstreamClient;
use crate::headers::{HeaderList, set_bearer, set_header, set_json_headers};
use crate::stream::guard_sse_errors;

const PROVIDER_NAME: &str = "gemini";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub struct GeminiExecutor {
    client: Arc<UpstreamClient>,
}

impl GeminiExecutor {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        Self { client }
    }

    /// `{base}/v1beta/models/{model}:{action}`, the generative-language REST
    /// shape. Streaming appends `alt=sse` so the response arrives as events.
    fn action_url(&self, auth: &StoredCredential, model: &str, action: &str, alt: Option<&str>) -> String {
        let base = auth
            .base_url()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let model = base_model_name(model);
        match alt {
            Some(alt) => format!("{base}/v1beta/models/{model}:{action}?$alt={alt}"),
            None => format!("{base}/v1beta/models/{model}:{action}"),
        }
    }

    fn auth_headers(&self, auth: &StoredCredential) -> Result<HeaderList, ExecuteError> {
        let mut headers = Vec::new();
        set_json_headers(&mut headers);
        if let Some(api_key) = auth.api_key() {
            set_header(&mut headers, "x-goog-api-key", api_key);
        } else if let Some(token) = auth.access_token.as_deref().filter(|t| !t.is_empty()) {
            set_bearer(&mut headers, token);
        } else {
            return Err(ExecuteError::status_error(
                401,
                "credential carries no usable token",
                Vec::new(),
            ));
        }
        Ok(headers)
    }
}

#[async_trait]
impl ProviderExecutor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn execute(
        &self,
        auth: &StoredCredential,
        req: &ExecuteRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        let headers = self.auth_headers(auth)?;
        let url = self.action_url(auth, &req.model, "generateContent", None);
        let response = self
            .client
            .send("POST", &url, &headers, Some(req.payload.clone()), cancel)
            .await?;
        Ok(response.body)
    }

    async fn execute_stream(
        &self,
        auth: &StoredCredential,
        req: &ExecuteRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError> {
        let headers = self.auth_headers(auth)?;
        let alt = opts.alt.as_deref().unwrap_or("sse");
        let url = self.action_url(auth, &req.model, "streamGenerateContent", Some(alt));
        let raw = self
            .client
            .send_stream("POST", &url, &headers, Some(req.payload.clone()), cancel)
            .await?;
        Ok(guard_sse_errors(raw))
    }

    async fn count_tokens(
        &self,
        auth: &StoredCredential,
        req: &ExecuteRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        let headers = self.auth_headers(auth)?;
        let url = self.action_url(auth, &req.model, "countTokens", None);
        let response = self
            .client
            .send("POST", &url, &headers, Some(req.payload.clone()), cancel)
            .await?;
        Ok(response.body)
    }

    async fn refresh(&self, mut auth: StoredCredential) -> StoredCredential {
        let refresh_token = auth.refresh_token.clone().filter(|t| !t.is_empty());
        let client_id = auth
            .token_data
            .get("client_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (Some(refresh_token), Some(client_id)) = (refresh_token, client_id) else {
            auth.status = AuthStatus::Error;
            auth.status_message = Some("missing refresh token or client_id".to_string());
            auth.updated_at = OffsetDateTime::now_utc();
            return auth;
        };
        let client_secret = auth
            .token_data
            .get("client_secret")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut form = format!(
            "grant_type=refresh_token&client_id={client_id}&refresh_token={refresh_token}"
        );
        if !client_secret.is_empty() {
            form.push_str(&format!("&client_secret={client_secret}"));
        }
        let headers = vec![(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        )];

        let cancel = CancellationToken::new();
        let result = self
            .client
            .send("POST", TOKEN_URL, &headers, Some(Bytes::from(form)), &cancel)
            .await
            .and_then(|response| {
                serde_json::from_slice::<Value>(&response.body).map_err(|err| {
                    ExecuteError::transport(format!("invalid token response: {err}"))
                })
            });
        match result {
            Ok(tokens) => match tokens.get("access_token").and_then(Value::as_str) {
                Some(access_token) => {
                    auth.access_token = Some(access_token.to_string());
                    if let Some(expires_in) = tokens.get("expires_in").and_then(Value::as_i64) {
                        auth.expires_at =
                            Some(OffsetDateTime::now_utc() + time::Duration::seconds(expires_in));
                    }
                    auth.status = AuthStatus::Ready;
                    auth.status_message = None;
                }
                None => {
                    auth.status = AuthStatus::Error;
                    auth.status_message =
                        Some("token response missing access_token".to_string());
                }
            },
            Err(err) => {
                warn!(event = "gemini_refresh_failed", id = %auth.id, error = %err);
                auth.status = AuthStatus::Error;
                auth.status_message = Some(format!("refresh failed: {err}"));
            }
        }
        auth.updated_at = OffsetDateTime::now_utc();
        auth
    }

    fn prepare_request(
        &self,
        auth: &StoredCredential,
        req: &mut HttpRequestParts,
    ) -> Result<(), ExecuteError> {
        let headers = self.auth_headers(auth)?;
        for (name, value) in headers {
            set_header(&mut req.headers, &name, &value);
        }
        Ok(())
    }
}
