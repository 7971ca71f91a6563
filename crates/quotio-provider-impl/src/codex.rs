use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use quotio_protocol::openai::rewrite_model;
use quotio_provider_core::{
    AuthStatus, ChunkStream, ExecuteError, ExecuteOptions, ExecuteRequest, HttpRequestParts,
    ProviderExecutor, StoredCredential, base_model_name,
};

use crate::client::UpstreamClient;
use crate::headers::{HeaderList, bearer_token, build_url, set_bearer, set_json_headers};
use crate::stream::guard_sse_errors;

const PROVIDER_NAME: &str = "codex";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// OpenAI-dialect executor for codex accounts. The inbound surface already
/// speaks this dialect, so the payload passes through untouched apart from
/// the model rewrite.
pub struct CodexExecutor {
    client: Arc<UpstreamClient>,
}

impl CodexExecutor {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        Self { client }
    }

    fn auth_headers(&self, auth: &StoredCredential) -> Result<HeaderList, ExecuteError> {
        let mut headers = Vec::new();
        set_json_headers(&mut headers);
        set_bearer(&mut headers, bearer_token(auth)?);
        Ok(headers)
    }

    fn payload_for(&self, req: &ExecuteRequest) -> Bytes {
        match rewrite_model(&req.payload, base_model_name(&req.model)) {
            Some(rewritten) => Bytes::from(rewritten),
            None => req.payload.clone(),
        }
    }
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
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
        let url = build_url(auth.base_url(), DEFAULT_BASE_URL, "/v1/chat/completions");
        let response = self
            .client
            .send("POST", &url, &headers, Some(self.payload_for(req)), cancel)
            .await?;
        Ok(response.body)
    }

    async fn execute_stream(
        &self,
        auth: &StoredCredential,
        req: &ExecuteRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError> {
        let headers = self.auth_headers(auth)?;
        let url = build_url(auth.base_url(), DEFAULT_BASE_URL, "/v1/chat/completions");
        let raw = self
            .client
            .send_stream("POST", &url, &headers, Some(self.payload_for(req)), cancel)
            .await?;
        Ok(guard_sse_errors(raw))
    }

    async fn refresh(&self, mut auth: StoredCredential) -> StoredCredential {
        let Some(refresh_token) = auth.refresh_token.clone().filter(|t| !t.is_empty()) else {
            // API-key accounts have nothing to refresh.
            return auth;
        };

        let payload = serde_json::json!({
            "grant_type": "refresh_token",
            "client_id": OAUTH_CLIENT_ID,
            "refresh_token": refresh_token,
        });
        let mut headers = Vec::new();
        set_json_headers(&mut headers);

        let cancel = CancellationToken::new();
        let result = self
            .client
            .send(
                "POST",
                TOKEN_URL,
                &headers,
                Some(Bytes::from(payload.to_string())),
                &cancel,
            )
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
                    if let Some(refresh) = tokens.get("refresh_token").and_then(Value::as_str) {
                        auth.refresh_token = Some(refresh.to_string());
                    }
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
                warn!(event = "codex_refresh_failed", id = %auth.id, error = %err);
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
        set_bearer(&mut req.headers, bearer_token(auth)?);
        Ok(())
    }
}
