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
use crate::headers::{HeaderList, build_url, set_bearer, set_header, set_json_headers};
use crate::stream::guard_sse_errors;

const PROVIDER_NAME: &str = "claude";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

pub struct AnthropicExecutor {
    client: Arc<UpstreamClient>,
}

impl AnthropicExecutor {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        Self { client }
    }

    fn endpoint(&self, auth: &StoredCredential, path: &str) -> String {
        build_url(auth.base_url(), DEFAULT_BASE_URL, path)
    }

    /// API-key credentials authenticate with `x-api-key`; OAuth credentials
    /// use a bearer token.
    fn auth_headers(&self, auth: &StoredCredential) -> Result<HeaderList, ExecuteError> {
        let mut headers = Vec::new();
        set_json_headers(&mut headers);
        set_header(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        if let Some(api_key) = auth.api_key() {
            set_header(&mut headers, "x-api-key", api_key);
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

    fn payload_for(&self, req: &ExecuteRequest) -> Bytes {
        let model = base_model_name(&req.model);
        match rewrite_model(&req.payload, model) {
            Some(rewritten) => Bytes::from(rewritten),
            None => req.payload.clone(),
        }
    }
}

#[async_trait]
impl ProviderExecutor for AnthropicExecutor {
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
        let url = self.endpoint(auth, "/v1/messages");
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
        let url = self.endpoint(auth, "/v1/messages");
        let raw = self
            .client
            .send_stream("POST", &url, &headers, Some(self.payload_for(req)), cancel)
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
        let url = self.endpoint(auth, "/v1/messages/count_tokens");
        let response = self
            .client
            .send("POST", &url, &headers, Some(self.payload_for(req)), cancel)
            .await?;
        Ok(response.body)
    }

    async fn refresh(&self, mut auth: StoredCredential) -> StoredCredential {
        let Some(refresh_token) = auth.refresh_token.clone().filter(|t| !t.is_empty()) else {
            auth.status = AuthStatus::Error;
            auth.status_message = Some("no refresh token".to_string());
            auth.updated_at = OffsetDateTime::now_utc();
            return auth;
        };

        let url = self.endpoint(&auth, "/v1/oauth/token");
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
                &url,
                &headers,
                Some(Bytes::from(payload.to_string())),
                &cancel,
            )
            .await;
        match result.and_then(|response| {
            serde_json::from_slice::<Value>(&response.body)
                .map_err(|err| ExecuteError::transport(format!("invalid token response: {err}")))
        }) {
            Ok(tokens) => {
                let Some(access_token) = tokens.get("access_token").and_then(Value::as_str) else {
                    auth.status = AuthStatus::Error;
                    auth.status_message =
                        Some("token response missing access_token".to_string());
                    auth.updated_at = OffsetDateTime::now_utc();
                    return auth;
                };
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
            Err(err) => {
                warn!(event = "claude_refresh_failed", id = %auth.id, error = %err);
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
