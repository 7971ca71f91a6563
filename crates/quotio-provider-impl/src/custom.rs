use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use quotio_protocol::openai::rewrite_model;
use quotio_provider_core::{
    ChunkStream, ExecuteError, ExecuteOptions, ExecuteRequest, HttpRequestParts, ProviderExecutor,
    StoredCredential, base_model_name,
};

use crate::client::UpstreamClient;
use crate::headers::{HeaderList, bearer_token, build_url, set_bearer, set_json_headers};
use crate::stream::guard_sse_errors;

const PROVIDER_NAME: &str = "custom";

/// Generic OpenAI-compatible endpoint; `token_data.base_url` is mandatory
/// since there is no meaningful default to dial.
pub struct CustomExecutor {
    client: Arc<UpstreamClient>,
}

impl CustomExecutor {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        Self { client }
    }

    fn endpoint(&self, auth: &StoredCredential) -> Result<String, ExecuteError> {
        let base = auth.base_url().ok_or_else(|| {
            ExecuteError::status_error(
                500,
                "custom credential is missing token_data.base_url",
                Vec::new(),
            )
        })?;
        Ok(build_url(Some(base), base, "/v1/chat/completions"))
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
impl ProviderExecutor for CustomExecutor {
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
        let url = self.endpoint(auth)?;
        let headers = self.auth_headers(auth)?;
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
        let url = self.endpoint(auth)?;
        let headers = self.auth_headers(auth)?;
        let raw = self
            .client
            .send_stream("POST", &url, &headers, Some(self.payload_for(req)), cancel)
            .await?;
        Ok(guard_sse_errors(raw))
    }

    async fn refresh(&self, auth: StoredCredential) -> StoredCredential {
        // Plain API keys: nothing to refresh.
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
