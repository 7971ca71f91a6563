use std::sync::Arc;

use arc_swap::ArcSwap;

use quotio_common::GlobalConfig;
use quotio_provider_core::{CredentialPool, ExecutorRegistry};
use quotio_storage::FallbackConfig;

use crate::auth::ApiKeyAuth;
use crate::facade::DispatchFacade;

/// Everything the HTTP surface needs, assembled once at startup.
pub struct AppState {
    pub config: GlobalConfig,
    pub auth: ApiKeyAuth,
    pub facade: DispatchFacade,
    pub pool: Arc<CredentialPool>,
    pub registry: Arc<ExecutorRegistry>,
    pub fallback: Arc<ArcSwap<FallbackConfig>>,
}

impl AppState {
    pub fn new(
        config: GlobalConfig,
        facade: DispatchFacade,
        pool: Arc<CredentialPool>,
        registry: Arc<ExecutorRegistry>,
        fallback: Arc<ArcSwap<FallbackConfig>>,
    ) -> Self {
        let auth = ApiKeyAuth::new(config.api_keys.clone());
        Self {
            config,
            auth,
            facade,
            pool,
            registry,
            fallback,
        }
    }
}
