use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotio_core::{AppState, DispatchFacade};
use quotio_provider_core::{CredentialPool, PoolConfig};
use quotio_provider_impl::{UpstreamClient, UpstreamClientConfig};
use quotio_storage::{FallbackConfig, FallbackWatcher, FileCredentialStore};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut patch = cli::Cli::parse().into_patch()?;
    if patch.data_dir.is_none() {
        patch.data_dir = quotio_storage::default_data_dir()
            .map(|dir| dir.to_string_lossy().into_owned());
    }
    let config = patch.into_config()?;
    let data_dir = PathBuf::from(&config.data_dir);

    let store = Arc::new(
        FileCredentialStore::open(&data_dir)
            .await
            .with_context(|| format!("open credential store under {}", data_dir.display()))?,
    );

    let client = Arc::new(
        UpstreamClient::new(UpstreamClientConfig {
            proxy: config.proxy.clone(),
            ..Default::default()
        })
        .map_err(|err| anyhow::anyhow!("build upstream client: {err}"))?,
    );
    let registry = Arc::new(quotio_provider_impl::default_registry(client.clone()));

    let pool = Arc::new(CredentialPool::new(
        registry.clone(),
        store.clone(),
        PoolConfig {
            strategy: config.strategy,
            retry_count: config.retry_count,
            max_retry_wait_ms: config.max_retry_wait_ms,
            ..Default::default()
        },
    ));
    let loaded = store.load_all().await?;
    for credential in loaded {
        pool.load(credential).await;
    }

    let fallback_path = data_dir.join(FallbackConfig::FILE_NAME);
    let fallback = Arc::new(ArcSwap::from_pointee(
        FallbackConfig::load(&fallback_path)
            .await
            .with_context(|| format!("load {}", fallback_path.display()))?,
    ));
    let _watcher = FallbackWatcher::spawn(fallback_path, fallback.clone())
        .map_err(|err| anyhow::anyhow!("watch fallback config: {err}"))?;

    let facade = DispatchFacade::new(pool.clone(), registry.clone(), client, fallback.clone());
    let state = Arc::new(AppState::new(
        config.clone(),
        facade,
        pool,
        registry,
        fallback,
    ));

    let app = quotio_router::proxy_router(state);
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "listening", address = %bind);
    axum_serve(listener, app).await
}

async fn axum_serve(listener: tokio::net::TcpListener, app: axum::Router) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(Into::into)
}
