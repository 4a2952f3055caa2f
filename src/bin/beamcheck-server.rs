//! HTTP server for the beam deflection workflow.
//!
//! Configuration comes from `BEAMCHECK__*` environment variables; logging is
//! controlled with `RUST_LOG` (default `info`).

use std::sync::Arc;

use beamcheck::api::{self, ApiState};
use beamcheck::{
    Config, Dispatcher, InMemoryCatalog, InMemoryStorage, ReqwestHttpClient, RequestService,
    ResultCallback, Storage,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let catalog = match &config.catalog_path {
        Some(path) => InMemoryCatalog::from_json_file(path)?,
        None => {
            tracing::warn!("No catalog_path configured, starting with an empty beam catalog");
            InMemoryCatalog::new()
        }
    };
    tracing::info!(beams = catalog.len(), "Beam catalog loaded");
    let catalog = Arc::new(catalog);

    #[cfg(feature = "postgres")]
    {
        if let Some(url) = config.database_url.clone() {
            let pool = sqlx::PgPool::connect(&url).await?;
            beamcheck::migrator().run(&pool).await?;
            tracing::info!("Using PostgreSQL storage");
            let storage = Arc::new(beamcheck::PostgresStorage::new(pool));
            return serve(config, storage, catalog).await;
        }
    }

    tracing::info!("Using in-memory storage");
    serve(config, Arc::new(InMemoryStorage::new()), catalog).await
}

async fn serve<S>(config: Config, storage: Arc<S>, catalog: Arc<InMemoryCatalog>) -> anyhow::Result<()>
where
    S: Storage + 'static,
{
    let http_client = Arc::new(ReqwestHttpClient::new(config.connect_timeout())?);
    let dispatcher = Arc::new(Dispatcher::spawn(
        &config,
        storage.clone(),
        catalog.clone(),
        http_client,
    ));

    let state = ApiState {
        service: RequestService::new(storage.clone(), catalog.clone(), dispatcher.clone()),
        callback: Arc::new(ResultCallback::new(
            storage,
            catalog,
            config.callback_token.clone(),
        )),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        dispatch = dispatcher.mode().as_str(),
        "HTTP server ready and accepting connections"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining");
}
