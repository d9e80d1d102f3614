use std::net::SocketAddr;
use std::sync::Arc;

use genbi_core::{GenbiKernel, Settings, StaticExecutors};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;

use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if settings.embedding_base_url.is_none() {
        info!(dim = settings.embed_dim, "no embedding endpoint configured, using hashed embeddings");
    }

    // Database connections are supplied by the embedding host; the standalone server
    // registers none, so /v1/ask answers 404 until one does.
    let executors = Arc::new(StaticExecutors::new());
    let kernel = Arc::new(GenbiKernel::from_settings(&settings, executors));

    let app = routes::router(AppState { kernel });

    let addr: SocketAddr = format!("{}:{}", settings.api_host, settings.api_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, model = %settings.llm_model, "GenBI HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
