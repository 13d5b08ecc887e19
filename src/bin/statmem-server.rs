use statmem::{api, Engine, EngineConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1);
    let config = EngineConfig::load(config_path.as_deref())?;

    let engine = Arc::new(Engine::new(config).await?);
    api::serve(engine).await
}
