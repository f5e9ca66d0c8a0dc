use quimpoll_server::{ServerConfig, start_server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quimpoll=info,quimpoll_server=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = ServerConfig::load()?;
    let handle = start_server(cfg).await?;
    // Park forever
    handle.await.ok();
    Ok(())
}
