use anyhow::Result;
use clap::Parser;
use inbetween_core::LoaderRegistry;
use inbetween_server::{run, Args};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    run(Args::parse(), LoaderRegistry::default()).await
}
