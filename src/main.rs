use clap::Parser;
use connect_proxy::{bind_and_run, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    config.validate()?;

    if config.username.is_none() {
        tracing::warn!("no credentials configured, running as an open proxy");
    }
    if !config.forwarding_enabled() {
        tracing::info!("plain-HTTP forwarding disabled, serving CONNECT only");
    }

    let state = AppState::new(&config);
    tracing::info!("Starting Proxy Server at: {}", config.bind);

    tokio::select! {
        result = bind_and_run(state, config.bind) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, closing listener");
        }
    }

    Ok(())
}
