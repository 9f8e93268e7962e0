use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use twin_daemon::{router, AppState};
use twin_runner::{Config, TwinContext, DEFAULT_CONFIG_PATH};

#[derive(Debug, Parser)]
#[command(name = "twin-daemon", version, about = "Digital-twin state synchronization daemon")]
struct Cli {
    /// TOML configuration file. Missing file means built-in defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Where the HTTP API listens, e.g. 127.0.0.1:5678. Overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Write the effective configuration to --config and exit.
    #[arg(long, default_value_t = false)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.daemon.listen = listen;
    }
    if cli.write_config {
        config.save_to(&cli.config)?;
        info!(path = %cli.config.display(), "wrote configuration");
        return Ok(());
    }

    let addr: SocketAddr = config.daemon.listen.parse()?;
    info!(vm = %config.vm.name, state_dir = %config.state_dir().display(), "starting twin daemon");
    let ctx = tokio::task::spawn_blocking(move || TwinContext::open(config)).await??;

    let app = router(AppState::new(Arc::new(ctx)));
    info!("listening on http://{}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
}
