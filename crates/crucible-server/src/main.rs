//! crucible-server - WebSocket daemon for sandboxed code execution
//!
//! Accepts one invocation per session, hands it to the external isolation
//! backend, and streams output back while the program runs.

use anyhow::Result;
use clap::Parser;
use crucible_server::routes::{self, AppState};
use crucible_core::config::{self, BackendConfig};
use crucible_core::fingerprint::IpSalt;
use crucible_core::languages;
use futures_util::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crucible-server")]
#[command(about = "Run untrusted code in an external sandbox, streamed over WebSocket")]
struct Args {
    /// Listen address (also CRUCIBLE_BIND)
    #[arg(long, default_value_t = config::default_bind_address())]
    bind: String,

    /// Trust X-Real-IP from a reverse proxy for client fingerprinting
    #[arg(long)]
    trust_proxy: bool,

    /// Override the runners directory (also CRUCIBLE_RUNNERS)
    #[arg(long)]
    runners_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("crucible=info".parse()?))
        .init();

    let args = Args::parse();

    let mut backend = BackendConfig::from_env();
    if let Some(dir) = args.runners_dir {
        backend.runners_dir = dir;
    }

    for dir in [&backend.input_root, &backend.output_root] {
        config::check_dir(dir)?;
    }

    let languages = languages::load(&backend.runners_dir)?;
    tracing::info!(count = languages.len(), "language registry loaded");

    let state = AppState {
        languages: Arc::new(languages),
        salt: Arc::new(IpSalt::generate()),
        backend: Arc::new(backend),
        trust_proxy: args.trust_proxy,
    };

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!(addr = %args.bind, "listening");

    let signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();

    let app = routes::router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown(signals))
    .await?;

    signals_handle.close();
    Ok(())
}

async fn shutdown(mut signals: Signals) {
    if let Some(signal) = signals.next().await {
        tracing::info!(signal, "shutting down");
    }
}
