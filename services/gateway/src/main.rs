// souk-gateway: one worker process of the classifieds/chat backend.
//
// Run several per host; they share the listen port via SO_REUSEPORT and
// coordinate through Redis.

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "souk-gateway", about = "Real-time classifieds/chat gateway worker")]
struct Args {
    /// Path to the gateway TOML config.
    #[arg(long, default_value = "/etc/souk/gateway.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let cfg = match gateway::config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let tls = match &cfg.tls {
        Some(tls_cfg) => {
            let _ = rustls::crypto::ring::default_provider().install_default();
            match gateway::acceptor::load_tls(&tls_cfg.cert_file, &tls_cfg.key_file) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    eprintln!("FATAL: failed to load TLS material: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => None,
    };

    let bind_addr = match cfg.server.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("FATAL: invalid bind address '{}': {e}", cfg.server.bind);
            std::process::exit(1);
        }
    };
    let listener = match gateway::acceptor::bind(bind_addr, cfg.server.backlog) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", cfg.server.bind);
            std::process::exit(1);
        }
    };
    info!(addr = %cfg.server.bind, "listener bound");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    gateway::worker::run_gateway(cfg, listener, tls, shutdown_rx).await;
    info!("gateway stopped");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
