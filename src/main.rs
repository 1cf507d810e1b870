use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use speech_relay::relay::{RelayConfig, SpeechRelay};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "speech-relay")]
#[command(about = "Relays speech-detection calls to a recognition backend over WebSocket")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Address to serve the inbound HTTP surface on
    #[arg(long, default_value = "127.0.0.1:9098")]
    pub listen: SocketAddr,

    /// WebSocket URL of the recognition backend
    #[arg(long, default_value = speech_relay::DEFAULT_BACKEND_URL)]
    pub backend_url: String,

    /// Service path invoked on the backend
    #[arg(long, default_value = speech_relay::DEFAULT_SERVICE_PATH)]
    pub service: String,

    /// Directory where uploaded audio assets live
    #[arg(long, default_value = speech_relay::DEFAULT_STORE_DIR)]
    pub store_dir: String,

    /// Per-call deadline in seconds
    #[arg(long, default_value_t = speech_relay::DEFAULT_CALL_TIMEOUT_SECS)]
    pub call_timeout: u64,

    /// Base length of correlation tokens
    #[arg(long, default_value_t = speech_relay::DEFAULT_TOKEN_LENGTH)]
    pub token_length: usize,

    /// Interval between statistics log lines in seconds
    #[arg(long, default_value = "30")]
    pub stats_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level: tracing::Level = args.log_level.into();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("speech-relay {} starting", speech_relay::VERSION);

    tokio::fs::create_dir_all(&args.store_dir)
        .await
        .with_context(|| format!("failed to create store directory {}", args.store_dir))?;

    let relay = Arc::new(SpeechRelay::new(RelayConfig {
        backend_url: args.backend_url.clone(),
        service_path: args.service.clone(),
        store_dir: args.store_dir.clone(),
        call_timeout: Duration::from_secs(args.call_timeout),
        token_length: args.token_length,
    }));

    let stats_handle = spawn_stats_reporter(Arc::clone(&relay), args.stats_interval);

    let app = speech_relay::http::router(Arc::clone(&relay));
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(
        "serving on {} (backend {}, service {}, deadline {}s)",
        args.listen, args.backend_url, args.service, args.call_timeout
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    stats_handle.abort();
    relay.shutdown().await;
    info!("speech-relay stopped");
    Ok(())
}

/// Log correlation-table statistics periodically while calls are in flight
fn spawn_stats_reporter(relay: Arc<SpeechRelay>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let stats = relay.stats().await;
            if stats.registered > 0 {
                info!("{}", stats);
            }
        }
    })
}

/// Resolve when the process is asked to stop
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received TERM signal"),
    }
}
