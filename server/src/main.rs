//! Pipecast Server - Main entry point.
//!
//! This binary starts the Pipecast hub with:
//! - Structured JSON logging
//! - A broadcast producer fed from standard input
//! - Graceful shutdown on SIGTERM/SIGINT or when the input ends
//!
//! # Configuration
//!
//! See [`pipecast_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! tail -f /var/log/app.log | \
//!     PIPECAST_JWT_SECRET="secret key" PORT=3000 \
//!     cargo run --release --bin pipecast-server
//! ```

use std::future::IntoFuture;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use pipecast_server::broadcast::ProducerExit;
use pipecast_server::config::Config;
use pipecast_server::error::{Result, ServerError};
use pipecast_server::routes::{create_router, AppState};

/// How long open WebSocket connections may linger after shutdown starts.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start async runtime");
            return ExitCode::from(1);
        }
    };

    let code = runtime.block_on(async_main());

    // A pending stdin read cannot be cancelled; do not wait for its thread.
    runtime.shutdown_background();
    code
}

async fn async_main() -> ExitCode {
    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  PIPECAST_JWT_SECRET - HMAC secret for client tokens");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                - HTTP server port (default: 3000)");
            eprintln!("  PIPECAST_WS_PATH    - WebSocket endpoint path (default: /ws)");
            eprintln!("  RUST_LOG            - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "Server stopped with an error");
            eprintln!("Error: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    if std::io::stdin().is_terminal() {
        return Err(ServerError::input(
            "no pipe: standard input must be a pipe or file, not a terminal",
        ));
    }

    info!(
        port = config.port,
        ws_path = %config.ws_path,
        "Pipecast server starting"
    );

    let state = AppState::new(config.clone());

    let producer = state
        .producer()
        .spawn(BufReader::new(tokio::io::stdin()));
    info!("Broadcast producer started on standard input");

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| ServerError::bind(&bind_addr, err))?;
    info!(port = config.port, address = %bind_addr, "Server listening");

    let stopping = Arc::new(Notify::new());
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let stopping = Arc::clone(&stopping);
        async move {
            shutdown_signal(producer).await;
            stopping.notify_one();
        }
    });

    // WebSocket clients keep graceful shutdown waiting until they leave.
    let deadline = async {
        stopping.notified().await;
        tokio::time::sleep(GRACEFUL_SHUTDOWN_TIMEOUT).await;
    };

    tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| ServerError::internal(err.to_string()))?;
        }
        _ = deadline => {
            warn!(
                timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
                "Graceful shutdown timed out, dropping remaining connections"
            );
        }
    }

    info!("Server shutting down gracefully");
    Ok(())
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when the server should stop.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
/// - the broadcast producer finishing, since nothing more can be relayed
async fn shutdown_signal(producer: JoinHandle<ProducerExit>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        exit = producer => match exit {
            Ok(ProducerExit::EndOfStream { lines }) => {
                info!(lines, "Input ended, initiating graceful shutdown");
            }
            Ok(ProducerExit::ReadError { lines, error }) => {
                warn!(lines, error = %error, "Input failed, initiating graceful shutdown");
            }
            Err(err) => {
                error!(error = %err, "Broadcast producer task failed");
            }
        },
    }
}
