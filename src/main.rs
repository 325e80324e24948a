//! websocket-server-async: a multi-threaded WebSocket echo server
//!
//! Every data message a client sends is echoed back unchanged, keeping its
//! text/binary classification, until the client closes the connection.
//!
//! Features:
//! - Fixed pool of worker threads shared by all connections
//! - One serialized task per connection; connections never observe each other
//! - Handshake and idle timeouts
//! - Configuration via positional CLI arguments and an optional TOML file

mod config;
mod listener;
mod message;
mod runtime;
mod session;

use config::Config;
use listener::Listener;
use runtime::Runtime;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How long outstanding sessions get to unwind on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let endpoint = config.endpoint();
    info!(
        endpoint = %endpoint,
        threads = config.threads.get(),
        handshake_timeout = ?config.session.handshake_timeout,
        idle_timeout = ?config.session.idle_timeout,
        "Starting websocket-server-async"
    );

    let runtime = Runtime::new(config.threads)?;

    let mut listener = Listener::new(runtime.handle(), endpoint, config.session);
    if !listener.is_open() {
        return Err(format!("could not listen on {endpoint}").into());
    }
    let bound = listener.local_addr();
    listener.start();

    info!(address = ?bound, "Server is started");

    runtime.run_until_stopped(shutdown_signal());

    info!(live_sessions = listener.live_sessions(), "Shutting down");
    runtime.shutdown(SHUTDOWN_GRACE);

    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed the server runs forever.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
