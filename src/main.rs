//! pooled-echo server entry point.

use pooled_echo::config::Config;
use pooled_echo::Server;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        buffer_size = config.buffer_size,
        io_timeout_secs = config.io_timeout.map(|t| t.as_secs()),
        "Starting pooled-echo server"
    );

    // Register before binding so an early signal is not lost
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    let server = Server::bind(&config)?.spawn()?;
    let summary = server.shutdown_on_signal(&mut signals)?;

    info!(
        reason = ?summary.exit,
        accepted = summary.acceptor.accepted,
        completed = summary.pool.completed,
        failed = summary.pool.failed,
        "Server stopped"
    );
    Ok(())
}
