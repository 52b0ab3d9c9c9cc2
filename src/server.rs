//! Echo server: binds the listener, starts the worker pool, runs the acceptor.
//!
//! Startup failures (bind, pool spawn) are returned before any connection is
//! accepted. After that, individual connection or accept failures are only
//! logged; the server keeps running until it is shut down.

use crate::acceptor::{Acceptor, AcceptorExit, AcceptorHandle, AcceptorStats};
use crate::config::Config;
use crate::connection::PeerAddr;
use crate::handler::EchoHandler;
use crate::listener::{ListenAddr, Listener, Stream};
use crate::pool::{PoolConfig, PoolError, PoolStatsSnapshot, WorkerPool};
use signal_hook::iterator::Signals;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Server startup and shutdown errors
#[derive(Debug)]
pub enum ServerError {
    Bind(String, io::Error),
    Pool(PoolError),
    AcceptorSpawn(io::Error),
    AcceptorPanicked,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to listen on '{addr}': {e}"),
            ServerError::Pool(e) => write!(f, "{e}"),
            ServerError::AcceptorSpawn(e) => write!(f, "Failed to spawn acceptor: {e}"),
            ServerError::AcceptorPanicked => f.write_str("Acceptor thread panicked"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) | ServerError::AcceptorSpawn(e) => Some(e),
            ServerError::Pool(e) => Some(e),
            ServerError::AcceptorPanicked => None,
        }
    }
}

impl From<PoolError> for ServerError {
    fn from(e: PoolError) -> Self {
        ServerError::Pool(e)
    }
}

/// Final counters reported after shutdown.
#[derive(Debug, Clone, Copy)]
pub struct ServerSummary {
    pub exit: AcceptorExit,
    pub acceptor: AcceptorStats,
    pub pool: PoolStatsSnapshot,
}

/// Bound server, ready to accept.
pub struct Server {
    listener: Arc<Listener>,
    pool: WorkerPool<Stream>,
    local_addr: PeerAddr,
}

impl Server {
    /// Bind the listening socket and start the worker pool.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = ListenAddr::parse(&config.listen);
        let listener = Listener::bind(&addr, config.backlog)
            .map_err(|e| ServerError::Bind(config.listen.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(config.listen.clone(), e))?;

        let pool = WorkerPool::start(
            PoolConfig {
                workers: config.workers,
                queue_capacity: config.queue_capacity,
                io_timeout: config.io_timeout,
            },
            EchoHandler::new(config.buffer_size),
        )?;

        info!(addr = %local_addr, "Server ready");

        Ok(Server {
            listener: Arc::new(listener),
            pool,
            local_addr,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local_addr
    }

    /// Run the acceptor on a background thread.
    pub fn spawn(self) -> Result<RunningServer, ServerError> {
        let acceptor = Acceptor::new(Arc::clone(&self.listener), self.pool.submitter());
        let handle = acceptor.handle();

        let thread = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || acceptor.run())
            .map_err(ServerError::AcceptorSpawn)?;

        Ok(RunningServer {
            handle,
            thread,
            pool: self.pool,
            local_addr: self.local_addr,
            _listener: self.listener,
        })
    }
}

/// Server whose acceptor runs on its own thread.
pub struct RunningServer {
    handle: AcceptorHandle<Listener>,
    thread: JoinHandle<(AcceptorExit, AcceptorStats)>,
    pool: WorkerPool<Stream>,
    local_addr: PeerAddr,
    _listener: Arc<Listener>,
}

impl RunningServer {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local_addr
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.pool.stats()
    }

    /// Block until one of the registered signals arrives, then shut down.
    pub fn shutdown_on_signal(self, signals: &mut Signals) -> Result<ServerSummary, ServerError> {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal");
        }
        self.shutdown()
    }

    /// Stop accepting, drain queued connections and join every thread.
    ///
    /// Connections still open are shut down rather than waited on.
    pub fn shutdown(self) -> Result<ServerSummary, ServerError> {
        info!("Shutting down server");

        self.handle.stop();
        // Unblocks an acceptor parked on a full queue.
        self.pool.close();

        let (exit, acceptor_stats) = self.thread.join().map_err(|_| {
            error!("Acceptor thread panicked");
            ServerError::AcceptorPanicked
        })?;

        let pool_stats = self.pool.shutdown()?;
        Ok(ServerSummary {
            exit,
            acceptor: acceptor_stats,
            pool: pool_stats,
        })
    }
}
