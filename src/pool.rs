//! Fixed-size worker pool fed by a bounded connection queue.
//!
//! Workers are long-lived threads created once by `WorkerPool::start`. Each
//! runs the same loop: dequeue a record, hand it to the connection handler,
//! drop it (closing the transport), repeat. The only exit path is queue
//! close during shutdown, after any queued records have been drained.
//!
//! Shutdown also interrupts connections that are still being serviced, so an
//! idle client cannot keep a worker parked in `read` and stall the join.

use crate::connection::{ConnectionRecord, Interrupt, PeerAddr, Transport};
use crate::handler::ConnectionHandler;
use crate::queue::{BoundedQueue, Closed};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pool sizing and per-connection limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum number of accepted connections waiting for a worker.
    pub queue_capacity: usize,
    /// Read/write timeout applied to each connection (None = block forever).
    pub io_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 4,
            io_timeout: None,
        }
    }
}

/// Pool construction and teardown errors.
#[derive(Debug)]
pub enum PoolError {
    /// Sizing parameters are unusable.
    InvalidConfig(&'static str),
    /// The OS refused to create a worker thread.
    Spawn { worker: usize, source: io::Error },
    /// A worker thread panicked outside the connection handler.
    WorkerPanicked { worker: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidConfig(msg) => write!(f, "Invalid pool configuration: {msg}"),
            PoolError::Spawn { worker, source } => {
                write!(f, "Failed to spawn worker {worker}: {source}")
            }
            PoolError::WorkerPanicked { worker } => write!(f, "Worker {worker} panicked"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Live counters, updated lock-free by the acceptor and workers.
#[derive(Debug, Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
}

/// Point-in-time view of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Connections accepted into the queue.
    pub submitted: u64,
    /// Connections that ended with a graceful peer close.
    pub completed: u64,
    /// Connections that ended with an I/O error or handler panic.
    pub failed: u64,
    /// Connections currently being serviced.
    pub active: usize,
    /// Connections waiting in the queue.
    pub queued: usize,
}

/// Interrupt handles for connections a worker is servicing.
#[derive(Default)]
struct InFlight {
    stopping: bool,
    conns: HashMap<u64, Box<dyn Interrupt>>,
}

/// State shared by the pool, its submitters and its workers.
struct Shared<S> {
    queue: BoundedQueue<ConnectionRecord<S>>,
    stats: PoolStats,
    next_id: AtomicU64,
    in_flight: Mutex<InFlight>,
}

impl<S> Shared<S> {
    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a connection so shutdown can unblock it. Once shutdown has
    /// started, the connection is interrupted straight away.
    fn register(&self, id: u64, interrupter: Box<dyn Interrupt>) {
        let mut in_flight = self.in_flight();
        if in_flight.stopping {
            interrupt(id, interrupter.as_ref());
        } else {
            in_flight.conns.insert(id, interrupter);
        }
    }

    fn unregister(&self, id: u64) {
        self.in_flight().conns.remove(&id);
    }

    fn interrupt_all(&self) {
        let mut in_flight = self.in_flight();
        in_flight.stopping = true;
        for (id, interrupter) in in_flight.conns.drain() {
            interrupt(id, interrupter.as_ref());
        }
    }
}

fn interrupt(id: u64, interrupter: &dyn Interrupt) {
    // The peer may already be gone; the worker sees the error either way.
    if let Err(e) = interrupter.interrupt() {
        debug!(conn = id, error = %e, "Failed to interrupt connection");
    }
}

/// Cloneable producer handle used by the acceptor.
pub struct Submitter<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Submitter<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> Submitter<S> {
    /// Queue an accepted connection, blocking while the queue is full.
    ///
    /// If the pool is shutting down the record is handed back; dropping it
    /// closes the connection.
    pub fn submit(&self, stream: S, peer: PeerAddr) -> Result<(), Closed<ConnectionRecord<S>>> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        // Counted before enqueue so a fast worker never overtakes the count.
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if let Err(rejected) = self
            .shared
            .queue
            .enqueue(ConnectionRecord::new(id, stream, peer))
        {
            self.shared.stats.submitted.fetch_sub(1, Ordering::Relaxed);
            return Err(rejected);
        }
        Ok(())
    }

    /// Whether the pool has stopped accepting work.
    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }
}

/// A running set of worker threads.
pub struct WorkerPool<S> {
    shared: Arc<Shared<S>>,
    workers: Vec<(usize, JoinHandle<()>)>,
    config: PoolConfig,
}

impl<S: Transport> WorkerPool<S> {
    /// Create the queue and spawn `config.workers` worker threads.
    ///
    /// If any worker fails to spawn, the ones already running are stopped
    /// and joined before the error is returned.
    pub fn start<H>(config: PoolConfig, handler: H) -> Result<Self, PoolError>
    where
        H: ConnectionHandler<S>,
    {
        Self::start_with(config, handler, |name, body| {
            thread::Builder::new().name(name).spawn(body)
        })
    }

    fn start_with<H, F>(config: PoolConfig, handler: H, mut spawn: F) -> Result<Self, PoolError>
    where
        H: ConnectionHandler<S>,
        F: FnMut(String, Box<dyn FnOnce() + Send + 'static>) -> io::Result<JoinHandle<()>>,
    {
        if config.workers == 0 {
            return Err(PoolError::InvalidConfig("workers must be > 0"));
        }
        if config.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig("queue_capacity must be > 0"));
        }

        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(config.queue_capacity),
            stats: PoolStats::default(),
            next_id: AtomicU64::new(0),
            in_flight: Mutex::new(InFlight::default()),
        });
        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(config.workers);

        for worker_id in 0..config.workers {
            let shared_clone = Arc::clone(&shared);
            let handler = Arc::clone(&handler);
            let io_timeout = config.io_timeout;

            let body: Box<dyn FnOnce() + Send + 'static> = Box::new(move || {
                worker_loop(worker_id, &shared_clone, handler.as_ref(), io_timeout);
            });

            match spawn(format!("worker-{worker_id}"), body) {
                Ok(handle) => workers.push((worker_id, handle)),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Failed to spawn worker");
                    shared.queue.close();
                    for (_, handle) in workers {
                        let _ = handle.join();
                    }
                    return Err(PoolError::Spawn {
                        worker: worker_id,
                        source: e,
                    });
                }
            }
        }

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            io_timeout_ms = config.io_timeout.map(|t| t.as_millis() as u64),
            "Worker pool started"
        );

        Ok(Self {
            shared,
            workers,
            config,
        })
    }
}

impl<S> WorkerPool<S> {
    /// Producer handle for the acceptor.
    pub fn submitter(&self) -> Submitter<S> {
        Submitter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue an accepted connection. See `Submitter::submit`.
    pub fn submit(&self, stream: S, peer: PeerAddr) -> Result<(), Closed<ConnectionRecord<S>>> {
        self.submitter().submit(stream, peer)
    }

    /// Configuration the pool was started with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        let stats = &self.shared.stats;
        PoolStatsSnapshot {
            submitted: stats.submitted.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            active: stats.active.load(Ordering::Relaxed),
            queued: self.shared.queue.len(),
        }
    }

    /// Stop accepting new work without waiting for workers.
    ///
    /// Unblocks any submitter parked on a full queue.
    pub fn close(&self) {
        self.shared.queue.close();
    }

    /// Stop accepting work, drain the queue and join every worker.
    ///
    /// Connections still being serviced are interrupted, and so are queued
    /// ones as workers pick them up. Returns the final counters once every
    /// worker has exited.
    pub fn shutdown(mut self) -> Result<PoolStatsSnapshot, PoolError> {
        info!(queued = self.shared.queue.len(), "Shutting down worker pool");
        self.close_and_join()?;
        Ok(self.stats())
    }

    fn close_and_join(&mut self) -> Result<(), PoolError> {
        self.shared.queue.close();
        self.shared.interrupt_all();

        let mut result = Ok(());
        for (worker_id, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(worker = worker_id, "Worker panicked");
                if result.is_ok() {
                    result = Err(PoolError::WorkerPanicked { worker: worker_id });
                }
            }
        }
        result
    }
}

impl<S> Drop for WorkerPool<S> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.close_and_join();
        }
    }
}

fn worker_loop<S, H>(worker_id: usize, shared: &Shared<S>, handler: &H, io_timeout: Option<Duration>)
where
    S: Transport,
    H: ConnectionHandler<S>,
{
    debug!(worker = worker_id, "Worker started");

    while let Some(mut conn) = shared.queue.dequeue() {
        shared.stats.active.fetch_add(1, Ordering::Relaxed);
        debug!(worker = worker_id, conn = conn.id, peer = %conn.peer, "Servicing connection");

        let result = match prepare(shared, &conn, io_timeout) {
            Ok(()) => panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut conn))),
            Err(e) => Ok(Err(e)),
        };
        shared.unregister(conn.id);

        match result {
            Ok(Ok(outcome)) => {
                shared.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker = worker_id,
                    conn = conn.id,
                    peer = %conn.peer,
                    bytes = outcome.bytes_echoed,
                    chunks = outcome.chunks,
                    "Connection closed"
                );
            }
            Ok(Err(e)) => {
                shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                debug!(worker = worker_id, conn = conn.id, peer = %conn.peer, error = %e, "Connection error");
            }
            Err(_) => {
                shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = worker_id, conn = conn.id, peer = %conn.peer, "Connection handler panicked");
            }
        }

        conn.close();
        drop(conn);
        shared.stats.active.fetch_sub(1, Ordering::Relaxed);
    }

    debug!(worker = worker_id, "Worker stopped");
}

/// Apply timeouts and register the connection for shutdown interruption.
fn prepare<S: Transport>(
    shared: &Shared<S>,
    conn: &ConnectionRecord<S>,
    io_timeout: Option<Duration>,
) -> io::Result<()> {
    apply_timeouts(&conn.stream, io_timeout)?;
    shared.register(conn.id, conn.stream.interrupter()?);
    Ok(())
}

fn apply_timeouts<S: Transport>(stream: &S, timeout: Option<Duration>) -> io::Result<()> {
    if timeout.is_some() {
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
    }
    Ok(())
}
