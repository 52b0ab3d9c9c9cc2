//! Acceptor loop: pulls connections from a source and submits them to the pool.
//!
//! `submit` blocks while the queue is full, which is where backpressure is
//! applied. While the acceptor is parked there the kernel keeps completing
//! handshakes up to the listen backlog.

use crate::listener::ConnectionSource;
use crate::pool::Submitter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why the acceptor loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorExit {
    /// `AcceptorHandle::stop` was called.
    Stopped,
    /// The pool stopped accepting work.
    PoolClosed,
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptorStats {
    pub accepted: u64,
    pub accept_errors: u64,
}

struct Control<C> {
    source: Arc<C>,
    stop: AtomicBool,
}

/// Handle used to stop a running acceptor from another thread.
pub struct AcceptorHandle<C> {
    control: Arc<Control<C>>,
}

impl<C> Clone for AcceptorHandle<C> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
        }
    }
}

impl<C: ConnectionSource> AcceptorHandle<C> {
    /// Ask the loop to exit and unblock a pending `accept`.
    pub fn stop(&self) {
        if self.control.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.control.source.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }
    }
}

/// Single-threaded accept loop.
pub struct Acceptor<C: ConnectionSource> {
    control: Arc<Control<C>>,
    submitter: Submitter<C::Stream>,
}

impl<C: ConnectionSource> Acceptor<C> {
    pub fn new(source: Arc<C>, submitter: Submitter<C::Stream>) -> Self {
        Self {
            control: Arc::new(Control {
                source,
                stop: AtomicBool::new(false),
            }),
            submitter,
        }
    }

    pub fn handle(&self) -> AcceptorHandle<C> {
        AcceptorHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Run until stopped or until the pool closes.
    ///
    /// Accept failures are logged and retried; they never end the loop.
    pub fn run(self) -> (AcceptorExit, AcceptorStats) {
        info!("Acceptor started");
        let mut stats = AcceptorStats::default();
        let mut consecutive_errors = 0u64;

        let exit = loop {
            if self.control.stop.load(Ordering::SeqCst) {
                break AcceptorExit::Stopped;
            }

            let (stream, peer) = match self.control.source.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    stats.accept_errors += 1;
                    consecutive_errors += 1;
                    if should_log_accept_error(consecutive_errors) {
                        warn!(
                            error = %e,
                            consecutive = consecutive_errors,
                            "Failed to accept connection"
                        );
                    }
                    continue;
                }
            };

            if consecutive_errors > 1 {
                info!(failures = consecutive_errors, "Accept recovered");
            }
            consecutive_errors = 0;

            // The wake-up connection from `stop` lands here; drop it.
            if self.control.stop.load(Ordering::SeqCst) {
                break AcceptorExit::Stopped;
            }

            debug!(peer = %peer, "New connection");
            stats.accepted += 1;

            if let Err(rejected) = self.submitter.submit(stream, peer) {
                let conn = rejected.into_inner();
                debug!(peer = %conn.peer, "Pool closed, dropping connection");
                break AcceptorExit::PoolClosed;
            }
        };

        info!(
            reason = ?exit,
            accepted = stats.accepted,
            accept_errors = stats.accept_errors,
            "Acceptor stopped"
        );
        (exit, stats)
    }
}

/// A persistent failure (e.g. EMFILE) repeats on every pass; only log
/// the 1st, 2nd, 4th, 8th... in a row.
fn should_log_accept_error(consecutive: u64) -> bool {
    consecutive.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionRecord, PeerAddr};
    use crate::handler::tests::{local_peer, MockStream};
    use crate::handler::{ConnectionHandler, EchoHandler, HandleOutcome};
    use crate::pool::{PoolConfig, WorkerPool};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    /// Scripted source: pops accept results, then parks until woken.
    struct ScriptedSource {
        script: Mutex<VecDeque<io::Result<Vec<u8>>>>,
        woken: Mutex<bool>,
        cv: std::sync::Condvar,
    }

    impl ScriptedSource {
        fn new(script: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                woken: Mutex::new(false),
                cv: std::sync::Condvar::new(),
            }
        }
    }

    impl ConnectionSource for ScriptedSource {
        type Stream = MockStream;

        fn accept(&self) -> io::Result<(MockStream, PeerAddr)> {
            if let Some(step) = self.script.lock().unwrap().pop_front() {
                return step.map(|data| (MockStream::with_reads(vec![Ok(data)]), local_peer()));
            }
            let mut woken = self.woken.lock().unwrap();
            while !*woken {
                woken = self.cv.wait(woken).unwrap();
            }
            *woken = false;
            Ok((MockStream::default(), local_peer()))
        }

        fn wake(&self) -> io::Result<()> {
            *self.woken.lock().unwrap() = true;
            self.cv.notify_all();
            Ok(())
        }
    }

    struct Collect {
        inner: EchoHandler,
        tx: Mutex<mpsc::Sender<Vec<u8>>>,
    }

    impl ConnectionHandler<MockStream> for Collect {
        fn handle(&self, conn: &mut ConnectionRecord<MockStream>) -> io::Result<HandleOutcome> {
            let result = self.inner.handle(conn);
            let _ = self.tx.lock().unwrap().send(conn.stream.written.clone());
            result
        }
    }

    #[test]
    fn test_accept_errors_are_retried_and_stop_exits() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(b"a".to_vec()),
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "transient")),
            Ok(b"b".to_vec()),
        ]));
        let (tx, rx) = mpsc::channel();
        let handler = Collect {
            inner: EchoHandler::default(),
            tx: Mutex::new(tx),
        };
        let pool = WorkerPool::<MockStream>::start(
            PoolConfig {
                workers: 1,
                queue_capacity: 2,
                io_timeout: None,
            },
            handler,
        )
        .unwrap();

        let acceptor = Acceptor::new(Arc::clone(&source), pool.submitter());
        let handle = acceptor.handle();
        let runner = thread::spawn(move || acceptor.run());

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, b"a");
        assert_eq!(second, b"b");

        handle.stop();
        let (exit, stats) = runner.join().unwrap();
        assert_eq!(exit, AcceptorExit::Stopped);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.accept_errors, 1);

        pool.shutdown().unwrap();
    }

    #[test]
    fn test_repeated_accept_errors_log_sparsely() {
        let logged: Vec<u64> = (1..=20).filter(|&n| should_log_accept_error(n)).collect();
        assert_eq!(logged, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_long_accept_error_run_keeps_looping() {
        let mut script: Vec<io::Result<Vec<u8>>> = (0..100)
            .map(|_| Err(io::Error::new(io::ErrorKind::Other, "too many open files")))
            .collect();
        script.push(Ok(b"late".to_vec()));
        let source = Arc::new(ScriptedSource::new(script));

        let (tx, rx) = mpsc::channel();
        let handler = Collect {
            inner: EchoHandler::default(),
            tx: Mutex::new(tx),
        };
        let pool = WorkerPool::<MockStream>::start(PoolConfig::default(), handler).unwrap();

        let acceptor = Acceptor::new(Arc::clone(&source), pool.submitter());
        let handle = acceptor.handle();
        let runner = thread::spawn(move || acceptor.run());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"late");

        handle.stop();
        let (exit, stats) = runner.join().unwrap();
        assert_eq!(exit, AcceptorExit::Stopped);
        assert_eq!(stats.accept_errors, 100);
        assert_eq!(stats.accepted, 1);

        pool.shutdown().unwrap();
    }

    #[test]
    fn test_exits_when_pool_closes() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(b"x".to_vec())]));
        let pool = WorkerPool::<MockStream>::start(PoolConfig::default(), EchoHandler::default())
            .unwrap();
        let submitter = pool.submitter();
        pool.shutdown().unwrap();

        let (exit, stats) = Acceptor::new(source, submitter).run();
        assert_eq!(exit, AcceptorExit::PoolClosed);
        assert_eq!(stats.accepted, 1);
    }
}
