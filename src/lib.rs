//! pooled-echo: a stream echo server backed by a bounded worker pool.
//!
//! A single acceptor thread accepts connections and hands them to a fixed
//! set of long-lived worker threads through a capacity-limited FIFO queue.
//! When every worker is busy and the queue is full, the acceptor blocks
//! instead of spawning more threads or dropping connections.
//!
//! Features:
//! - TCP (IPv4/IPv6, host names resolved) or Unix domain listeners
//! - Configurable worker count, queue capacity, backlog and I/O timeouts
//! - Configuration via CLI arguments or TOML file

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod pool;
pub mod queue;
pub mod server;

pub use server::{RunningServer, Server, ServerError, ServerSummary};
