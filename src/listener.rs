//! Listening sockets that feed the acceptor.
//!
//! A listen address is either `unix:/path/to.sock` (Unix domain) or anything
//! `ToSocketAddrs` understands (`host:port`, IPv4 or IPv6). Host names are
//! resolved and the first address that binds is used.

use crate::connection::{Interrupt, PeerAddr, Transport};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 10;

/// Blocking source of accepted connections.
pub trait ConnectionSource: Send + Sync + 'static {
    type Stream: Transport;

    /// Block until a peer connects.
    fn accept(&self) -> io::Result<(Self::Stream, PeerAddr)>;

    /// Unblock a thread parked in `accept`.
    fn wake(&self) -> io::Result<()>;
}

/// Parsed listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `host:port`, resolved at bind time.
    Inet(String),
    /// Filesystem path of a Unix domain socket.
    Unix(PathBuf),
}

impl ListenAddr {
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("unix:") {
            Some(path) => ListenAddr::Unix(PathBuf::from(path)),
            None => ListenAddr::Inet(s.to_string()),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Inet(addr) => f.write_str(addr),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Accepted stream of either address family.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Transport for Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_write_timeout(timeout),
            Stream::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    fn interrupter(&self) -> io::Result<Box<dyn Interrupt>> {
        match self {
            Stream::Tcp(s) => s.interrupter(),
            Stream::Unix(s) => s.interrupter(),
        }
    }
}

/// Bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind and listen on `addr` with the given backlog.
    pub fn bind(addr: &ListenAddr, backlog: i32) -> io::Result<Self> {
        match addr {
            ListenAddr::Inet(target) => bind_tcp(target, backlog).map(Listener::Tcp),
            ListenAddr::Unix(path) => {
                let listener = bind_unix(path, backlog)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Address the socket is actually bound to (resolves port 0).
    pub fn local_addr(&self) -> io::Result<PeerAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().map(PeerAddr::Inet),
            Listener::Unix { path, .. } => Ok(PeerAddr::Local(Some(path.clone()))),
        }
    }
}

impl ConnectionSource for Listener {
    type Stream = Stream;

    fn accept(&self) -> io::Result<(Stream, PeerAddr)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept()?;
                Ok((Stream::Tcp(stream), PeerAddr::Inet(addr)))
            }
            Listener::Unix { listener, .. } => {
                let (stream, addr) = listener.accept()?;
                Ok((Stream::Unix(stream), PeerAddr::from(addr)))
            }
        }
    }

    fn wake(&self) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => {
                let addr = connectable(l.local_addr()?);
                TcpStream::connect_timeout(&addr, Duration::from_secs(1)).map(drop)
            }
            Listener::Unix { path, .. } => UnixStream::connect(path).map(drop),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                debug!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

/// Wildcard binds are reached through loopback.
fn connectable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Resolve `target` and bind the first address that works.
fn bind_tcp(target: &str, backlog: i32) -> io::Result<TcpListener> {
    let mut last_err = None;

    for addr in target.to_socket_addrs()? {
        match bind_tcp_addr(addr, backlog) {
            Ok(listener) => {
                info!(addr = %addr, backlog, "Listening");
                return Ok(listener);
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Bind failed, trying next address");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("'{target}' resolved to no addresses"),
        )
    }))
}

/// Create a TCP listener with SO_REUSEADDR and an explicit backlog.
fn bind_tcp_addr(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false).ok();
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Create a Unix domain listener, replacing a stale socket file.
fn bind_unix(path: &Path, backlog: i32) -> io::Result<UnixListener> {
    remove_stale_socket(path)?;

    let socket = socket2::Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;
    socket.bind(&socket2::SockAddr::unix(path)?)?;
    socket.listen(backlog)?;

    info!(path = %path.display(), backlog, "Listening");
    Ok(socket.into())
}

/// Remove a socket file left behind by a server that is no longer running.
///
/// Anything that is not a socket, or a socket something still listens on,
/// is left alone and reported as an error.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("'{}' exists and is not a socket", path.display()),
        ));
    }

    if UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("'{}' is in use by a running server", path.display()),
        ));
    }

    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}
