//! Accepted connection records and their lifecycle state.
//!
//! A `ConnectionRecord` owns its transport. It is moved into the queue by the
//! acceptor and moved out by exactly one worker; dropping it closes the
//! underlying socket.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Address of the remote end of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    /// IPv4 or IPv6 peer.
    Inet(SocketAddr),
    /// Unix domain peer. Client sockets are usually unnamed.
    Local(Option<PathBuf>),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Local(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddr::Local(None) => f.write_str("unix:unnamed"),
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::Inet(addr)
    }
}

impl From<std::os::unix::net::SocketAddr> for PeerAddr {
    fn from(addr: std::os::unix::net::SocketAddr) -> Self {
        PeerAddr::Local(addr.as_pathname().map(|p| p.to_path_buf()))
    }
}

/// Unblocks a thread parked in `read` or `write` on another handle of the
/// same stream.
pub trait Interrupt: Send + 'static {
    fn interrupt(&self) -> io::Result<()>;
}

impl Interrupt for std::net::TcpStream {
    fn interrupt(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Interrupt for std::os::unix::net::UnixStream {
    fn interrupt(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Byte stream that supports per-connection I/O timeouts.
pub trait Transport: io::Read + io::Write + Send + 'static {
    /// Set (or clear) the receive timeout.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// Set (or clear) the send timeout.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// Handle that can force blocked I/O on this stream to return.
    fn interrupter(&self) -> io::Result<Box<dyn Interrupt>>;
}

impl Transport for std::net::TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::net::TcpStream::set_write_timeout(self, timeout)
    }

    fn interrupter(&self) -> io::Result<Box<dyn Interrupt>> {
        Ok(Box::new(self.try_clone()?))
    }
}

impl Transport for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn interrupter(&self) -> io::Result<Box<dyn Interrupt>> {
        Ok(Box::new(self.try_clone()?))
    }
}

/// Current state of a connection being serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Receiving and echoing.
    Active,
    /// Peer closed or an I/O error occurred. Terminal.
    Closed,
}

impl ConnState {
    /// Whether the connection has reached its terminal state.
    pub fn is_closed(self) -> bool {
        matches!(self, ConnState::Closed)
    }
}

/// A single accepted connection travelling from acceptor to worker.
#[derive(Debug)]
pub struct ConnectionRecord<S> {
    /// Monotonic id assigned on submit, used for log correlation.
    pub id: u64,
    /// Owned transport. Closed when the record is dropped.
    pub stream: S,
    /// Remote address.
    pub peer: PeerAddr,
    /// Lifecycle state.
    pub state: ConnState,
}

impl<S> ConnectionRecord<S> {
    /// Create a new record in the `Active` state.
    pub fn new(id: u64, stream: S, peer: PeerAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            state: ConnState::Active,
        }
    }

    /// Mark the connection closed.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::os::unix::net::UnixStream;
    use std::thread;

    #[test]
    fn test_connection_state_transitions() {
        let peer = PeerAddr::Inet(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000));
        let mut conn = ConnectionRecord::new(7, (), peer);

        assert_eq!(conn.state, ConnState::Active);
        assert!(!conn.state.is_closed());

        conn.close();
        assert!(conn.state.is_closed());
    }

    #[test]
    fn test_peer_addr_display() {
        let v4 = PeerAddr::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000));
        assert_eq!(v4.to_string(), "127.0.0.1:5000");

        let v6 = PeerAddr::from(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5000));
        assert_eq!(v6.to_string(), "[::1]:5000");

        assert_eq!(PeerAddr::Local(None).to_string(), "unix:unnamed");
        assert_eq!(
            PeerAddr::Local(Some(PathBuf::from("/tmp/echo.sock"))).to_string(),
            "unix:/tmp/echo.sock"
        );
    }

    #[test]
    fn test_interrupter_unblocks_reader() {
        let (mut reader, mut peer) = UnixStream::pair().unwrap();
        let interrupter = reader.interrupter().unwrap();

        let blocked = thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf)
        });

        interrupter.interrupt().unwrap();
        assert_eq!(blocked.join().unwrap().unwrap(), 0);

        // The peer sees the stream shut down as well.
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }
}
