//! Socket lifecycle for listeners and push clients.

use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{CoreError, PushError};
use crate::resolver::CachedResolver;

/// How long a push TCP connection is used before it is recycled against a
/// freshly shuffled pool.
const TCP_RECYCLE: Duration = Duration::from_secs(180);

/// Bind a non-blocking UDP listener socket with `SO_REUSEADDR` and
/// `SO_REUSEPORT` so multiple workers (or a restarted one) can share the
/// port and the kernel balances traffic. https://lwn.net/Articles/542629/
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, CoreError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)
        .map_err(|e| CoreError::Bind(addr, e))?;
    let setup = || -> std::io::Result<()> {
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        #[cfg(not(windows))]
        socket.set_reuse_port(true)?;
        socket.bind(&addr.into())
    };
    setup().map_err(|e| CoreError::Bind(addr, e))?;
    info!("bound UDP socket {addr}");
    Ok(socket.into())
}

/// Bind a non-blocking TCP listener with `SO_REUSEADDR`, so a restarted
/// worker can reclaim its port without waiting out TIME_WAIT.
pub fn bind_tcp(addr: SocketAddr) -> Result<std::net::TcpListener, CoreError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .map_err(|e| CoreError::Bind(addr, e))?;
    let setup = || -> std::io::Result<()> {
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)
    };
    setup().map_err(|e| CoreError::Bind(addr, e))?;
    info!("bound TCP socket {addr}");
    Ok(socket.into())
}

/// An unconnected UDP socket for pushing datagrams. Opened once and reused;
/// UDP sockets do not need the recycling TCP connections do.
pub struct UdpConnector {
    socket: Option<UdpSocket>,
    socket_timeout: Option<Duration>,
}

impl UdpConnector {
    pub fn new(socket_timeout: Option<Duration>) -> Self {
        Self {
            socket: None,
            socket_timeout: clamp_timeout(socket_timeout),
        }
    }

    pub fn open(&mut self) -> Result<&UdpSocket, PushError> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.set_write_timeout(self.socket_timeout)?;
            debug!("created UDP socket");
            self.socket = Some(socket);
        }
        Ok(self.socket.as_ref().unwrap())
    }

    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("closed UDP socket");
        }
    }
}

/// A recycled TCP connection to one of a pool of remote hosts.
///
/// The resolved pool is shuffled before each round of connection attempts;
/// DNS round-robins on its own, but reshuffling on every attempt spreads
/// connections better than reshuffling once per DNS query.
pub struct TcpConnector {
    resolver: CachedResolver,
    socket_timeout: Option<Duration>,
    stream: Option<TcpStream>,
    opened: Option<Instant>,
}

impl TcpConnector {
    pub fn new(
        hosts: Vec<String>,
        default_port: u16,
        socket_timeout: Option<Duration>,
    ) -> Self {
        Self {
            resolver: CachedResolver::new(hosts, default_port),
            socket_timeout: clamp_timeout(socket_timeout),
            stream: None,
            opened: None,
        }
    }

    /// The current connection, reconnecting if the socket was closed or has
    /// outlived the recycling interval.
    pub fn connect(&mut self) -> Result<&mut TcpStream, PushError> {
        let expired = matches!(self.opened, Some(at) if at.elapsed() > TCP_RECYCLE);
        if expired {
            self.close();
        }

        if self.stream.is_none() {
            for addr in self.resolver.resolve_shuffled() {
                let attempt = match self.socket_timeout {
                    Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                    None => TcpStream::connect(addr),
                };
                match attempt {
                    Ok(stream) => {
                        stream.set_read_timeout(self.socket_timeout)?;
                        stream.set_write_timeout(self.socket_timeout)?;
                        info!("connected TCP socket to {addr}");
                        self.stream = Some(stream);
                        self.opened = Some(Instant::now());
                        break;
                    }
                    Err(e) => {
                        warn!("TCP connection to {addr} failed: {e}");
                        continue;
                    }
                }
            }
        }

        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(PushError::Remote("no connection could be made".to_string())),
        }
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("closed TCP socket");
        }
        self.opened = None;
    }
}

fn clamp_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.map(|t| t.max(Duration::from_secs(1)))
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn udp_bind_is_reusable() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = bind_udp(addr).unwrap();
        let bound = first.local_addr().unwrap();
        // SO_REUSEADDR + SO_REUSEPORT let a second socket share the port.
        let _second = bind_udp(bound).unwrap();
    }

    #[test]
    fn udp_connector_reuses_socket() {
        let mut connector = UdpConnector::new(None);
        let first = connector.open().unwrap().local_addr().unwrap();
        let second = connector.open().unwrap().local_addr().unwrap();
        assert_eq!(first, second);

        connector.close();
        let third = connector.open().unwrap().local_addr().unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut connector = TcpConnector::new(vec![addr.to_string()], addr.port(), None);
        {
            use std::io::Write;
            let stream = connector.connect().unwrap();
            stream.write_all(b"ping").unwrap();
        }

        let (mut accepted, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn tcp_connector_fails_without_hosts() {
        let mut connector = TcpConnector::new(Vec::new(), 2003, Some(Duration::from_secs(1)));
        assert!(connector.connect().is_err());
    }
}
