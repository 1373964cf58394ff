use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(test)] use mockall::automock;
use mio::net::UdpSocket;
use rustls::ClientConfig;
use tracing::{debug, trace};

use crate::error::{NetErrorCode, TransportError};
use crate::stream::selector::{NetSelector, SocketId};
use crate::stream::transport::{FirstTraffic, TransportOps};

/// The application protocol a streaming server must negotiate on QUIC connections
pub const TAK_STREAM_ALPN: &[u8] = b"takstream";

/// A client-side QUIC connection carrying a single bidirectional stream. The session does not
///  own a socket: all packet I/O goes through the non-blocking socket passed in, which is owned
///  and polled by the transport.
#[cfg_attr(test, automock)]
pub trait QuicSession: Send {
    /// Sends pending packets until there are none left or the socket would block
    fn write(&mut self, socket: &UdpSocket, now: Instant) -> Result<(), TransportError>;
    /// Processes received datagrams until the socket would block
    fn read(&mut self, socket: &UdpSocket, now: Instant) -> Result<(), TransportError>;

    fn is_established(&self) -> bool;
    fn is_closed(&self) -> bool;
    fn negotiated_alpn(&self) -> Option<Vec<u8>>;

    /// Queues data on the stream, returning how much was accepted
    fn send_stream_data(&mut self, data: &[u8]) -> Result<usize, TransportError>;
    /// Returns 0 if no stream data is available
    fn recv_stream_data(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// packets are waiting to be sent
    fn has_tx_data(&self) -> bool;
    /// received stream data is waiting to be read
    fn has_buffered_data(&self) -> bool;

    fn next_timeout(&self, now: Instant) -> Option<Duration>;
    fn on_timeout(&mut self, now: Instant);
}

#[cfg_attr(test, automock)]
pub trait QuicSessionFactory: Send + Sync {
    fn connect(&self, local: SocketAddr, remote: SocketAddr, server_name: &str, tls: Arc<ClientConfig>) -> Result<Box<dyn QuicSession>, TransportError>;
}

pub struct QuicTransport {
    factory: Arc<dyn QuicSessionFactory>,
    host: String,
    tls: Arc<ClientConfig>,
    socket: Option<UdpSocket>,
    remote: Option<SocketAddr>,
    session: Option<Box<dyn QuicSession>>,
}

impl QuicTransport {
    pub fn new(factory: Arc<dyn QuicSessionFactory>, host: &str, tls: Arc<ClientConfig>) -> QuicTransport {
        QuicTransport {
            factory,
            host: host.to_string(),
            tls,
            socket: None,
            remote: None,
            session: None,
        }
    }

    fn parts(&mut self) -> Result<(&UdpSocket, &mut Box<dyn QuicSession>), TransportError> {
        match (&self.socket, &mut self.session) {
            (Some(socket), Some(session)) => Ok((socket, session)),
            _ => Err(TransportError::new(NetErrorCode::Internal, "no QUIC session")),
        }
    }
}

impl TransportOps for QuicTransport {
    fn socket(&self) -> Option<SocketId> {
        self.socket.as_ref()
            .map(|s| SocketId(s.as_raw_fd()))
    }

    fn connection_init_socket(&mut self, remote: SocketAddr) -> Result<bool, TransportError> {
        let local = match remote {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local)
            .map_err(TransportError::from_connect_error)?;
        socket.connect(remote)
            .map_err(TransportError::from_connect_error)?;

        self.socket = Some(socket);
        self.remote = Some(remote);
        self.session = None;
        Ok(true)
    }

    fn connection_in_progress(&self) -> bool {
        false
    }

    fn connection_check_connected(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn connection_do_post(&mut self, rebuild: &mut bool) -> Result<bool, TransportError> {
        if self.session.is_none() {
            let (Some(socket), Some(remote)) = (&self.socket, self.remote) else {
                return Err(TransportError::new(NetErrorCode::Internal, "no socket"));
            };
            let local = socket.local_addr()
                .map_err(TransportError::from_connect_error)?;
            trace!("starting QUIC handshake from {} to {}", local, remote);
            self.session = Some(self.factory.connect(local, remote, &self.host, self.tls.clone())?);
            *rebuild = true;
        }

        let now = Instant::now();
        let (socket, session) = self.parts()?;
        session.write(socket, now)?;
        session.read(socket, now)?;
        session.write(socket, now)?;

        if session.is_closed() {
            return Err(TransportError::new(NetErrorCode::SslHandshake, "QUIC connection closed during handshake"));
        }
        if !session.is_established() {
            return Ok(false);
        }

        match session.negotiated_alpn() {
            Some(alpn) if alpn == TAK_STREAM_ALPN => {
                debug!("QUIC handshake with {} complete", self.host);
                Ok(true)
            }
            alpn => Err(TransportError::new(NetErrorCode::SslHandshake, format!("server negotiated application protocol {:?}", alpn.map(|a| String::from_utf8_lossy(&a).to_string())))),
        }
    }

    fn connection_post_wants_read(&self) -> bool {
        true
    }

    fn connection_post_wants_write(&self) -> bool {
        false
    }

    fn first_traffic(&self) -> FirstTraffic {
        FirstTraffic::AuthOrPing
    }

    fn io_wants_write(&self, tx_pending: bool) -> bool {
        tx_pending || self.session.as_ref().map(|s| s.has_tx_data()).unwrap_or(false)
    }

    fn io_read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let (socket, session) = self.parts()?;
        session.read(socket, Instant::now())?;
        let n = session.recv_stream_data(buf)?;
        if n == 0 && session.is_closed() {
            return Err(TransportError::new(NetErrorCode::Io, "QUIC connection closed by peer"));
        }
        Ok(n)
    }

    fn io_read_ready(&self, selector: &dyn NetSelector) -> bool {
        self.session.as_ref().map(|s| s.has_buffered_data()).unwrap_or(false)
            || self.socket().map(|s| selector.read_ready(s)).unwrap_or(false)
    }

    fn io_write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let (socket, session) = self.parts()?;
        let n = session.send_stream_data(buf)?;
        session.write(socket, Instant::now())?;
        Ok(n)
    }

    fn io_write_ready(&self, selector: &dyn NetSelector) -> bool {
        self.socket()
            .map(|s| selector.write_ready(s))
            .unwrap_or(false)
    }

    fn io_write_flush(&mut self) -> Result<(), TransportError> {
        let (socket, session) = self.parts()?;
        session.write(socket, Instant::now())
    }

    fn has_expiration(&self) -> bool {
        self.session.is_some()
    }

    fn handle_expirations(&mut self, now: Instant) -> Result<Option<Duration>, TransportError> {
        let (socket, session) = self.parts()?;
        session.on_timeout(now);
        session.write(socket, now)?;
        if session.is_closed() {
            return Err(TransportError::new(NetErrorCode::Io, "QUIC connection closed"));
        }
        Ok(session.next_timeout(now))
    }

    fn reset(&mut self) {
        self.session = None;
        self.socket = None;
        self.remote = None;
    }
}
