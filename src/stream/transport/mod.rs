pub mod quic;
pub mod tcp;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{CommoError, TransportError};
use crate::stream::endpoint::{EndpointCredentials, TransportKind};
use crate::stream::selector::{MioSelector, NetSelector, SocketId};
use crate::stream::transport::quic::{QuicSessionFactory, QuicTransport};
use crate::stream::transport::tcp::TcpTransport;
use crate::stream::transport::tls::{TlsContext, TlsTransport};

/// What a transport must send before the server sends anything, once it is fully connected
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FirstTraffic {
    Nothing,
    /// the authentication document, if credentials were configured
    Auth,
    /// the authentication document, or a ping if there is none
    AuthOrPing,
}

/// The transport specific part of a connection, driven by the connection manager while the
///  endpoint is down and by the I/O manager while it is up.
///
/// All methods are non-blocking. Read and write return `Ok(0)` when the operation would block,
///  an `Err` is always fatal for the connection and causes a reset.
pub trait TransportOps: Send {
    /// The socket to wait on, present only while connecting or connected
    fn socket(&self) -> Option<SocketId>;

    /// Creates the socket and starts connecting. Returns true if the base connection is
    ///  established right away.
    fn connection_init_socket(&mut self, remote: SocketAddr) -> Result<bool, TransportError>;

    /// true while the base connect (below any handshake) is outstanding
    fn connection_in_progress(&self) -> bool;

    /// Called when the socket of an outstanding connect becomes writable. Returns true if the
    ///  base connection is established.
    fn connection_check_connected(&mut self) -> Result<bool, TransportError>;

    /// Advances the handshake on top of the base connection by one step, returning true when the
    ///  connection is ready for application data. `rebuild` is set if the readiness conditions
    ///  the handshake waits for changed.
    fn connection_do_post(&mut self, rebuild: &mut bool) -> Result<bool, TransportError>;

    fn connection_post_wants_read(&self) -> bool;
    fn connection_post_wants_write(&self) -> bool;

    fn first_traffic(&self) -> FirstTraffic;

    /// Does the connection need write readiness, given whether application data is pending?
    fn io_wants_write(&self, tx_pending: bool) -> bool;

    fn io_read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    fn io_read_ready(&self, selector: &dyn NetSelector) -> bool;
    fn io_write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;
    fn io_write_ready(&self, selector: &dyn NetSelector) -> bool;
    /// Pushes out buffered protocol data when there is no application data to write
    fn io_write_flush(&mut self) -> Result<(), TransportError>;

    fn has_expiration(&self) -> bool {
        false
    }

    /// Runs timers that expired and returns the delay until the next one
    fn handle_expirations(&mut self, _now: Instant) -> Result<Option<Duration>, TransportError> {
        Ok(None)
    }

    /// Closes the socket and drops all transport state. The transport can be connected again
    ///  afterwards.
    fn reset(&mut self);
}

/// Creates the transport specific parts of connections, and a selector per reactor thread
pub trait TransportFactory: Send + Sync {
    /// Fails synchronously if the credentials are unusable for the transport
    fn create_transport(&self, kind: TransportKind, host: &str, credentials: &EndpointCredentials) -> Result<Box<dyn TransportOps>, CommoError>;

    fn create_selector(&self) -> anyhow::Result<Box<dyn NetSelector>>;
}

pub struct NetTransportFactory {
    tls: Arc<TlsContext>,
    quic: Option<Arc<dyn QuicSessionFactory>>,
}

impl NetTransportFactory {
    pub fn new(tls: Arc<TlsContext>) -> NetTransportFactory {
        NetTransportFactory {
            tls,
            quic: None,
        }
    }

    pub fn with_quic(mut self, quic: Arc<dyn QuicSessionFactory>) -> NetTransportFactory {
        self.quic = Some(quic);
        self
    }
}

impl TransportFactory for NetTransportFactory {
    fn create_transport(&self, kind: TransportKind, host: &str, credentials: &EndpointCredentials) -> Result<Box<dyn TransportOps>, CommoError> {
        match kind {
            TransportKind::Tcp => Ok(Box::new(TcpTransport::new())),
            TransportKind::Tls => {
                let config = self.tls.client_config(credentials, None)?;
                Ok(Box::new(TlsTransport::new(config, host)?))
            }
            TransportKind::Quic => {
                let Some(factory) = &self.quic else {
                    warn!("QUIC endpoint {} requested, but QUIC is not available", host);
                    return Err(CommoError::IllegalArgument);
                };
                let config = self.tls.client_config(credentials, Some(quic::TAK_STREAM_ALPN))?;
                Ok(Box::new(QuicTransport::new(factory.clone(), host, config)))
            }
        }
    }

    fn create_selector(&self) -> anyhow::Result<Box<dyn NetSelector>> {
        Ok(Box::new(MioSelector::new()?))
    }
}
