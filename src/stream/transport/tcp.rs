use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;

use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{NetErrorCode, TransportError};
use crate::stream::selector::{NetSelector, SocketId};
use crate::stream::transport::{FirstTraffic, TransportOps};

/// Plain TCP. This is also the base connection the TLS transport builds on.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    connected: bool,
}

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport {
            stream: None,
            connected: false,
        }
    }

    pub(super) fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut()
            .ok_or_else(|| TransportError::new(NetErrorCode::Internal, "no socket"))
    }
}

impl TransportOps for TcpTransport {
    fn socket(&self) -> Option<SocketId> {
        self.stream.as_ref()
            .map(|s| SocketId(s.as_raw_fd()))
    }

    fn connection_init_socket(&mut self, remote: SocketAddr) -> Result<bool, TransportError> {
        let stream = TcpStream::connect(remote)
            .map_err(TransportError::from_connect_error)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY for {}: {}", remote, e);
        }
        trace!("connecting to {}", remote);

        self.stream = Some(stream);
        self.connected = false;
        Ok(false)
    }

    fn connection_in_progress(&self) -> bool {
        self.stream.is_some() && !self.connected
    }

    fn connection_check_connected(&mut self) -> Result<bool, TransportError> {
        let stream = self.stream_mut()?;

        if let Some(e) = stream.take_error().map_err(TransportError::from_connect_error)? {
            return Err(TransportError::from_connect_error(e));
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(TransportError::from_connect_error(e)),
        }
    }

    fn connection_do_post(&mut self, _rebuild: &mut bool) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn connection_post_wants_read(&self) -> bool {
        false
    }

    fn connection_post_wants_write(&self) -> bool {
        false
    }

    fn first_traffic(&self) -> FirstTraffic {
        FirstTraffic::Nothing
    }

    fn io_wants_write(&self, tx_pending: bool) -> bool {
        tx_pending
    }

    fn io_read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream_mut()?.read(buf) {
            Ok(0) => Err(TransportError::new(NetErrorCode::Io, "connection closed by peer")),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(TransportError::io(e)),
        }
    }

    fn io_read_ready(&self, selector: &dyn NetSelector) -> bool {
        self.socket()
            .map(|s| selector.read_ready(s))
            .unwrap_or(false)
    }

    fn io_write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        match self.stream_mut()?.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(TransportError::io(e)),
        }
    }

    fn io_write_ready(&self, selector: &dyn NetSelector) -> bool {
        self.socket()
            .map(|s| selector.write_ready(s))
            .unwrap_or(false)
    }

    fn io_write_flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(stream) = self.stream.take() {
            // the peer may be gone already
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.connected = false;
    }
}
