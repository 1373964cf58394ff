use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CommoError, NetErrorCode, TransportError};
use crate::stream::endpoint::{EndpointCredentials, TransportKind};
use crate::stream::selector::{NetSelector, SocketId};
use crate::stream::transport::{FirstTraffic, TransportFactory, TransportOps};

static NEXT_FAKE_SOCKET: AtomicI32 = AtomicI32::new(10_000);

/// The scripted behavior and the recorded activity of a [FakeTransport], shared with the test
pub struct FakeTransportState {
    /// fails `connection_init_socket` with this code
    pub connect_error: Option<NetErrorCode>,
    /// `connection_init_socket` reports the connection as established right away
    pub connect_immediately: bool,
    /// an outstanding connect never completes
    pub connect_hangs: bool,
    /// result of `connection_do_post`
    pub handshake_complete: bool,
    pub handshake_error: Option<NetErrorCode>,

    /// data returned by subsequent reads
    pub rx: VecDeque<u8>,
    /// returned by the next read, after all data in `rx` was consumed
    pub read_error: Option<NetErrorCode>,
    /// number of bytes accepted per write, `None` for unlimited
    pub write_limit: Option<usize>,
    pub written: Vec<u8>,

    pub socket: Option<SocketId>,
    pub connected: bool,
    pub remote: Option<SocketAddr>,
    pub num_connects: usize,
    pub num_resets: usize,
}

impl Default for FakeTransportState {
    fn default() -> Self {
        FakeTransportState {
            connect_error: None,
            connect_immediately: true,
            connect_hangs: false,
            handshake_complete: true,
            handshake_error: None,
            rx: VecDeque::new(),
            read_error: None,
            write_limit: None,
            written: vec![],
            socket: None,
            connected: false,
            remote: None,
            num_connects: 0,
            num_resets: 0,
        }
    }
}

impl FakeTransportState {
    pub fn push_rx(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }
}

pub type FakeTransportHandle = Arc<Mutex<FakeTransportState>>;

/// A transport without a socket. Connection behavior is scripted through the shared
///  [FakeTransportState], and readiness is derived from the script rather than from the selector.
pub struct FakeTransport {
    first_traffic: FirstTraffic,
    state: FakeTransportHandle,
}

impl FakeTransport {
    pub fn new(first_traffic: FirstTraffic) -> (FakeTransport, FakeTransportHandle) {
        let state: FakeTransportHandle = Default::default();
        (FakeTransport { first_traffic, state: state.clone() }, state)
    }
}

impl TransportOps for FakeTransport {
    fn socket(&self) -> Option<SocketId> {
        self.state.lock().socket
    }

    fn connection_init_socket(&mut self, remote: SocketAddr) -> Result<bool, TransportError> {
        let mut state = self.state.lock();
        state.num_connects += 1;
        if let Some(code) = state.connect_error {
            return Err(TransportError::new(code, "scripted connect failure"));
        }
        state.socket = Some(SocketId(NEXT_FAKE_SOCKET.fetch_add(1, Ordering::Relaxed)));
        state.remote = Some(remote);
        state.connected = state.connect_immediately;
        Ok(state.connected)
    }

    fn connection_in_progress(&self) -> bool {
        let state = self.state.lock();
        state.socket.is_some() && !state.connected
    }

    fn connection_check_connected(&mut self) -> Result<bool, TransportError> {
        let mut state = self.state.lock();
        if !state.connect_hangs {
            state.connected = true;
        }
        Ok(state.connected)
    }

    fn connection_do_post(&mut self, _rebuild: &mut bool) -> Result<bool, TransportError> {
        let state = self.state.lock();
        if let Some(code) = state.handshake_error {
            return Err(TransportError::new(code, "scripted handshake failure"));
        }
        Ok(state.handshake_complete)
    }

    fn connection_post_wants_read(&self) -> bool {
        !self.state.lock().handshake_complete
    }

    fn connection_post_wants_write(&self) -> bool {
        false
    }

    fn first_traffic(&self) -> FirstTraffic {
        self.first_traffic
    }

    fn io_wants_write(&self, tx_pending: bool) -> bool {
        tx_pending
    }

    fn io_read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if state.rx.is_empty() {
            if let Some(code) = state.read_error.take() {
                return Err(TransportError::new(code, "scripted read failure"));
            }
        }

        let n = buf.len().min(state.rx.len());
        for (i, b) in state.rx.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }

    fn io_read_ready(&self, _selector: &dyn NetSelector) -> bool {
        let state = self.state.lock();
        !state.rx.is_empty() || state.read_error.is_some()
    }

    fn io_write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        let n = state.write_limit.unwrap_or(buf.len()).min(buf.len());
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn io_write_ready(&self, _selector: &dyn NetSelector) -> bool {
        true
    }

    fn io_write_flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn reset(&mut self) {
        let mut state = self.state.lock();
        state.num_resets += 1;
        state.socket = None;
        state.connected = false;
    }
}

/// A selector that does not wait for anything: every registered socket is reported ready after
///  a short pause
pub struct FakeSelector {
    read: Vec<SocketId>,
    write: Vec<SocketId>,
    fail_registration: Arc<AtomicBool>,
}

impl FakeSelector {
    pub fn new(fail_registration: Arc<AtomicBool>) -> FakeSelector {
        FakeSelector {
            read: vec![],
            write: vec![],
            fail_registration,
        }
    }
}

impl NetSelector for FakeSelector {
    fn set_sockets(&mut self, read: &[SocketId], write: &[SocketId]) -> Result<(), TransportError> {
        if self.fail_registration.load(Ordering::Acquire) {
            return Err(TransportError::new(NetErrorCode::Internal, "scripted registration failure"));
        }
        self.read = read.to_vec();
        self.write = write.to_vec();
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(!self.read.is_empty() || !self.write.is_empty())
    }

    fn read_ready(&self, socket: SocketId) -> bool {
        self.read.contains(&socket)
    }

    fn write_ready(&self, socket: SocketId) -> bool {
        self.write.contains(&socket)
    }
}

/// Creates [FakeTransport]s and keeps a handle to each of them, keyed by host name
#[derive(Default)]
pub struct FakeTransportFactory {
    transports: Mutex<Vec<(String, FakeTransportHandle)>>,
    /// applied to every new transport's script
    template: Mutex<Option<Box<dyn Fn(&mut FakeTransportState) + Send>>>,
    pub fail_registration: Arc<AtomicBool>,
}

impl FakeTransportFactory {
    pub fn set_template(&self, template: impl Fn(&mut FakeTransportState) + Send + 'static) {
        *self.template.lock() = Some(Box::new(template));
    }

    /// The most recently created transport for a host
    pub fn transport(&self, host: &str) -> Option<FakeTransportHandle> {
        self.transports.lock().iter()
            .rev()
            .find(|(h, _)| h == host)
            .map(|(_, t)| t.clone())
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create_transport(&self, kind: TransportKind, host: &str, _credentials: &EndpointCredentials) -> Result<Box<dyn TransportOps>, CommoError> {
        let first_traffic = match kind {
            TransportKind::Tcp => FirstTraffic::Nothing,
            TransportKind::Tls => FirstTraffic::Auth,
            TransportKind::Quic => FirstTraffic::AuthOrPing,
        };
        let (transport, handle) = FakeTransport::new(first_traffic);
        if let Some(template) = self.template.lock().as_ref() {
            template(&mut handle.lock());
        }
        self.transports.lock().push((host.to_string(), handle));
        Ok(Box::new(transport))
    }

    fn create_selector(&self) -> anyhow::Result<Box<dyn NetSelector>> {
        Ok(Box::new(FakeSelector::new(self.fail_registration.clone())))
    }
}
