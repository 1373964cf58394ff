use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::StreamingConfig;
use crate::error::CommoError;
use crate::message::cot::CotMessage;
use crate::stream::connection_manager::ConnectionManager;
use crate::stream::dispatch::run_dispatch;
use crate::stream::endpoint::{EndpointHandle, EndpointParams, TransportKind};
use crate::stream::io_manager::IoManager;
use crate::stream::listener::{MessageListener, StatusListener};
use crate::stream::resolver::{Resolver, TokioResolver};
use crate::stream::state::StreamingState;
use crate::stream::transport::tls::TlsContext;
use crate::stream::transport::{NetTransportFactory, TransportFactory};

/// Maintains streaming connections to any number of servers.
///
/// Connections are established and re-established in the background. Applications learn about
///  connection state through [StatusListener]s and receive messages through [MessageListener]s.
///  Dropping the manager closes all connections and joins its threads.
pub struct StreamingManager {
    state: Arc<StreamingState>,
    threads: Vec<JoinHandle<()>>,
}

impl StreamingManager {
    /// Creates a manager that connects through real sockets, resolving host names on its own
    ///  resolver runtime
    pub fn with_network(my_uid: &str, config: StreamingConfig, tls: Arc<TlsContext>) -> anyhow::Result<StreamingManager> {
        let resolver = Arc::new(TokioResolver::new(config.resolve_retry)?);
        let transports = Arc::new(NetTransportFactory::new(tls));
        StreamingManager::new(my_uid, config, transports, resolver)
    }

    pub fn new(my_uid: &str, config: StreamingConfig, transports: Arc<dyn TransportFactory>, resolver: Arc<dyn Resolver>) -> anyhow::Result<StreamingManager> {
        config.validate()?;

        let conn_selector = transports.create_selector()?;
        let io_selector = transports.create_selector()?;
        let state = Arc::new(StreamingState::new(my_uid, config, transports, resolver));

        let mut threads = Vec::new();
        let result = (|| {
            let conn = ConnectionManager::new(state.clone(), conn_selector);
            threads.push(std::thread::Builder::new()
                .name("cot-conn".to_string())
                .spawn(move || conn.run())?);

            let io = IoManager::new(state.clone(), io_selector);
            threads.push(std::thread::Builder::new()
                .name("cot-io".to_string())
                .spawn(move || io.run())?);

            let dispatch_state = state.clone();
            threads.push(std::thread::Builder::new()
                .name("cot-dispatch".to_string())
                .spawn(move || run_dispatch(dispatch_state))?);
            anyhow::Ok(())
        })();

        let manager = StreamingManager { state, threads };
        result?;

        info!("streaming manager started for {}", manager.state.my_uid);
        Ok(manager)
    }

    /// Registers a server. The connection is established in the background, and status
    ///  listeners are notified once it is up.
    pub fn add_endpoint(&self, params: EndpointParams) -> Result<EndpointHandle, CommoError> {
        self.state.add_endpoint(params)
    }

    /// Closes the endpoint's connection and forgets about it. Queued messages are discarded,
    ///  including received messages that were not dispatched yet.
    pub fn remove_endpoint(&self, handle: EndpointHandle) -> Result<(), CommoError> {
        self.state.remove_endpoint(handle)
    }

    /// Drops all established connections, which are then re-established
    pub fn reconnect_all(&self) {
        self.state.reconnect_all()
    }

    pub fn send(&self, handle: EndpointHandle, message: &CotMessage) -> Result<(), CommoError> {
        self.state.send(handle, message)
    }

    /// Sends a message to all connected endpoints whose type filter matches the message's type
    pub fn broadcast(&self, message: &CotMessage, ignore_type_filter: bool) {
        self.state.broadcast(message, ignore_type_filter)
    }

    pub fn set_monitor(&self, monitor: bool) {
        debug!("monitoring {}", if monitor { "on" } else { "off" });
        self.state.settings.lock().monitor = monitor;
    }

    /// Applies to connection attempts started after the call
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.state.settings.lock().connect_timeout = timeout;
    }

    pub fn endpoint_address(&self, handle: EndpointHandle) -> Result<SocketAddr, CommoError> {
        self.state.endpoint_address(handle)
    }

    pub fn endpoint_key(&self, handle: EndpointHandle) -> Result<String, CommoError> {
        self.state.with_context(handle, |ctx| ctx.key.to_string())
    }

    /// true for endpoints with an encrypted connection, i.e. TLS and QUIC
    pub fn is_endpoint_tls(&self, handle: EndpointHandle) -> Result<bool, CommoError> {
        self.state.with_context(handle, |ctx| ctx.transport != TransportKind::Tcp)
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) {
        self.state.add_status_listener(listener)
    }

    pub fn remove_status_listener(&self, listener: &Arc<dyn StatusListener>) -> Result<(), CommoError> {
        self.state.remove_status_listener(listener)
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.state.add_message_listener(listener)
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> Result<(), CommoError> {
        self.state.remove_message_listener(listener)
    }
}

impl Drop for StreamingManager {
    fn drop(&mut self) {
        debug!("shutting down streaming manager");
        self.state.stop();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("streaming thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use mockall::predicate::{always, eq, function};
    use rstest::rstest;
    use crate::error::NetErrorCode;
    use crate::message::cot::CotPoint;
    use crate::message::wire::{serialize, ProtocolVersion};
    use crate::stream::endpoint::EndpointInfo;
    use crate::stream::listener::{MockMessageListener, MockStatusListener};
    use crate::stream::resolver::{MockResolver, ResolveRequestId};
    use crate::test_util::transport::FakeTransportFactory;
    use super::*;

    fn config() -> StreamingConfig {
        StreamingConfig {
            connect_retry_backoff: Duration::from_millis(10),
            conn_select_timeout: Duration::from_millis(5),
            io_select_timeout: Duration::from_millis(5),
            ..StreamingConfig::default()
        }
    }

    fn manager(factory: Arc<FakeTransportFactory>, resolver: MockResolver) -> StreamingManager {
        StreamingManager::new("my-uid", config(), factory, Arc::new(resolver)).unwrap()
    }

    fn msg(uid: &str, event_type: &str) -> CotMessage {
        CotMessage::new(uid, event_type, "m-g", CotPoint::new(1.0, 2.0), Duration::from_secs(30))
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn up_listener() -> (Arc<dyn StatusListener>, mpsc::Receiver<EndpointInfo>) {
        let (tx, rx) = mpsc::channel();
        let mut listener = MockStatusListener::new();
        listener.expect_endpoint_up()
            .returning(move |e| { let _ = tx.send(e.clone()); });
        listener.expect_endpoint_down()
            .return_const(());
        listener.expect_endpoint_error()
            .return_const(());
        (Arc::new(listener), rx)
    }

    #[test]
    fn test_invalid_config() {
        let config = StreamingConfig {
            rx_stale: Duration::from_secs(100),
            ..StreamingConfig::default()
        };
        assert!(StreamingManager::new("me", config, Arc::new(FakeTransportFactory::default()), Arc::new(MockResolver::new())).is_err());
    }

    #[rstest]
    #[case::port_zero(EndpointParams::tcp("10.0.0.1", 0))]
    #[case::empty_host(EndpointParams::tcp("", 8087))]
    #[case::tls_without_cert(EndpointParams { credentials: Default::default(), ..EndpointParams::tls("10.0.0.1", 8089, vec![], vec![]) })]
    #[case::quic_without_cert(EndpointParams { credentials: Default::default(), ..EndpointParams::quic("10.0.0.1", 8090, vec![], vec![]) })]
    fn test_add_endpoint_invalid(#[case] params: EndpointParams) {
        let manager = manager(Default::default(), MockResolver::new());
        assert_eq!(manager.add_endpoint(params).unwrap_err(), CommoError::IllegalArgument);
    }

    #[test]
    fn test_add_endpoint_duplicate() {
        let manager = manager(Default::default(), MockResolver::new());
        let handle = manager.add_endpoint(EndpointParams::tcp("10.0.0.1", 8087)).unwrap();
        assert_eq!(manager.add_endpoint(EndpointParams::tcp("10.0.0.1", 8087)).unwrap_err(), CommoError::IllegalArgument);

        // same host and port on a different transport is a different endpoint
        let tls = manager.add_endpoint(EndpointParams::tls("10.0.0.1", 8087, b"cert".to_vec(), b"ca".to_vec())).unwrap();
        assert_ne!(handle, tls);
        assert_eq!(manager.endpoint_key(handle).unwrap(), "tcp:10.0.0.1:8087");
        assert_eq!(manager.endpoint_key(tls).unwrap(), "ssl:10.0.0.1:8087");
        assert!(!manager.is_endpoint_tls(handle).unwrap());
        assert!(manager.is_endpoint_tls(tls).unwrap());
    }

    #[test]
    fn test_send_when_not_connected() {
        let factory = Arc::new(FakeTransportFactory::default());
        factory.set_template(|t| t.connect_error = Some(NetErrorCode::ConnRefused));
        let manager = manager(factory, MockResolver::new());

        let handle = manager.add_endpoint(EndpointParams::tcp("10.0.0.1", 8087)).unwrap();
        assert_eq!(manager.send(handle, &msg("a", "a-f-G")).unwrap_err(), CommoError::IllegalArgument);
        assert_eq!(manager.send(EndpointHandle(999), &msg("a", "a-f-G")).unwrap_err(), CommoError::IllegalArgument);
    }

    #[test]
    fn test_end_to_end() {
        let factory = Arc::new(FakeTransportFactory::default());
        let manager = manager(factory.clone(), MockResolver::new());

        let (status, up) = up_listener();
        manager.add_status_listener(status);

        let (msg_tx, received) = mpsc::channel();
        let mut listener = MockMessageListener::new();
        listener.expect_message_received()
            .with(eq("tcp:10.0.0.1:8087"), always())
            .returning(move |_, m| { let _ = msg_tx.send(m.uid.clone()); });
        manager.add_message_listener(Arc::new(listener));

        let handle = manager.add_endpoint(EndpointParams::tcp("10.0.0.1", 8087)).unwrap();
        let info = up.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(info.handle, handle);
        assert_eq!(manager.endpoint_address(handle).unwrap(), "10.0.0.1:8087".parse().unwrap());

        let transport = factory.transport("10.0.0.1").unwrap();
        manager.send(handle, &msg("outgoing", "a-f-G")).unwrap();
        wait_until(|| String::from_utf8_lossy(&transport.lock().written).contains("uid=\"outgoing\""));

        transport.lock().push_rx(&serialize(&msg("incoming", "a-f-G"), ProtocolVersion::Xml));
        assert_eq!(received.recv_timeout(Duration::from_secs(5)).unwrap(), "incoming");
    }

    #[test]
    fn test_broadcast_type_filter() {
        let factory = Arc::new(FakeTransportFactory::default());
        let manager = manager(factory.clone(), MockResolver::new());
        let (status, up) = up_listener();
        manager.add_status_listener(status);

        manager.add_endpoint(EndpointParams::tcp("10.0.0.1", 8087).with_type_filter(&["a-f-G"])).unwrap();
        manager.add_endpoint(EndpointParams::tcp("10.0.0.2", 8087).with_type_filter(&["b-t-f"])).unwrap();
        up.recv_timeout(Duration::from_secs(5)).unwrap();
        up.recv_timeout(Duration::from_secs(5)).unwrap();

        manager.broadcast(&msg("filtered", "a-f-G"), false);
        manager.broadcast(&msg("everyone", "u-d-p"), true);

        let a = factory.transport("10.0.0.1").unwrap();
        let b = factory.transport("10.0.0.2").unwrap();
        wait_until(|| String::from_utf8_lossy(&a.lock().written).contains("uid=\"everyone\""));
        wait_until(|| String::from_utf8_lossy(&b.lock().written).contains("uid=\"everyone\""));

        assert!(String::from_utf8_lossy(&a.lock().written).contains("uid=\"filtered\""));
        assert!(!String::from_utf8_lossy(&b.lock().written).contains("uid=\"filtered\""));
    }

    #[test]
    fn test_remove_endpoint_while_resolving() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve()
            .with(eq("tak.example.com"), eq(8087), always())
            .times(1)
            .return_const(ResolveRequestId(7));
        resolver.expect_cancel()
            .with(eq(ResolveRequestId(7)))
            .times(1)
            .return_const(());
        let manager = manager(Default::default(), resolver);

        let handle = manager.add_endpoint(EndpointParams::tcp("tak.example.com", 8087)).unwrap();
        wait_until(|| manager.state.down.lock().resolving.contains_key(&ResolveRequestId(7)));
        assert_eq!(manager.endpoint_address(handle).unwrap_err(), CommoError::IllegalArgument);

        manager.remove_endpoint(handle).unwrap();
        assert!(manager.state.down.lock().resolving.is_empty());
        assert!(!manager.state.down.lock().members.contains(&handle));
        assert_eq!(manager.remove_endpoint(handle).unwrap_err(), CommoError::IllegalArgument);
        assert_eq!(manager.endpoint_key(handle).unwrap_err(), CommoError::IllegalArgument);
    }

    #[test]
    fn test_remove_connected_endpoint() {
        let factory = Arc::new(FakeTransportFactory::default());
        let manager = manager(factory.clone(), MockResolver::new());
        let (status, up) = up_listener();
        manager.add_status_listener(status);

        let handle = manager.add_endpoint(EndpointParams::tcp("10.0.0.1", 8087)).unwrap();
        up.recv_timeout(Duration::from_secs(5)).unwrap();

        manager.remove_endpoint(handle).unwrap();
        assert!(!manager.state.up.lock().members.contains(&handle));
        assert!(!manager.state.down.lock().members.contains(&handle));
        assert_eq!(factory.transport("10.0.0.1").unwrap().lock().num_resets, 1);

        // the key can be reused
        manager.add_endpoint(EndpointParams::tcp("10.0.0.1", 8087)).unwrap();
    }

    #[test]
    fn test_membership_is_exclusive() {
        let factory = Arc::new(FakeTransportFactory::default());
        let manager = manager(factory.clone(), MockResolver::new());
        let mut listener = MockStatusListener::new();
        listener.expect_endpoint_up().return_const(());
        listener.expect_endpoint_down().return_const(());
        listener.expect_endpoint_error()
            .with(always(), function(|c: &NetErrorCode| *c == NetErrorCode::Io))
            .return_const(());
        manager.add_status_listener(Arc::new(listener));

        let handles = (1..=4)
            .map(|i| manager.add_endpoint(EndpointParams::tcp(&format!("10.0.0.{}", i), 8087)).unwrap())
            .collect::<Vec<_>>();

        let exclusive = || {
            let _table = manager.state.contexts.read();
            let up = manager.state.up.lock().members.clone();
            let down = manager.state.down.lock().members.clone();
            handles.iter().all(|h| up.contains(h) != down.contains(h))
        };

        for round in 0..20 {
            if round % 3 == 0 {
                manager.reconnect_all();
            }
            if round % 5 == 1 {
                if let Some(t) = factory.transport("10.0.0.2") {
                    t.lock().read_error = Some(NetErrorCode::Io);
                }
            }
            std::thread::sleep(Duration::from_millis(3));
            wait_until(exclusive);
        }
    }

    #[test]
    fn test_drop_joins_threads() {
        let manager = manager(Default::default(), MockResolver::new());
        manager.set_monitor(false);
        manager.set_connect_timeout(Duration::from_secs(1));
        assert_eq!(manager.state.connect_timeout(), Duration::from_secs(1));
        assert!(!manager.state.monitor());
        drop(manager);
    }
}
