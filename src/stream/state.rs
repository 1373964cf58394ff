use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, trace, warn};

use crate::config::StreamingConfig;
use crate::error::{CommoError, NetErrorCode};
use crate::message::control::auth_document;
use crate::message::cot::CotMessage;
use crate::stream::context::{ConnectionContext, ContextState};
use crate::stream::endpoint::{EndpointHandle, EndpointParams};
use crate::stream::listener::{fire_status_events, MessageListener, StatusEvent, StatusListener};
use crate::stream::resolver::{ResolveEvent, ResolveRequestId, Resolver};
use crate::stream::transport::TransportFactory;

/// All configured endpoints. Reactor threads hold the read lock for a pass over their set, so an
///  endpoint is never removed while a pass works on it.
#[derive(Default)]
pub struct ContextTable {
    by_id: FxHashMap<EndpointHandle, Arc<ConnectionContext>>,
    by_key: FxHashMap<Arc<str>, EndpointHandle>,
    next_handle: u64,
}

impl ContextTable {
    pub fn get(&self, handle: EndpointHandle) -> Option<&Arc<ConnectionContext>> {
        self.by_id.get(&handle)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Endpoints with an established connection, owned by the I/O thread
#[derive(Default)]
pub struct UpSet {
    pub members: FxHashSet<EndpointHandle>,
    pub needs_rebuild: bool,
    pub reset_requested: FxHashSet<EndpointHandle>,
}

/// Endpoints that are resolving, waiting for a retry or connecting, owned by the connection thread
#[derive(Default)]
pub struct DownSet {
    pub members: FxHashSet<EndpointHandle>,
    pub needs_rebuild: bool,
    pub resolving: FxHashMap<ResolveRequestId, EndpointHandle>,
}

pub struct RxQueueItem {
    pub handle: EndpointHandle,
    pub key: Arc<str>,
    pub message: CotMessage,
}

pub struct RuntimeSettings {
    pub monitor: bool,
    pub connect_timeout: Duration,
}

/// State shared between the API and the threads of a streaming manager.
///
/// Lock order: `contexts` before `up` / `down` before a context's state mutex. `up` and `down`
///  are never held at the same time. Status events are fired after all locks are released.
pub struct StreamingState {
    pub config: StreamingConfig,
    pub my_uid: String,
    pub transports: Arc<dyn TransportFactory>,
    pub resolver: Arc<dyn Resolver>,

    pub contexts: RwLock<ContextTable>,
    pub up: Mutex<UpSet>,
    pub down: Mutex<DownSet>,

    pub rx_queue: Mutex<VecDeque<RxQueueItem>>,
    pub rx_available: Condvar,

    pub status_listeners: RwLock<Vec<Arc<dyn StatusListener>>>,
    pub message_listeners: RwLock<Vec<Arc<dyn MessageListener>>>,

    pub settings: Mutex<RuntimeSettings>,
    stopping: AtomicBool,
}

impl StreamingState {
    pub fn new(my_uid: &str, config: StreamingConfig, transports: Arc<dyn TransportFactory>, resolver: Arc<dyn Resolver>) -> StreamingState {
        let settings = RuntimeSettings {
            monitor: config.monitor,
            connect_timeout: config.connect_timeout,
        };

        StreamingState {
            config,
            my_uid: my_uid.to_string(),
            transports,
            resolver,
            contexts: Default::default(),
            up: Default::default(),
            down: Default::default(),
            rx_queue: Default::default(),
            rx_available: Condvar::new(),
            status_listeners: Default::default(),
            message_listeners: Default::default(),
            settings: Mutex::new(settings),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.rx_available.notify_all();
    }

    pub fn monitor(&self) -> bool {
        self.settings.lock().monitor
    }

    pub fn connect_timeout(&self) -> Duration {
        self.settings.lock().connect_timeout
    }

    pub fn fire(&self, events: Vec<StatusEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.status_listeners.read().clone();
        fire_status_events(&listeners, events);
    }

    pub fn enqueue_received(&self, items: Vec<RxQueueItem>) {
        if items.is_empty() {
            return;
        }
        let mut rx_queue = self.rx_queue.lock();
        rx_queue.extend(items);
        self.rx_available.notify_one();
    }

    pub fn add_endpoint(&self, params: EndpointParams) -> Result<EndpointHandle, CommoError> {
        if params.port == 0 || params.host.is_empty() {
            return Err(CommoError::IllegalArgument);
        }
        if params.transport.requires_client_cert() && params.credentials.client_cert.is_none() {
            debug!("{} endpoint {} without a client certificate", params.transport.key_prefix(), params.host);
            return Err(CommoError::IllegalArgument);
        }

        let key: Arc<str> = params.key().into();
        if self.contexts.read().by_key.contains_key(&key) {
            debug!("endpoint {} exists already", key);
            return Err(CommoError::IllegalArgument);
        }

        let ops = self.transports.create_transport(params.transport, &params.host, &params.credentials)?;
        let auth = if params.transport.requires_client_cert() {
            auth_document(params.username.as_deref(), params.password.as_deref(), &self.my_uid)
                .map(Bytes::from)
        }
        else {
            None
        };
        let remote_addr = params.host.parse::<IpAddr>().ok()
            .map(|ip| SocketAddr::new(ip, params.port));

        let mut table = self.contexts.write();
        if table.by_key.contains_key(&key) {
            return Err(CommoError::IllegalArgument);
        }
        let handle = EndpointHandle(table.next_handle);
        table.next_handle += 1;

        let ctx = Arc::new(ConnectionContext {
            handle,
            key: key.clone(),
            transport: params.transport,
            host: params.host,
            port: params.port,
            type_filter: params.type_filter.into_iter().collect(),
            state: Mutex::new(ContextState::new(ops, remote_addr, auth, self.config.rx_buffer_size, Instant::now())),
        });
        table.by_id.insert(handle, ctx);
        table.by_key.insert(key.clone(), handle);

        let mut down = self.down.lock();
        down.members.insert(handle);
        down.needs_rebuild = true;
        drop(down);
        drop(table);

        info!("added endpoint {} as {}", key, handle);
        Ok(handle)
    }

    pub fn remove_endpoint(&self, handle: EndpointHandle) -> Result<(), CommoError> {
        let mut table = self.contexts.write();
        let ctx = table.by_id.remove(&handle)
            .ok_or(CommoError::IllegalArgument)?;
        table.by_key.remove(&ctx.key);

        {
            let mut up = self.up.lock();
            if up.members.remove(&handle) {
                up.needs_rebuild = true;
            }
            up.reset_requested.remove(&handle);
        }
        {
            let mut down = self.down.lock();
            if down.members.remove(&handle) {
                down.needs_rebuild = true;
            }
            down.resolving.retain(|id, h| {
                if *h == handle {
                    self.resolver.cancel(*id);
                    false
                }
                else {
                    true
                }
            });
        }
        {
            let mut state = ctx.state.lock();
            state.resolve_request = None;
            state.reset(Instant::now(), true);
        }
        self.rx_queue.lock()
            .retain(|item| item.handle != handle);
        drop(table);

        info!("removed endpoint {}", ctx.key);
        Ok(())
    }

    pub fn reconnect_all(&self) {
        let _table = self.contexts.read();
        let mut up = self.up.lock();
        let members = up.members.iter().copied().collect::<Vec<_>>();
        debug!("requesting reconnect for {} endpoints", members.len());
        up.reset_requested.extend(members);
    }

    pub fn send(&self, handle: EndpointHandle, message: &CotMessage) -> Result<(), CommoError> {
        let table = self.contexts.read();
        let ctx = table.get(handle)
            .ok_or(CommoError::IllegalArgument)?;
        let up = self.up.lock();
        if !up.members.contains(&handle) {
            trace!("not sending to {}: not connected", ctx.key);
            return Err(CommoError::IllegalArgument);
        }
        ctx.state.lock().queue_message(message);
        Ok(())
    }

    pub fn broadcast(&self, message: &CotMessage, ignore_type_filter: bool) {
        let table = self.contexts.read();
        let up = self.up.lock();
        for handle in &up.members {
            let Some(ctx) = table.get(*handle) else {
                continue;
            };
            if ignore_type_filter || ctx.accepts_type(&message.event_type) {
                ctx.state.lock().queue_message(message);
            }
        }
    }

    pub fn endpoint_address(&self, handle: EndpointHandle) -> Result<SocketAddr, CommoError> {
        let table = self.contexts.read();
        let ctx = table.get(handle)
            .ok_or(CommoError::IllegalArgument)?;
        let addr = ctx.state.lock().remote_addr;
        addr.ok_or(CommoError::IllegalArgument)
    }

    pub fn with_context<T>(&self, handle: EndpointHandle, f: impl FnOnce(&ConnectionContext) -> T) -> Result<T, CommoError> {
        let table = self.contexts.read();
        table.get(handle)
            .map(|ctx| f(ctx))
            .ok_or(CommoError::IllegalArgument)
    }

    /// Starts resolving an endpoint's host name
    pub fn start_resolution(self: &Arc<Self>, ctx: &ConnectionContext) {
        let weak: Weak<StreamingState> = Arc::downgrade(self);
        let handle = ctx.handle;

        let mut down = self.down.lock();
        if ctx.state.lock().resolve_request.is_some() {
            return;
        }
        info!("resolving {}", ctx.host);
        let id = self.resolver.resolve(&ctx.host, ctx.port, Arc::new(move |id, event| {
            if let Some(state) = weak.upgrade() {
                state.on_resolve_event(id, handle, event);
            }
        }));
        down.resolving.insert(id, handle);
        ctx.state.lock().resolve_request = Some(id);
    }

    fn on_resolve_event(&self, id: ResolveRequestId, handle: EndpointHandle, event: ResolveEvent) {
        let mut events = vec![];
        {
            let table = self.contexts.read();
            let Some(ctx) = table.get(handle) else {
                return;
            };

            let mut down = self.down.lock();
            if down.resolving.get(&id) != Some(&handle) {
                trace!("ignoring stale resolution event for {}", ctx.key);
                return;
            }

            match event {
                ResolveEvent::Resolved(addr) => {
                    debug!("{} resolved to {}", ctx.key, addr);
                    down.resolving.remove(&id);
                    down.needs_rebuild = true;

                    let mut state = ctx.state.lock();
                    state.resolve_request = None;
                    // NB: retry_time is left alone, a failed connection keeps its backoff
                    state.remote_addr = Some(addr);
                }
                ResolveEvent::AttemptFailed => {
                    debug!("resolving {} failed - retrying", ctx.key);
                    events.push(StatusEvent::Error(ctx.info(), NetErrorCode::NameResolutionFailed));
                }
            }
        }
        self.fire(events);
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) {
        self.status_listeners.write().push(listener);
    }

    pub fn remove_status_listener(&self, listener: &Arc<dyn StatusListener>) -> Result<(), CommoError> {
        remove_listener(&mut self.status_listeners.write(), listener)
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.message_listeners.write().push(listener);
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> Result<(), CommoError> {
        remove_listener(&mut self.message_listeners.write(), listener)
    }
}

fn remove_listener<T: ?Sized>(listeners: &mut Vec<Arc<T>>, listener: &Arc<T>) -> Result<(), CommoError> {
    let before = listeners.len();
    listeners.retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    if listeners.len() == before {
        warn!("removing a listener that was not registered");
        return Err(CommoError::IllegalArgument);
    }
    Ok(())
}
