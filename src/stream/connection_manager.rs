use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use tracing::{debug, error, info, trace};

use crate::error::{NetErrorCode, TransportError};
use crate::stream::context::{ConnectionContext, ContextState};
use crate::stream::endpoint::EndpointHandle;
use crate::stream::listener::StatusEvent;
use crate::stream::selector::{NetSelector, SocketId};
use crate::stream::state::{ContextTable, StreamingState};

/// Drives endpoints in the 'down' set: host name resolution, connection attempts with backoff,
///  and handshakes. Endpoints with a usable connection are handed over to the I/O thread.
pub struct ConnectionManager {
    state: Arc<StreamingState>,
    selector: Box<dyn NetSelector>,
    registered: (Vec<SocketId>, Vec<SocketId>),
}

impl ConnectionManager {
    pub fn new(state: Arc<StreamingState>, selector: Box<dyn NetSelector>) -> ConnectionManager {
        ConnectionManager {
            state,
            selector,
            registered: Default::default(),
        }
    }

    #[tracing::instrument(skip(self), name = "connection_manager")]
    pub fn run(mut self) {
        info!("starting");
        while !self.state.is_stopping() {
            self.run_once();
        }
        info!("stopped");
    }

    pub fn run_once(&mut self) {
        let mut events = Vec::new();
        let mut connected = FxHashSet::default();

        let (members, timeout) = self.prepare(&mut events, &mut connected);

        match self.selector.wait(timeout) {
            Ok(_) => {}
            Err(e) => error!("waiting for sockets failed: {}", e),
        }

        self.process(&members, &mut events, &mut connected);
        self.promote(connected, &mut events);
        self.state.fire(events);
    }

    /// Starts resolutions and connection attempts, and registers the sockets of pending
    ///  connections with the selector. Returns the members of the down set, and the timeout for
    ///  the wait.
    fn prepare(&mut self, events: &mut Vec<StatusEvent>, connected: &mut FxHashSet<EndpointHandle>) -> (Vec<EndpointHandle>, Duration) {
        let now = Instant::now();
        let connect_timeout = self.state.connect_timeout();
        let mut timeout = self.state.config.conn_select_timeout;

        let table = self.state.contexts.read();
        let (members, mut rebuild) = {
            let mut down = self.state.down.lock();
            (down.members.iter().copied().collect::<Vec<_>>(), std::mem::take(&mut down.needs_rebuild))
        };

        let mut read_sockets = Vec::new();
        let mut write_sockets = Vec::new();
        let mut to_resolve = Vec::new();

        for &handle in &members {
            let Some(ctx) = table.get(handle) else {
                continue;
            };
            let mut guard = ctx.state.lock();
            let st = &mut *guard;

            if st.needs_resolution() {
                if st.resolve_request.is_none() {
                    to_resolve.push(ctx.clone());
                }
                continue;
            }

            if st.ops.socket().is_none() {
                if st.retry_time > now {
                    continue;
                }
                let Some(remote) = st.remote_addr else {
                    continue;
                };

                debug!("connecting {} to {}", ctx.key, remote);
                st.retry_time = now + connect_timeout;
                match st.ops.connection_init_socket(remote) {
                    Ok(true) => {
                        match st.ops.connection_do_post(&mut rebuild) {
                            Ok(true) => {
                                connected.insert(handle);
                                continue;
                            }
                            Ok(false) => {}
                            Err(e) => {
                                self.fail(ctx, st, e, now, events);
                                continue;
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.fail(ctx, st, e, now, events);
                        continue;
                    }
                }
                rebuild = true;
            }

            if st.ops.has_expiration() {
                match st.ops.handle_expirations(now) {
                    Ok(Some(next)) => timeout = timeout.min(next),
                    Ok(None) => {}
                    Err(e) => {
                        self.fail(ctx, st, e, now, events);
                        rebuild = true;
                        continue;
                    }
                }
            }

            if let Some(socket) = st.ops.socket() {
                if st.ops.connection_in_progress() {
                    write_sockets.push(socket);
                }
                else {
                    if st.ops.connection_post_wants_read() {
                        read_sockets.push(socket);
                    }
                    if st.ops.connection_post_wants_write() {
                        write_sockets.push(socket);
                    }
                }
            }
        }

        for ctx in to_resolve {
            self.state.start_resolution(&ctx);
        }

        read_sockets.sort_by_key(|s| s.0);
        write_sockets.sort_by_key(|s| s.0);
        let sockets = (read_sockets, write_sockets);
        if rebuild || sockets != self.registered {
            trace!("registering {} read and {} write sockets", sockets.0.len(), sockets.1.len());
            if let Err(e) = self.selector.set_sockets(&sockets.0, &sockets.1) {
                error!("registering sockets failed, resetting all pending connections: {}", e);
                self.fail_all(&table, &members, e.code, now, events);
                self.registered = Default::default();
                // drop whatever part of the registration succeeded
                let _ = self.selector.set_sockets(&[], &[]);
                return (members, timeout);
            }
            self.registered = sockets;
        }

        (members, timeout)
    }

    /// Handles readiness after a wait: completes connects, advances handshakes and enforces the
    ///  connect timeout
    fn process(&mut self, members: &[EndpointHandle], events: &mut Vec<StatusEvent>, connected: &mut FxHashSet<EndpointHandle>) {
        let now = Instant::now();
        let table = self.state.contexts.read();
        let mut rebuild = false;

        for &handle in members {
            if connected.contains(&handle) {
                continue;
            }
            let Some(ctx) = table.get(handle) else {
                continue;
            };
            let mut guard = ctx.state.lock();
            let st = &mut *guard;
            let Some(socket) = st.ops.socket() else {
                continue;
            };

            let result = if st.ops.connection_in_progress() {
                if self.selector.write_ready(socket) {
                    match st.ops.connection_check_connected() {
                        Ok(true) => {
                            trace!("{}: connected", ctx.key);
                            st.ops.connection_do_post(&mut rebuild)
                        }
                        other => other,
                    }
                }
                else {
                    Ok(false)
                }
            }
            else {
                let wants_read = st.ops.connection_post_wants_read();
                let wants_write = st.ops.connection_post_wants_write();
                if (wants_read && self.selector.read_ready(socket))
                    || (wants_write && self.selector.write_ready(socket))
                    || (!wants_read && !wants_write)
                {
                    st.ops.connection_do_post(&mut rebuild)
                }
                else {
                    Ok(false)
                }
            };

            match result {
                Ok(true) => {
                    connected.insert(handle);
                }
                Ok(false) => {
                    if now >= st.retry_time {
                        self.fail(ctx, st, TransportError::new(NetErrorCode::ConnTimeout, "connection attempt timed out"), now, events);
                    }
                }
                Err(e) => {
                    self.fail(ctx, st, e, now, events);
                }
            }
        }

        if rebuild {
            self.state.down.lock().needs_rebuild = true;
        }
    }

    /// Moves newly connected endpoints from the down set to the up set
    fn promote(&self, connected: FxHashSet<EndpointHandle>, events: &mut Vec<StatusEvent>) {
        if connected.is_empty() {
            return;
        }

        let now = Instant::now();
        let config = &self.state.config;
        let table = self.state.contexts.read();

        let mut promoted = Vec::new();
        for handle in connected {
            let Some(ctx) = table.get(handle) else {
                continue;
            };
            ctx.state.lock().on_connected(now, config.proto_timeout, &self.state.my_uid, config.ping_stale_time);
            promoted.push(ctx);
        }

        {
            let mut down = self.state.down.lock();
            for ctx in &promoted {
                down.members.remove(&ctx.handle);
            }
            down.needs_rebuild = true;
        }
        {
            let mut up = self.state.up.lock();
            for ctx in &promoted {
                up.members.insert(ctx.handle);
            }
            up.needs_rebuild = true;
        }

        for ctx in promoted {
            info!("{} is up", ctx.key);
            events.push(StatusEvent::Up(ctx.info()));
        }
    }

    fn fail(&self, ctx: &ConnectionContext, st: &mut ContextState, e: TransportError, now: Instant, events: &mut Vec<StatusEvent>) {
        debug!("{}: {} - retrying in {:?}", ctx.key, e, self.state.config.connect_retry_backoff);
        st.reset(now + self.state.config.connect_retry_backoff, true);
        events.push(StatusEvent::Error(ctx.info(), e.code));
    }

    fn fail_all(&self, table: &ContextTable, members: &[EndpointHandle], code: NetErrorCode, now: Instant, events: &mut Vec<StatusEvent>) {
        for &handle in members {
            let Some(ctx) = table.get(handle) else {
                continue;
            };
            let mut st = ctx.state.lock();
            if st.ops.socket().is_some() {
                self.fail(ctx, &mut st, TransportError::new(code, "socket registration failed"), now, events);
            }
        }
    }
}
