use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace};

use crate::error::{NetErrorCode, TransportError};
use crate::stream::context::{ConnectionContext, ContextState};
use crate::stream::endpoint::EndpointHandle;
use crate::stream::listener::StatusEvent;
use crate::stream::negotiation::{check_negotiation_timeout, ReceiveSink};
use crate::stream::selector::{NetSelector, SocketId};
use crate::stream::state::{RxQueueItem, StreamingState};

/// Why an established connection is torn down
enum Demotion {
    /// reconnect requested through the API
    Requested,
    Failed(TransportError),
}

/// Drives endpoints in the 'up' set: writes queued messages, reads and frames received data,
///  pings idle servers and demotes failed connections to the 'down' set.
pub struct IoManager {
    state: Arc<StreamingState>,
    selector: Box<dyn NetSelector>,
    registered: (Vec<SocketId>, Vec<SocketId>),
}

impl IoManager {
    pub fn new(state: Arc<StreamingState>, selector: Box<dyn NetSelector>) -> IoManager {
        IoManager {
            state,
            selector,
            registered: Default::default(),
        }
    }

    #[tracing::instrument(skip(self), name = "io_manager")]
    pub fn run(mut self) {
        info!("starting");
        while !self.state.is_stopping() {
            self.run_once();
        }
        info!("stopped");
    }

    pub fn run_once(&mut self) {
        let mut demoted = FxHashMap::default();

        let (members, timeout) = self.prepare(&mut demoted);

        match self.selector.wait(timeout) {
            Ok(_) => {}
            Err(e) => error!("waiting for sockets failed: {}", e),
        }

        let received = self.process(&members, &mut demoted);
        self.state.enqueue_received(received);

        let events = self.demote(demoted);
        self.state.fire(events);
    }

    fn prepare(&mut self, demoted: &mut FxHashMap<EndpointHandle, Demotion>) -> (Vec<EndpointHandle>, Duration) {
        let now = Instant::now();
        let mut timeout = self.state.config.io_select_timeout;

        let table = self.state.contexts.read();
        let (members, resets, rebuild) = {
            let mut up = self.state.up.lock();
            (
                up.members.iter().copied().collect::<Vec<_>>(),
                std::mem::take(&mut up.reset_requested),
                std::mem::take(&mut up.needs_rebuild),
            )
        };

        let mut read_sockets = Vec::new();
        let mut write_sockets = Vec::new();

        for &handle in &members {
            if resets.contains(&handle) {
                demoted.insert(handle, Demotion::Requested);
                continue;
            }
            let Some(ctx) = table.get(handle) else {
                continue;
            };
            let mut guard = ctx.state.lock();
            let st = &mut *guard;

            if let Err(e) = check_protocol_timeout(st, now) {
                demoted.insert(handle, Demotion::Failed(e));
                continue;
            }

            if st.ops.has_expiration() {
                match st.ops.handle_expirations(now) {
                    Ok(Some(next)) => timeout = timeout.min(next),
                    Ok(None) => {}
                    Err(e) => {
                        demoted.insert(handle, Demotion::Failed(e));
                        continue;
                    }
                }
            }

            let Some(socket) = st.ops.socket() else {
                continue;
            };
            read_sockets.push(socket);
            if st.ops.io_wants_write(tx_pending(st)) {
                write_sockets.push(socket);
            }
        }

        read_sockets.sort_by_key(|s| s.0);
        write_sockets.sort_by_key(|s| s.0);
        let sockets = (read_sockets, write_sockets);
        if rebuild || sockets != self.registered {
            trace!("registering {} read and {} write sockets", sockets.0.len(), sockets.1.len());
            if let Err(e) = self.selector.set_sockets(&sockets.0, &sockets.1) {
                error!("registering sockets failed, resetting all connections: {}", e);
                for &handle in &members {
                    demoted.entry(handle)
                        .or_insert_with(|| Demotion::Failed(TransportError::new(e.code, "socket registration failed")));
                }
                self.registered = Default::default();
                let _ = self.selector.set_sockets(&[], &[]);
                return (members, timeout);
            }
            self.registered = sockets;
        }

        (members, timeout)
    }

    fn process(&mut self, members: &[EndpointHandle], demoted: &mut FxHashMap<EndpointHandle, Demotion>) -> Vec<RxQueueItem> {
        let now = Instant::now();
        let monitor = self.state.monitor();
        let table = self.state.contexts.read();
        let mut received = Vec::new();

        for &handle in members {
            if demoted.contains_key(&handle) {
                continue;
            }
            let Some(ctx) = table.get(handle) else {
                continue;
            };
            let mut guard = ctx.state.lock();
            let st = &mut *guard;
            if st.ops.socket().is_none() {
                continue;
            }

            if st.ops.io_wants_write(tx_pending(st)) && st.ops.io_write_ready(self.selector.as_ref()) {
                if let Err(e) = drain_tx(st) {
                    demoted.insert(handle, Demotion::Failed(e));
                    continue;
                }
            }

            let got_data = if st.ops.io_read_ready(self.selector.as_ref()) {
                match self.read_available(ctx, st, now, &mut received) {
                    Ok(got_data) => got_data,
                    Err(e) => {
                        demoted.insert(handle, Demotion::Failed(e));
                        continue;
                    }
                }
            }
            else {
                false
            };

            if !got_data && monitor {
                if let Err(e) = self.check_idle(ctx, st, now) {
                    demoted.insert(handle, Demotion::Failed(e));
                    continue;
                }
            }

            if let Err(e) = check_protocol_timeout(st, now) {
                demoted.insert(handle, Demotion::Failed(e));
            }
        }

        received
    }

    /// Reads until the transport has no more data, framing every chunk. Returns true if anything
    ///  was read.
    fn read_available(&self, ctx: &ConnectionContext, st: &mut ContextState, now: Instant, received: &mut Vec<RxQueueItem>) -> Result<bool, TransportError> {
        let mut got_data = false;
        let mut messages = Vec::new();

        loop {
            let n = st.ops.io_read(st.framer.write_space())?;
            if n == 0 {
                break;
            }
            got_data = true;

            let mut sink = ReceiveSink {
                endpoint: &ctx.key,
                negotiation: &mut st.negotiation,
                tx: &mut st.tx,
                received: &mut messages,
                now,
                proto_timeout: self.state.config.proto_timeout,
            };
            st.framer.scan(n, &mut sink);
        }

        if got_data {
            st.last_rx_time = now;
        }
        received.extend(messages.into_iter()
            .map(|message| RxQueueItem {
                handle: ctx.handle,
                key: ctx.key.clone(),
                message,
            }));
        Ok(got_data)
    }

    /// Pings a server that has been silent for a while, and gives up on one that stays silent
    fn check_idle(&self, ctx: &ConnectionContext, st: &mut ContextState, now: Instant) -> Result<(), TransportError> {
        let config = &self.state.config;
        let idle = now.saturating_duration_since(st.last_rx_time);

        if idle >= config.rx_timeout {
            debug!("{}: nothing received for {:?}", ctx.key, idle);
            return Err(TransportError::new(NetErrorCode::IoRxDataTimeout, format!("nothing received for {:?}", idle)));
        }
        if idle >= config.rx_stale && now >= st.next_ping_time {
            debug!("{}: nothing received for {:?} - sending ping", ctx.key, idle);
            st.push_ping(&self.state.my_uid, config.ping_stale_time);
            st.next_ping_time = now + config.rx_stale_ping_interval;
        }
        Ok(())
    }

    /// Resets demoted connections and moves them from the up set to the down set
    fn demote(&self, demoted: FxHashMap<EndpointHandle, Demotion>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        if demoted.is_empty() {
            return events;
        }

        let now = Instant::now();
        let table = self.state.contexts.read();

        for (handle, demotion) in demoted {
            let Some(ctx) = table.get(handle) else {
                continue;
            };

            {
                let mut up = self.state.up.lock();
                if !up.members.remove(&handle) {
                    continue;
                }
                up.reset_requested.remove(&handle);
                up.needs_rebuild = true;
            }

            ctx.state.lock().reset(now + self.state.config.connect_retry_backoff, true);

            {
                let mut down = self.state.down.lock();
                down.members.insert(handle);
                down.needs_rebuild = true;
            }

            match demotion {
                Demotion::Requested => {
                    info!("{} is down: reconnect requested", ctx.key);
                }
                Demotion::Failed(e) => {
                    info!("{} is down: {}", ctx.key, e);
                    events.push(StatusEvent::Error(ctx.info(), e.code));
                }
            }
            events.push(StatusEvent::Down(ctx.info()));
        }
        events
    }
}

fn tx_pending(st: &ContextState) -> bool {
    !st.tx.is_empty() && !st.negotiation.blocked_for_response
}

fn check_protocol_timeout(st: &mut ContextState, now: Instant) -> Result<(), TransportError> {
    let mut proto_state = st.framer.state();
    let result = check_negotiation_timeout(&mut proto_state, &st.negotiation, now);
    st.framer.set_state(proto_state);
    result
}

/// Writes queued data until the queue is empty, the transport would block, or a protocol switch
///  request was sent and the response is outstanding
fn drain_tx(st: &mut ContextState) -> Result<(), TransportError> {
    let mut wrote = false;

    while !st.negotiation.blocked_for_response {
        let Some(item) = st.tx.front_mut() else {
            break;
        };
        let n = st.ops.io_write(item.remaining())?;
        if n == 0 {
            break;
        }
        wrote = true;
        item.advance(n);

        if item.is_complete() {
            let switch_request = item.switch_request;
            st.tx.pop_front();
            if switch_request {
                trace!("protocol switch request sent - waiting for the response");
                st.negotiation.blocked_for_response = true;
            }
        }
    }

    if !wrote {
        st.ops.io_write_flush()?;
    }
    Ok(())
}
