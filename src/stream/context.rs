use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::message::control::ping;
use crate::message::cot::CotMessage;
use crate::stream::endpoint::{EndpointHandle, EndpointInfo, TransportKind};
use crate::stream::framer::Framer;
use crate::stream::negotiation::Negotiation;
use crate::stream::resolver::ResolveRequestId;
use crate::stream::transport::{FirstTraffic, TransportOps};
use crate::stream::tx_queue::{TxQueue, TxQueueItem};

/// One configured endpoint. The immutable identity lives here, everything that changes with the
///  connection lifecycle is in [ContextState].
pub struct ConnectionContext {
    pub handle: EndpointHandle,
    pub key: Arc<str>,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub type_filter: FxHashSet<String>,
    pub state: Mutex<ContextState>,
}

impl ConnectionContext {
    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            handle: self.handle,
            key: self.key.clone(),
        }
    }

    /// An empty filter matches everything
    pub fn accepts_type(&self, event_type: &str) -> bool {
        self.type_filter.is_empty() || self.type_filter.contains(event_type)
    }
}

pub struct ContextState {
    pub ops: Box<dyn TransportOps>,
    /// `None` while a host name waits for resolution
    pub remote_addr: Option<SocketAddr>,
    /// true if the address comes from resolving a host name and must be resolved again after a
    ///  reset
    pub has_hostname: bool,
    pub resolve_request: Option<ResolveRequestId>,
    /// While down and unconnected, the earliest time for the next connection attempt. While
    ///  connecting, the deadline for the attempt.
    pub retry_time: Instant,
    pub last_rx_time: Instant,
    pub next_ping_time: Instant,
    pub framer: Framer,
    pub negotiation: Negotiation,
    pub tx: TxQueue,
    /// raw document sent first on every new connection
    pub auth_document: Option<Bytes>,
}

impl ContextState {
    pub fn new(ops: Box<dyn TransportOps>, remote_addr: Option<SocketAddr>, auth_document: Option<Bytes>, rx_buffer_size: usize, now: Instant) -> ContextState {
        ContextState {
            ops,
            has_hostname: remote_addr.is_none(),
            remote_addr,
            resolve_request: None,
            retry_time: now,
            last_rx_time: now,
            next_ping_time: now,
            framer: Framer::new(rx_buffer_size),
            negotiation: Negotiation::new(now),
            tx: TxQueue::new(),
            auth_document,
        }
    }

    pub fn needs_resolution(&self) -> bool {
        self.remote_addr.is_none()
    }

    pub fn is_connecting(&self) -> bool {
        self.ops.socket().is_some()
    }

    /// Tears down the transport and schedules the next connection attempt. `clear_io` also drops
    ///  queued data and starts protocol negotiation from scratch.
    pub fn reset(&mut self, next_retry: Instant, clear_io: bool) {
        self.ops.reset();
        self.retry_time = next_retry;
        if self.has_hostname {
            self.remote_addr = None;
        }

        if clear_io {
            self.tx.clear();
            self.framer.reset();
            self.negotiation.blocked_for_response = false;
        }
    }

    /// Prepares a freshly established connection for the I/O thread
    pub fn on_connected(&mut self, now: Instant, proto_timeout: Duration, my_uid: &str, ping_stale_time: Duration) {
        self.last_rx_time = now;
        self.next_ping_time = now;
        self.negotiation = Negotiation::new(now + proto_timeout);

        match (self.ops.first_traffic(), &self.auth_document) {
            (FirstTraffic::Nothing, _) => {}
            (FirstTraffic::Auth | FirstTraffic::AuthOrPing, Some(auth)) => {
                trace!("queueing authentication document");
                self.tx.push_front(TxQueueItem::raw(auth.clone()));
            }
            (FirstTraffic::Auth, None) => {}
            (FirstTraffic::AuthOrPing, None) => {
                self.push_ping(my_uid, ping_stale_time);
            }
        }
    }

    pub fn push_ping(&mut self, my_uid: &str, ping_stale_time: Duration) {
        let msg = ping(my_uid, ping_stale_time);
        let item = TxQueueItem::message(msg, self.tx.version());
        self.tx.push_front(item);
    }

    pub fn queue_message(&mut self, message: &CotMessage) {
        self.tx.push_back(message.clone());
    }
}
