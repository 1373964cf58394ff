use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::message::cot::CotMessage;
use crate::message::wire::{serialize, ProtocolVersion};

/// An outbound message on one connection, serialized and possibly partially sent.
pub struct TxQueueItem {
    /// `None` for raw payloads that are never re-serialized (the authentication document)
    message: Option<CotMessage>,
    data: Bytes,
    sent: usize,
    /// Set for the protocol switch request: once it is fully sent, the connection stops
    ///  sending until the server responds.
    pub(crate) switch_request: bool,
}

impl TxQueueItem {
    pub fn message(message: CotMessage, version: ProtocolVersion) -> TxQueueItem {
        TxQueueItem {
            data: serialize(&message, version),
            message: Some(message),
            sent: 0,
            switch_request: false,
        }
    }

    pub fn raw(data: impl Into<Bytes>) -> TxQueueItem {
        TxQueueItem {
            message: None,
            data: data.into(),
            sent: 0,
            switch_request: false,
        }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.sent..]
    }

    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.data.len());
    }

    pub fn is_complete(&self) -> bool {
        self.sent == self.data.len()
    }

    fn is_started(&self) -> bool {
        self.sent > 0
    }
}

/// The transmit queue of a connection.
///
/// Application messages are appended. Control messages (ping, authentication, protocol switch)
///  go to the front, but never ahead of an item that is partially on the wire already. All
///  queued messages are serialized in the connection's current protocol version.
pub struct TxQueue {
    items: VecDeque<TxQueueItem>,
    version: ProtocolVersion,
}

impl TxQueue {
    pub fn new() -> TxQueue {
        TxQueue {
            items: VecDeque::new(),
            version: ProtocolVersion::Xml,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push_back(&mut self, message: CotMessage) {
        self.items.push_back(TxQueueItem::message(message, self.version));
    }

    pub fn push_front(&mut self, item: TxQueueItem) {
        match self.items.front() {
            Some(front) if front.is_started() => self.items.insert(1, item),
            _ => self.items.push_front(item),
        }
    }

    pub fn front_mut(&mut self) -> Option<&mut TxQueueItem> {
        self.items.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<TxQueueItem> {
        self.items.pop_front()
    }

    /// Switches to a new protocol version, re-serializing every message that was not started yet.
    ///  Raw items are passed on unchanged.
    pub fn switch_version(&mut self, version: ProtocolVersion) {
        trace!("switching tx queue with {} items from {:?} to {:?}", self.items.len(), self.version, version);
        self.version = version;
        for item in self.items.iter_mut() {
            if item.is_started() {
                continue;
            }
            if let Some(message) = &item.message {
                item.data = serialize(message, version);
            }
        }
    }

    /// Drops all items and goes back to XML
    pub fn clear(&mut self) {
        self.items.clear();
        self.version = ProtocolVersion::Xml;
    }
}
