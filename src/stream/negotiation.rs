use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::error::{NetErrorCode, TransportError};
use crate::message::control::{protocol_request, TakControlKind};
use crate::message::cot::CotMessage;
use crate::message::wire::{deserialize, ProtocolVersion};
use crate::stream::framer::{FrameSink, ProtoState};
use crate::stream::tx_queue::{TxQueue, TxQueueItem};

/// Per-connection negotiation fields that live outside the framer's protocol state
pub struct Negotiation {
    /// Set once the switch request is fully sent. Nothing else is sent until the server's
    ///  response arrives.
    pub blocked_for_response: bool,
    pub timeout: Instant,
}

impl Negotiation {
    pub fn new(timeout: Instant) -> Negotiation {
        Negotiation {
            blocked_for_response: false,
            timeout,
        }
    }
}

/// Receives the documents framed on one connection: negotiation control messages and pongs are
///  handled here, everything else is collected for dispatch to listeners.
pub struct ReceiveSink<'a> {
    pub endpoint: &'a str,
    pub negotiation: &'a mut Negotiation,
    pub tx: &'a mut TxQueue,
    pub received: &'a mut Vec<CotMessage>,
    pub now: Instant,
    pub proto_timeout: Duration,
}

impl FrameSink for ReceiveSink<'_> {
    fn on_frame(&mut self, payload: &[u8], version: ProtocolVersion, state: &mut ProtoState) {
        let msg = match deserialize(payload, version) {
            Ok(msg) => msg,
            Err(e) => {
                error!("{}: dropping undecodable message ({:?}): {}", self.endpoint, version, e);
                return;
            }
        };

        if let Some(kind) = msg.tak_control_kind() {
            self.on_control_message(kind, &msg, state);
            return;
        }
        if msg.is_pong() {
            trace!("{}: pong", self.endpoint);
            return;
        }
        self.received.push(msg);
    }
}

impl ReceiveSink<'_> {
    fn on_control_message(&mut self, kind: TakControlKind, msg: &CotMessage, state: &mut ProtoState) {
        match (kind, *state) {
            (TakControlKind::ProtocolSupport, ProtoState::XmlNegotiate) => {
                match msg.supported_protocol_versions() {
                    Ok(versions) if versions.contains(&ProtocolVersion::TakProtoV1) => {
                        info!("{}: server supports binary protocol version 1 - requesting switch", self.endpoint);
                        let request = protocol_request(&msg.uid, ProtocolVersion::TakProtoV1, self.proto_timeout);
                        let mut item = TxQueueItem::message(request, self.tx.version());
                        item.switch_request = true;
                        self.tx.push_front(item);

                        *state = ProtoState::WaitResponse;
                        self.negotiation.timeout = self.now + self.proto_timeout;
                    }
                    Ok(versions) => {
                        debug!("{}: server supports protocol versions {:?} - staying with XML", self.endpoint, versions);
                    }
                    Err(e) => {
                        warn!("{}: malformed protocol support message - ignoring: {}", self.endpoint, e);
                    }
                }
            }
            (TakControlKind::ProtocolResponse, ProtoState::WaitResponse) => {
                match msg.protocol_response_accepted() {
                    Ok(true) => {
                        info!("{}: server accepted protocol switch - switching to binary", self.endpoint);
                        *state = ProtoState::HdrMagic;
                        self.tx.switch_version(ProtocolVersion::TakProtoV1);
                    }
                    Ok(false) => {
                        warn!("{}: server rejected protocol switch - staying with XML", self.endpoint);
                        *state = ProtoState::XmlOnly;
                    }
                    Err(e) => {
                        warn!("{}: malformed protocol response, treating it as a rejection: {}", self.endpoint, e);
                        *state = ProtoState::XmlOnly;
                    }
                }
                self.negotiation.blocked_for_response = false;
            }
            (kind, state) => {
                warn!("{}: unexpected control message {:?} in protocol state {:?} - ignoring", self.endpoint, kind, state);
            }
        }
    }
}

/// Enforces the negotiation deadline. Without an advertisement from the server, the connection
///  stays XML for good. An unanswered switch request is an error.
pub fn check_negotiation_timeout(state: &mut ProtoState, negotiation: &Negotiation, now: Instant) -> Result<(), TransportError> {
    if now <= negotiation.timeout {
        return Ok(());
    }

    match *state {
        ProtoState::XmlNegotiate => {
            debug!("no protocol support advertisement - staying with XML");
            *state = ProtoState::XmlOnly;
            Ok(())
        }
        ProtoState::WaitResponse => Err(TransportError::new(NetErrorCode::Other, "timed out waiting for a response to the protocol switch request")),
        _ => Ok(()),
    }
}
