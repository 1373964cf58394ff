use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tracing::trace;

use crate::error::NetErrorCode;
use crate::message::cot::CotMessage;
use crate::stream::endpoint::EndpointInfo;

/// Connection state changes of endpoints. Callbacks are invoked from the streaming manager's
///  threads without any of its locks held, so it is fine to call back into the manager.
#[cfg_attr(test, automock)]
pub trait StatusListener: Send + Sync {
    fn endpoint_up(&self, endpoint: &EndpointInfo);
    fn endpoint_down(&self, endpoint: &EndpointInfo);
    /// A connection attempt or an established connection failed. The endpoint is retried.
    fn endpoint_error(&self, endpoint: &EndpointInfo, code: NetErrorCode);
}

/// Receives application messages, called from the dispatch thread in the order messages were
///  received on each endpoint
#[cfg_attr(test, automock)]
pub trait MessageListener: Send + Sync {
    fn message_received(&self, endpoint_key: &str, message: &CotMessage);
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StatusEvent {
    Up(EndpointInfo),
    Down(EndpointInfo),
    Error(EndpointInfo, NetErrorCode),
}

impl StatusEvent {
    pub fn notify(&self, listener: &dyn StatusListener) {
        match self {
            StatusEvent::Up(endpoint) => listener.endpoint_up(endpoint),
            StatusEvent::Down(endpoint) => listener.endpoint_down(endpoint),
            StatusEvent::Error(endpoint, code) => listener.endpoint_error(endpoint, *code),
        }
    }
}

/// Delivers events to a snapshot of the registered listeners
pub fn fire_status_events(listeners: &[Arc<dyn StatusListener>], events: Vec<StatusEvent>) {
    for event in events {
        trace!("status event {:?}", event);
        for listener in listeners {
            event.notify(listener.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use mockall::Sequence;
    use crate::stream::endpoint::EndpointHandle;
    use super::*;

    fn info() -> EndpointInfo {
        EndpointInfo {
            handle: EndpointHandle(3),
            key: "tcp:host:8087".into(),
        }
    }

    #[test]
    fn test_fire_in_order() {
        let mut seq = Sequence::new();
        let mut listener = MockStatusListener::new();
        listener.expect_endpoint_error()
            .with(eq(info()), eq(NetErrorCode::ConnRefused))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        listener.expect_endpoint_up()
            .with(eq(info()))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        listener.expect_endpoint_down()
            .with(eq(info()))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let listeners: Vec<Arc<dyn StatusListener>> = vec![Arc::new(listener)];
        fire_status_events(&listeners, vec![
            StatusEvent::Error(info(), NetErrorCode::ConnRefused),
            StatusEvent::Up(info()),
            StatusEvent::Down(info()),
        ]);
    }
}
