use std::sync::Arc;
use std::time::Duration;

use tracing::{info, trace};

use crate::stream::state::StreamingState;

const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Hands received messages to message listeners, decoupled from the I/O thread so that a slow
///  listener does not stall the network
#[tracing::instrument(skip(state), name = "dispatch")]
pub fn run_dispatch(state: Arc<StreamingState>) {
    info!("starting");
    while !state.is_stopping() {
        if dispatch_available(&state) == 0 {
            let mut rx_queue = state.rx_queue.lock();
            if rx_queue.is_empty() && !state.is_stopping() {
                state.rx_available.wait_for(&mut rx_queue, IDLE_WAIT);
            }
        }
    }
    info!("stopped");
}

/// Delivers everything that is currently queued, returning the number of messages. Listeners
///  are called without the queue lock held.
pub fn dispatch_available(state: &StreamingState) -> usize {
    let items = std::mem::take(&mut *state.rx_queue.lock());
    if items.is_empty() {
        return 0;
    }

    let listeners = state.message_listeners.read().clone();
    trace!("dispatching {} messages to {} listeners", items.len(), listeners.len());
    for item in &items {
        for listener in &listeners {
            listener.message_received(&item.key, &item.message);
        }
    }
    items.len()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use mockall::predicate::{always, eq, function};
    use mockall::Sequence;
    use crate::config::StreamingConfig;
    use crate::message::cot::{CotMessage, CotPoint};
    use crate::stream::endpoint::EndpointHandle;
    use crate::stream::listener::{MessageListener, MockMessageListener};
    use crate::stream::resolver::MockResolver;
    use crate::stream::state::RxQueueItem;
    use crate::test_util::transport::FakeTransportFactory;
    use super::*;

    fn state() -> Arc<StreamingState> {
        Arc::new(StreamingState::new("me", StreamingConfig::default(), Arc::new(FakeTransportFactory::default()), Arc::new(MockResolver::new())))
    }

    fn item(key: &str, uid: &str) -> RxQueueItem {
        RxQueueItem {
            handle: EndpointHandle(1),
            key: key.into(),
            message: CotMessage::new(uid, "a-f-G", "m-g", CotPoint::new(0.0, 0.0), Duration::from_secs(10)),
        }
    }

    #[test]
    fn test_dispatch_in_order() {
        let state = state();
        let mut listener = MockMessageListener::new();
        let mut seq = Sequence::new();
        for uid in ["a", "b", "c"] {
            listener.expect_message_received()
                .with(eq("tcp:x:1"), function(move |m: &CotMessage| m.uid == uid))
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }
        state.add_message_listener(Arc::new(listener));

        state.enqueue_received(vec![item("tcp:x:1", "a"), item("tcp:x:1", "b")]);
        state.enqueue_received(vec![item("tcp:x:1", "c")]);
        assert_eq!(dispatch_available(&state), 3);
        assert_eq!(dispatch_available(&state), 0);
    }

    #[test]
    fn test_dispatch_without_listeners_drops() {
        let state = state();
        state.enqueue_received(vec![item("tcp:x:1", "a")]);
        assert_eq!(dispatch_available(&state), 1);
        assert!(state.rx_queue.lock().is_empty());
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let state = state();
        let mut listener = MockMessageListener::new();
        listener.expect_message_received()
            .with(always(), always())
            .never();
        let listener: Arc<dyn MessageListener> = Arc::new(listener);
        state.add_message_listener(listener.clone());
        state.remove_message_listener(&listener).unwrap();
        assert!(state.remove_message_listener(&listener).is_err());

        state.enqueue_received(vec![item("tcp:x:1", "a")]);
        dispatch_available(&state);
    }

    #[test]
    fn test_thread_stops() {
        let state = state();
        let thread = {
            let state = state.clone();
            std::thread::spawn(move || run_dispatch(state))
        };
        std::thread::sleep(Duration::from_millis(10));
        state.stop();
        thread.join().unwrap();
    }
}
