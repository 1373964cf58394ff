use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResolveRequestId(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResolveEvent {
    Resolved(SocketAddr),
    /// A single attempt failed. The resolver keeps trying.
    AttemptFailed,
}

pub type ResolveCallback = Arc<dyn Fn(ResolveRequestId, ResolveEvent) + Send + Sync>;

/// Asynchronous host name resolution. A request is retried until it succeeds or is cancelled,
///  and the callback is invoked for every failed attempt and for the final result.
///
/// The callback is called from a thread owned by the resolver.
#[cfg_attr(test, automock)]
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16, on_event: ResolveCallback) -> ResolveRequestId;

    /// Stops retrying. A callback that is running concurrently may still complete.
    fn cancel(&self, id: ResolveRequestId);
}

pub struct TokioResolver {
    runtime: Option<Runtime>,
    retry_interval: Duration,
    next_id: AtomicU64,
    tasks: Arc<Mutex<FxHashMap<ResolveRequestId, JoinHandle<()>>>>,
}

impl TokioResolver {
    pub fn new(retry_interval: Duration) -> anyhow::Result<TokioResolver> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("cot-resolver")
            .enable_all()
            .build()?;

        Ok(TokioResolver {
            runtime: Some(runtime),
            retry_interval,
            next_id: AtomicU64::new(0),
            tasks: Default::default(),
        })
    }
}

impl Resolver for TokioResolver {
    fn resolve(&self, host: &str, port: u16, on_event: ResolveCallback) -> ResolveRequestId {
        let id = ResolveRequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let host = host.to_string();
        let retry_interval = self.retry_interval;
        let tasks = self.tasks.clone();

        // holding the lock while spawning keeps the task from removing itself before it is registered
        let mut task_map = self.tasks.lock();
        let Some(runtime) = &self.runtime else {
            return id;
        };
        let handle = runtime.spawn(async move {
            loop {
                match tokio::net::lookup_host((host.as_str(), port)).await {
                    Ok(mut addrs) => {
                        if let Some(addr) = addrs.next() {
                            trace!("resolved {} to {}", host, addr);
                            tasks.lock().remove(&id);
                            on_event(id, ResolveEvent::Resolved(addr));
                            return;
                        }
                        debug!("no address for {}", host);
                    }
                    Err(e) => {
                        debug!("resolving {} failed: {}", host, e);
                    }
                }
                on_event(id, ResolveEvent::AttemptFailed);
                tokio::time::sleep(retry_interval).await;
            }
        });
        task_map.insert(id, handle);
        id
    }

    fn cancel(&self, id: ResolveRequestId) {
        if let Some(handle) = self.tasks.lock().remove(&id) {
            trace!("cancelling resolution {:?}", id);
            handle.abort();
        }
    }
}

impl Drop for TokioResolver {
    fn drop(&mut self) {
        // the last reference may be released by a callback on the runtime's own worker thread,
        //  where a blocking shutdown is not permitted
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
