use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

use crate::enrollment::collaborators::{EnrollmentCrypto, EnrollmentObserver, TransferOutcome, UrlTransfer};
use crate::enrollment::request::EnrollmentRequest;
use crate::enrollment::types::{EnrollmentId, EnrollmentParams, EnrollmentStep, EnrollmentUpdate, FileIoStatus};
use crate::error::CommoError;

const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Requests {
    all: FxHashMap<EnrollmentId, Arc<Mutex<EnrollmentRequest>>>,
    /// initialized but not started
    new: FxHashSet<EnrollmentId>,
    needs_attention: VecDeque<EnrollmentId>,
    next_id: u32,
}

struct Shared {
    my_uid: String,
    crypto: Arc<dyn EnrollmentCrypto>,
    transfer: Arc<dyn UrlTransfer>,
    observer: Arc<dyn EnrollmentObserver>,
    /// NB: this lock is never acquired while a request's lock is held
    requests: Mutex<Requests>,
    attention: Condvar,
    stopping: AtomicBool,
}

impl Shared {
    fn mark_for_attention(&self, id: EnrollmentId) {
        let mut requests = self.requests.lock();
        requests.needs_attention.push_back(id);
        self.attention.notify_all();
    }

    fn request(&self, id: EnrollmentId) -> Option<Arc<Mutex<EnrollmentRequest>>> {
        self.requests.lock().all.get(&id).cloned()
    }
}

/// Provisions client certificates from a server, running each enrollment through key
///  generation, CSR and signing on a dedicated worker thread
pub struct EnrollmentManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl EnrollmentManager {
    pub fn new(my_uid: &str, crypto: Arc<dyn EnrollmentCrypto>, transfer: Arc<dyn UrlTransfer>, observer: Arc<dyn EnrollmentObserver>) -> anyhow::Result<EnrollmentManager> {
        let shared = Arc::new(Shared {
            my_uid: my_uid.to_string(),
            crypto,
            transfer,
            observer,
            requests: Default::default(),
            attention: Condvar::new(),
            stopping: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("cot-enroll".to_string())
            .spawn(move || run_worker(worker_shared))?;

        Ok(EnrollmentManager {
            shared,
            worker: Some(worker),
        })
    }

    /// Validates the parameters and registers a new enrollment. It does not do anything until it
    ///  is started.
    pub fn enrollment_init(&self, params: EnrollmentParams) -> Result<EnrollmentId, CommoError> {
        if params.port == 0 || params.host.is_empty() || params.user.is_empty() || params.key_length == 0 {
            debug!("invalid enrollment parameters");
            return Err(CommoError::IllegalArgument);
        }

        let trust = match &params.ca_cert {
            None => None,
            Some(ca_cert) => {
                let password = params.ca_cert_password.as_deref()
                    .ok_or(CommoError::InvalidCaCertPassword)?;
                let certs = self.shared.crypto.parse_ca_bundle(ca_cert, password)
                    .map_err(|e| {
                        warn!("invalid CA certificate for enrollment: {}", e);
                        CommoError::InvalidCaCert
                    })?;
                Some(certs)
            }
        };

        let mut requests = self.shared.requests.lock();
        let id = EnrollmentId(requests.next_id);
        if requests.all.contains_key(&id) {
            warn!("too many concurrent enrollment requests");
            return Err(CommoError::IllegalArgument);
        }
        requests.next_id = requests.next_id.wrapping_add(1);

        info!("new {}: {}:{}, {} auth, host verification {}, client version {}", id, params.host, params.port,
            if params.use_token_auth { "token" } else { "basic" },
            if params.verify_host { "on" } else { "off" },
            params.client_version.as_deref().unwrap_or("-"));

        let request = EnrollmentRequest::new(id, params, &self.shared.my_uid, trust);
        requests.all.insert(id, Arc::new(Mutex::new(request)));
        requests.new.insert(id);
        Ok(id)
    }

    pub fn enrollment_start(&self, id: EnrollmentId) -> Result<(), CommoError> {
        let mut requests = self.shared.requests.lock();
        if !requests.new.remove(&id) {
            return Err(CommoError::IllegalArgument);
        }
        debug!("starting {}", id);
        requests.needs_attention.push_back(id);
        self.shared.attention.notify_all();
        Ok(())
    }

    /// Enrollments that were initialized and did not complete yet
    pub fn active_request_count(&self) -> usize {
        self.shared.requests.lock().all.len()
    }
}

impl Drop for EnrollmentManager {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        {
            let _requests = self.shared.requests.lock();
            self.shared.attention.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("enrollment worker panicked");
            }
        }
    }
}

#[tracing::instrument(skip(shared), name = "enrollment")]
fn run_worker(shared: Arc<Shared>) {
    while !shared.stopping.load(Ordering::Acquire) {
        let Some(request) = next_request(&shared) else {
            continue;
        };

        let mut guard = request.lock();
        match guard.step {
            EnrollmentStep::KeyGen => {
                let update = guard.generate_key(shared.crypto.as_ref());
                let id = guard.id;
                drop(guard);

                shared.observer.enrollment_update(&update);
                // KEYGEN is followed by the CSR transfer, or by cleanup after a failure
                shared.mark_for_attention(id);
            }
            EnrollmentStep::Csr | EnrollmentStep::Sign => {
                let id = guard.id;
                let step = guard.step;
                let url_request = guard.url_request();
                drop(guard);

                match url_request {
                    Ok(url_request) => {
                        debug!("{}: requesting {}", id, url_request.url);
                        let weak = Arc::downgrade(&shared);
                        shared.transfer.start(url_request, Arc::new(move |outcome| on_transfer_update(&weak, id, step, outcome)));
                    }
                    Err(e) => {
                        error!("{}: invalid server URL: {}", id, e);
                        request.lock().completed = true;
                        let mut update = EnrollmentUpdate::new(id, step, FileIoStatus::UrlInvalid);
                        update.additional_info = Some(e.to_string());
                        shared.observer.enrollment_update(&update);
                        shared.mark_for_attention(id);
                    }
                }
            }
        }
    }
    debug!("enrollment worker stopped");
}

/// Waits for the next request that needs work. Completed requests are discarded on the way.
fn next_request(shared: &Shared) -> Option<Arc<Mutex<EnrollmentRequest>>> {
    let mut requests = shared.requests.lock();
    let Some(id) = requests.needs_attention.pop_front() else {
        if !shared.stopping.load(Ordering::Acquire) {
            shared.attention.wait_for(&mut requests, IDLE_WAIT);
        }
        return None;
    };

    let request = requests.all.get(&id)?.clone();
    if request.lock().completed {
        debug!("{}: done", id);
        requests.all.remove(&id);
        return None;
    }
    Some(request)
}

fn on_transfer_update(shared: &Weak<Shared>, id: EnrollmentId, step: EnrollmentStep, outcome: TransferOutcome) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let Some(request) = shared.request(id) else {
        return;
    };

    if outcome.status == FileIoStatus::InProgress {
        let update = EnrollmentUpdate {
            additional_info: outcome.additional_info,
            bytes_transferred: outcome.bytes_transferred,
            total_bytes: outcome.total_bytes,
            ..EnrollmentUpdate::new(id, step, FileIoStatus::InProgress)
        };
        shared.observer.enrollment_update(&update);
        return;
    }

    let update = request.lock().on_transfer_complete(shared.crypto.as_ref(), outcome);
    // the update goes out before the worker can start the next step
    shared.observer.enrollment_update(&update);
    shared.mark_for_attention(id);
}
