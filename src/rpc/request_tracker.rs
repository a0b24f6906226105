//! Correlates outbound requests with their inbound responses by request id.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::trace;

use crate::common::{DhtMessage, RequestId};

/// How often pending requests are checked against their deadline.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// The terminal outcome of a request, delivered exactly once.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Response(DhtMessage),
    TimedOut,
    /// The request could not be delivered, or the tracker shut down.
    Failed(String),
}

#[derive(Debug)]
struct PendingRequest {
    issued_at: Instant,
    deadline: Instant,
    slot: Sender<RequestOutcome>,
}

type PendingMap = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;

/// A request awaiting its response.
pub struct PendingHandle {
    request_id: RequestId,
    deadline: Instant,
    receiver: Receiver<RequestOutcome>,
}

impl PendingHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns the outcome if the request was already resolved.
    pub fn try_outcome(&self) -> Option<RequestOutcome> {
        self.receiver.try_recv().ok()
    }

    /// Block until the request is resolved.
    pub fn wait(self) -> RequestOutcome {
        // The sweeper resolves expired requests, the extra grace only matters
        // if the sweeper is gone.
        match self
            .receiver
            .recv_deadline(self.deadline + DEFAULT_SWEEP_INTERVAL * 4)
        {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => RequestOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                RequestOutcome::Failed("request tracker shut down".to_string())
            }
        }
    }
}

impl Debug for PendingHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingHandle")
            .field("request_id", &self.request_id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("request id {0} is already pending")]
pub struct DuplicateRequestId(pub RequestId);

/// Table of inflight requests shared by the transport and its callers.
///
/// A background thread expires requests past their deadline, so idle periods
/// don't leak entries.
pub struct RequestTracker {
    pending: PendingMap,
    stop: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (stop, stopped) = flume::bounded::<()>(1);

        let sweeper = {
            let pending = pending.clone();

            thread::Builder::new()
                .name("mangamesh-request-sweeper".to_string())
                .spawn(move || loop {
                    match stopped.recv_timeout(sweep_interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            expire(&pending, Instant::now());
                        }
                        _ => break,
                    }
                })
                .ok()
        };

        Self {
            pending,
            stop: Mutex::new(Some(stop)),
            sweeper: Mutex::new(sweeper),
        }
    }

    // === Public Methods ===

    /// Start tracking a request, returning the handle its caller waits on.
    pub fn register(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<PendingHandle, DuplicateRequestId> {
        let mut pending = lock(&self.pending);

        if pending.contains_key(&request_id) {
            return Err(DuplicateRequestId(request_id));
        }

        let (slot, receiver) = flume::bounded(1);
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;

        pending.insert(
            request_id,
            PendingRequest {
                issued_at,
                deadline,
                slot,
            },
        );

        Ok(PendingHandle {
            request_id,
            deadline,
            receiver,
        })
    }

    /// Hand a response to the waiter of `request_id`.
    ///
    /// Returns false for unknown or already resolved ids, which are ignored.
    pub fn resolve(&self, request_id: &RequestId, response: DhtMessage) -> bool {
        let Some(request) = lock(&self.pending).remove(request_id) else {
            trace!(
                context = "request_tracker",
                %request_id,
                "Unexpected or late response"
            );
            return false;
        };

        trace!(
            context = "request_tracker",
            %request_id,
            elapsed = ?request.issued_at.elapsed(),
            "Resolved request"
        );

        let _ = request.slot.send(RequestOutcome::Response(response));
        true
    }

    /// Resolve a request with a delivery failure.
    pub fn fail(&self, request_id: &RequestId, reason: impl Into<String>) -> bool {
        let Some(request) = lock(&self.pending).remove(request_id) else {
            return false;
        };

        let _ = request.slot.send(RequestOutcome::Failed(reason.into()));
        true
    }

    /// Resolve every request past its deadline as timed out, returns how many expired.
    pub fn expire(&self) -> usize {
        expire(&self.pending, Instant::now())
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the sweeper and fail everything still pending.
    pub fn shutdown(&self) {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.join();
        }

        for (_, request) in lock(&self.pending).drain() {
            let _ = request
                .slot
                .send(RequestOutcome::Failed("request tracker shut down".to_string()));
        }
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for RequestTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracker")
            .field("pending", &self.len())
            .finish()
    }
}

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn expire(pending: &PendingMap, now: Instant) -> usize {
    let expired: Vec<PendingRequest> = {
        let mut pending = lock(pending);

        let ids: Vec<RequestId> = pending
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        ids.iter().filter_map(|id| pending.remove(id)).collect()
    };

    for request in &expired {
        let _ = request.slot.send(RequestOutcome::TimedOut);
    }

    expired.len()
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::common::{MessageType, NodeIdentity};

    fn pong_for(request_id: RequestId) -> DhtMessage {
        DhtMessage::new_signed(
            &NodeIdentity::generate(),
            MessageType::Pong,
            Bytes::new(),
            request_id,
            0,
        )
    }

    #[test]
    fn resolve_wakes_waiter() {
        let tracker = RequestTracker::new();
        let request_id = RequestId::random();

        let handle = tracker
            .register(request_id, Duration::from_secs(5))
            .unwrap();

        assert!(tracker.resolve(&request_id, pong_for(request_id)));

        match handle.wait() {
            RequestOutcome::Response(message) => assert_eq!(message.request_id, request_id),
            outcome => panic!("unexpected outcome {outcome:?}"),
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn duplicate_responses_resolve_once() {
        let tracker = RequestTracker::new();
        let request_id = RequestId::random();

        let handle = tracker
            .register(request_id, Duration::from_secs(5))
            .unwrap();

        assert!(tracker.resolve(&request_id, pong_for(request_id)));
        assert!(!tracker.resolve(&request_id, pong_for(request_id)));
        assert!(!tracker.fail(&request_id, "late"));

        assert!(matches!(handle.try_outcome(), Some(RequestOutcome::Response(_))));
        assert!(handle.try_outcome().is_none());
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let tracker = RequestTracker::new();
        let request_id = RequestId::random();

        assert!(!tracker.resolve(&request_id, pong_for(request_id)));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let tracker = RequestTracker::new();
        let request_id = RequestId::random();

        let _handle = tracker
            .register(request_id, Duration::from_secs(5))
            .unwrap();

        assert_eq!(
            tracker
                .register(request_id, Duration::from_secs(5))
                .unwrap_err(),
            DuplicateRequestId(request_id)
        );
    }

    #[test]
    fn unanswered_request_times_out_after_deadline() {
        let tracker = RequestTracker::with_sweep_interval(Duration::from_millis(10));
        let request_id = RequestId::random();
        let timeout = Duration::from_millis(100);

        let start = Instant::now();
        let handle = tracker.register(request_id, timeout).unwrap();

        assert!(matches!(handle.wait(), RequestOutcome::TimedOut));
        assert!(start.elapsed() >= timeout);

        // A response arriving after the timeout changes nothing.
        assert!(!tracker.resolve(&request_id, pong_for(request_id)));
    }

    #[test]
    fn sweeper_expires_without_new_traffic() {
        let tracker = RequestTracker::with_sweep_interval(Duration::from_millis(10));

        for _ in 0..10 {
            // Handles are dropped right away, nobody is waiting.
            tracker
                .register(RequestId::random(), Duration::from_millis(20))
                .unwrap();
        }
        assert_eq!(tracker.len(), 10);

        thread::sleep(Duration::from_millis(200));

        assert!(tracker.is_empty());
    }

    #[test]
    fn shutdown_fails_pending() {
        let tracker = RequestTracker::new();
        let handle = tracker
            .register(RequestId::random(), Duration::from_secs(60))
            .unwrap();

        tracker.shutdown();

        assert!(matches!(handle.wait(), RequestOutcome::Failed(_)));
    }

    #[test]
    fn concurrent_resolution_is_exactly_once() {
        let tracker = Arc::new(RequestTracker::new());
        let request_id = RequestId::random();

        let handle = tracker
            .register(request_id, Duration::from_secs(5))
            .unwrap();

        let resolvers: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                thread::spawn(move || tracker.resolve(&request_id, pong_for(request_id)))
            })
            .collect();

        let wins = resolvers
            .into_iter()
            .filter_map(|resolver| resolver.join().ok())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert!(matches!(handle.wait(), RequestOutcome::Response(_)));
    }
}
