//! Matching daemon responses to the requests that caused them.
//!
//! Many logical requests share one duplex stream. Each request registers a
//! single-assignment slot under its message id before the message is
//! written; the listener task resolves the slot when the response with that
//! id arrives. A response for an id with no slot (already timed out or
//! cancelled) is dropped. An issued id cancelled before its request is
//! sent is remembered, and the request is then never written.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ServiceError;

/// Most ids remembered as cancelled before they were sent; the oldest is
/// forgotten first.
const MAX_PRECANCELLED: usize = 256;

/// What a waiting request receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    /// The daemon answered.
    Resolved(T),
    /// The request was cancelled or the session went away.
    Dropped,
}

struct PendingRequest<T> {
    slot: oneshot::Sender<Delivery<T>>,
    enqueued_at: Instant,
}

/// Tracks in-flight requests by message id.
pub struct RequestCorrelator<T> {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingRequest<T>>>,
    // Locked only while `pending` is held.
    precancelled: Mutex<VecDeque<u32>>,
}

impl<T> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestCorrelator<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            precancelled: Mutex::new(VecDeque::new()),
        }
    }

    /// Monotonically increasing message id, never reused.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a slot for `id`. A previous slot under the same id is
    /// completed with `Dropped`.
    pub fn register(&self, id: u32) -> oneshot::Receiver<Delivery<T>> {
        let mut pending = self.pending.lock();
        Self::insert(&mut pending, id)
    }

    /// Like [`register`](Self::register), but `None` when `id` was cancelled
    /// before this call. Consumes the cancellation.
    fn register_unless_cancelled(&self, id: u32) -> Option<oneshot::Receiver<Delivery<T>>> {
        let mut pending = self.pending.lock();
        {
            let mut precancelled = self.precancelled.lock();
            if let Some(index) = precancelled.iter().position(|&c| c == id) {
                precancelled.remove(index);
                return None;
            }
        }
        Some(Self::insert(&mut pending, id))
    }

    fn insert(
        pending: &mut HashMap<u32, PendingRequest<T>>,
        id: u32,
    ) -> oneshot::Receiver<Delivery<T>> {
        let (slot, receiver) = oneshot::channel();
        let previous = pending.insert(
            id,
            PendingRequest {
                slot,
                enqueued_at: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            warn!("Request id {} registered twice, dropping the earlier waiter", id);
            let _ = previous.slot.send(Delivery::Dropped);
        }
        receiver
    }

    /// Wait for the slot registered under `id`. Returns `None` on timeout,
    /// after removing the slot.
    pub async fn wait(
        &self,
        id: u32,
        receiver: oneshot::Receiver<Delivery<T>>,
        timeout: Duration,
    ) -> Option<Delivery<T>> {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(delivery)) => Some(delivery),
            // Sender dropped without an answer
            Ok(Err(_)) => Some(Delivery::Dropped),
            Err(_) => {
                self.pending.lock().remove(&id);
                debug!("Request {} timed out after {}ms", id, timeout.as_millis());
                None
            }
        }
    }

    /// Register `id`, run `write`, then wait up to `timeout` for the answer.
    ///
    /// When `id` was cancelled before this call, `write` is never run and
    /// the result is `Dropped`.
    ///
    /// # Errors
    ///
    /// Returns the error from `write`; the slot is removed in that case.
    pub async fn send<F>(
        &self,
        id: u32,
        timeout: Duration,
        write: F,
    ) -> Result<Option<Delivery<T>>, ServiceError>
    where
        F: Future<Output = Result<(), ServiceError>>,
    {
        let Some(receiver) = self.register_unless_cancelled(id) else {
            debug!("Request {} was cancelled before it was sent", id);
            return Ok(Some(Delivery::Dropped));
        };
        if let Err(e) = write.await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok(self.wait(id, receiver, timeout).await)
    }

    /// Complete the slot for `id`. Returns `false` (and drops `value`) when
    /// no request is waiting on that id.
    pub fn resolve(&self, id: u32, value: T) -> bool {
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(pending) => {
                let _ = pending.slot.send(Delivery::Resolved(value));
                true
            }
            None => {
                debug!("Dropping response for unknown or expired request {}", id);
                false
            }
        }
    }

    /// Release the waiter on `id` with `Dropped`. Returns `false` when
    /// nothing is waiting; an issued id is then remembered so a later
    /// [`send`](Self::send) under it is dropped unsent.
    pub fn cancel(&self, id: u32) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let entry = pending.remove(&id);
            if entry.is_none() && id < self.next_id.load(Ordering::Relaxed) {
                let mut precancelled = self.precancelled.lock();
                if !precancelled.contains(&id) {
                    if precancelled.len() == MAX_PRECANCELLED {
                        precancelled.pop_front();
                    }
                    precancelled.push_back(id);
                }
            }
            entry
        };
        match entry {
            Some(pending) => {
                let _ = pending.slot.send(Delivery::Dropped);
                true
            }
            None => false,
        }
    }

    /// Drain every slot, completing each with `Dropped`. Ids cancelled
    /// before they were sent stay cancelled.
    pub fn cancel_all(&self) -> Vec<u32> {
        let drained: Vec<(u32, PendingRequest<T>)> = self.pending.lock().drain().collect();
        drained
            .into_iter()
            .map(|(id, pending)| {
                let _ = pending.slot.send(Delivery::Dropped);
                id
            })
            .collect()
    }

    /// Whether any request has been waiting longer than `threshold`.
    pub fn has_stale(&self, threshold: Duration) -> bool {
        let now = Instant::now();
        self.pending
            .lock()
            .values()
            .any(|pending| now.duration_since(pending.enqueued_at) > threshold)
    }

    /// Drop every request older than `threshold` and return their ids.
    pub fn purge_stale(&self, threshold: Duration) -> Vec<u32> {
        let now = Instant::now();
        let stale: Vec<(u32, PendingRequest<T>)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.enqueued_at) > threshold)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        stale
            .into_iter()
            .map(|(id, pending)| {
                let _ = pending.slot.send(Delivery::Dropped);
                id
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_ids_are_monotonic_and_per_instance() {
        let a: RequestCorrelator<()> = RequestCorrelator::new();
        let b: RequestCorrelator<()> = RequestCorrelator::new();

        assert_eq!(a.next_id(), 1);
        assert_eq!(a.next_id(), 2);
        assert_eq!(b.next_id(), 1);
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        let correlator: Arc<RequestCorrelator<()>> = Arc::new(RequestCorrelator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&correlator);
                std::thread::spawn(move || (0..500).map(|_| c.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {} issued twice", id);
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_waiter() {
        let correlator = Arc::new(RequestCorrelator::new());
        let id = correlator.next_id();
        let receiver = correlator.register(id);

        let resolver = Arc::clone(&correlator);
        tokio::spawn(async move {
            assert!(resolver.resolve(id, "done".to_string()));
        });

        let delivery = correlator.wait(id, receiver, WAIT).await;
        assert_eq!(delivery, Some(Delivery::Resolved("done".to_string())));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown_id_is_noop() {
        let correlator: RequestCorrelator<String> = RequestCorrelator::new();
        let _receiver = correlator.register(1);

        assert!(!correlator.resolve(99, "late".to_string()));
        assert!(correlator.is_pending(1));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_removes_slot_and_late_response_is_dropped() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        let receiver = correlator.register(5);

        let delivery = correlator.wait(5, receiver, Duration::from_millis(20)).await;
        assert_eq!(delivery, None);
        assert!(!correlator.is_pending(5));
        assert!(!correlator.resolve(5, 1));
    }

    #[tokio::test]
    async fn test_cancel_completes_with_dropped() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        let receiver = correlator.register(3);

        assert!(correlator.cancel(3));
        assert!(!correlator.cancel(3));
        assert_eq!(
            correlator.wait(3, receiver, WAIT).await,
            Some(Delivery::Dropped)
        );
    }

    #[tokio::test]
    async fn test_cancel_all_drops_every_pending_request_once() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        let receivers: Vec<_> = (1..=4).map(|id| (id, correlator.register(id))).collect();

        let mut drained = correlator.cancel_all();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert_eq!(correlator.pending_count(), 0);

        for (id, receiver) in receivers {
            assert_eq!(
                correlator.wait(id, receiver, WAIT).await,
                Some(Delivery::Dropped)
            );
        }
        assert!(correlator.cancel_all().is_empty());
    }

    #[tokio::test]
    async fn test_send_removes_slot_when_write_fails() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        let result = correlator
            .send(8, WAIT, async {
                Err(ServiceError::ProcessUnavailable("gone".to_string()))
            })
            .await;

        assert!(matches!(result, Err(ServiceError::ProcessUnavailable(_))));
        assert!(!correlator.is_pending(8));
    }

    #[tokio::test]
    async fn test_cancel_before_send_skips_the_write() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        let id = correlator.next_id();

        assert!(!correlator.cancel(id));
        let result = correlator
            .send(id, WAIT, async {
                Err(ServiceError::ProtocolViolation("cancelled request was written".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(result, Some(Delivery::Dropped));
        assert!(!correlator.is_pending(id));

        // The cancellation is consumed by the first send.
        let next = correlator.send(id, Duration::from_millis(20), async { Ok(()) });
        assert_eq!(next.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_of_unissued_id_is_not_remembered() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        assert!(!correlator.cancel(40));

        let written = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&written);
        let result = correlator
            .send(40, Duration::from_millis(20), async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(written.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_precancelled_ids_are_bounded() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        let ids: Vec<u32> = (0..=MAX_PRECANCELLED).map(|_| correlator.next_id()).collect();
        for &id in &ids {
            correlator.cancel(id);
        }

        // The oldest was forgotten, the newest is still dropped unsent.
        let oldest = correlator.send(ids[0], Duration::from_millis(20), async { Ok(()) });
        assert_eq!(oldest.await.unwrap(), None);
        let newest = correlator.send(ids[MAX_PRECANCELLED], WAIT, async {
            Err(ServiceError::ProtocolViolation("cancelled request was written".to_string()))
        });
        assert_eq!(newest.await.unwrap(), Some(Delivery::Dropped));

        // Draining the in-flight requests keeps the remembered ids.
        correlator.cancel_all();
        let kept = correlator.send(ids[1], WAIT, async {
            Err(ServiceError::ProtocolViolation("cancelled request was written".to_string()))
        });
        assert_eq!(kept.await.unwrap(), Some(Delivery::Dropped));
    }

    #[tokio::test]
    async fn test_duplicate_registration_drops_earlier_waiter() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        let first = correlator.register(1);
        let _second = correlator.register(1);

        assert_eq!(correlator.wait(1, first, WAIT).await, Some(Delivery::Dropped));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_detection_and_purge() {
        let correlator: RequestCorrelator<u32> = RequestCorrelator::new();
        let old = correlator.register(1);
        let _resolved = correlator.register(2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _fresh = correlator.register(3);

        let threshold = Duration::from_millis(15);
        assert!(correlator.has_stale(threshold));
        assert!(!correlator.has_stale(Duration::from_secs(60)));

        // Resolving before purge takes a request out of the stale set
        assert!(correlator.resolve(2, 0));

        assert_eq!(correlator.purge_stale(threshold), vec![1]);
        assert!(!correlator.has_stale(threshold));
        assert!(correlator.is_pending(3));
        assert_eq!(correlator.wait(1, old, WAIT).await, Some(Delivery::Dropped));
    }
}
