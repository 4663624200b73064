use digitbot_core::RequestError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

type PendingSender = oneshot::Sender<Result<Value, RequestError>>;

/// Tracks pending correlated requests and routes each response (or failure)
/// to exactly one waiting caller.
///
/// Ids are monotonically increasing and never reused for the lifetime of the
/// process. Resolution order is whatever order responses arrive in, not
/// submission order.
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSender>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingSender>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate the next id and register a waiter for its response.
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<Value, RequestError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        (id, rx)
    }

    /// Whether a caller is still waiting on this id.
    pub fn is_pending(&self, id: u64) -> bool {
        self.pending().contains_key(&id)
    }

    /// Resolve the pending request for `id`. Returns false when nothing was
    /// waiting (already timed out or never registered).
    pub fn resolve(&self, id: u64, result: Result<Value, RequestError>) -> bool {
        match self.pending().remove(&id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop the entry for a request whose caller gave up waiting.
    pub fn abort(&self, id: u64) {
        self.pending().remove(&id);
    }

    /// Reject every pending request. Used on disconnect so no caller is left
    /// waiting past a detected failure.
    pub fn fail_all<F>(&self, make_error: F)
    where
        F: Fn() -> RequestError,
    {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(make_error()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_each_caller_gets_its_own_resolution_out_of_order() {
        let correlator = RequestCorrelator::new();
        let (id_a, rx_a) = correlator.register();
        let (id_b, rx_b) = correlator.register();
        assert_ne!(id_a, id_b);

        // Resolve in reverse submission order.
        assert!(correlator.resolve(id_b, Ok(json!({"value": "b"}))));
        assert!(correlator.resolve(id_a, Ok(json!({"value": "a"}))));

        assert_eq!(rx_a.await.unwrap().unwrap()["value"], "a");
        assert_eq!(rx_b.await.unwrap().unwrap()["value"], "b");
    }

    #[tokio::test]
    async fn test_resolution_is_exactly_once() {
        let correlator = RequestCorrelator::new();
        let (id, rx) = correlator.register();
        assert!(correlator.resolve(id, Ok(json!(1))));
        assert!(!correlator.resolve(id, Ok(json!(2))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_every_pending_caller() {
        let correlator = RequestCorrelator::new();
        let receivers: Vec<_> = (0..5).map(|_| correlator.register().1).collect();
        correlator.fail_all(|| RequestError::ConnectionLost);
        for rx in receivers {
            assert!(matches!(
                rx.await.unwrap(),
                Err(RequestError::ConnectionLost)
            ));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_removes_the_entry() {
        let correlator = RequestCorrelator::new();
        let (id, _rx) = correlator.register();
        correlator.abort(id);
        assert!(!correlator.is_pending(id));
        assert!(!correlator.resolve(id, Ok(json!(null))));
    }
}
