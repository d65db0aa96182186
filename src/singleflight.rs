// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-key single-flight table for deduplicating ledger operations.
//!
//! At most one operation is in flight per key. What happens to a
//! duplicate caller is the caller's policy choice: read-style callers
//! *join* the in-flight operation and share its outcome, write-style
//! callers are *rejected* immediately, because joining would let them
//! believe a second logical write happened when only one transaction
//! was submitted.
//!
//! Entries are removed on every exit path (success, failure, or
//! cancellation of the owning task) via a drop guard, so the table
//! never grows without bound.

use crate::error::{MirrorError, MirrorResult};
use crate::metrics::MirrorMetrics;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// What a caller gets when its key is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightPolicy {
    /// Await the in-flight operation and share its outcome.
    Join,
    /// Fail immediately with `DuplicateOperation`.
    Reject,
}

type OutcomeSlot<T> = watch::Receiver<Option<MirrorResult<T>>>;
type FlightMap<T> = Arc<Mutex<HashMap<String, OutcomeSlot<T>>>>;

pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    /// Table label used in logs and metrics (e.g. "reads", "writes")
    name: &'static str,
    inflight: FlightMap<T>,
    metrics: Option<Arc<MirrorMetrics>>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `factory`'s operation under `key`, or resolve against the
    /// one already in flight according to `policy`.
    pub async fn acquire_or_join<F, Fut>(
        &self,
        key: &str,
        policy: FlightPolicy,
        factory: F,
    ) -> MirrorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MirrorResult<T>>,
    {
        enum Role<T> {
            Owner(watch::Sender<Option<MirrorResult<T>>>),
            Joiner(OutcomeSlot<T>),
        }

        let role = {
            let mut map = self.inflight.lock().expect("singleflight table poisoned");
            if let Some(slot) = map.get(key) {
                match policy {
                    FlightPolicy::Reject => {
                        debug!("[{}] Rejecting duplicate operation for {}", self.name, key);
                        if let Some(ref m) = self.metrics {
                            m.dedup_rejected.with_label_values(&[self.name]).inc();
                        }
                        return Err(MirrorError::DuplicateOperation(key.to_string()));
                    }
                    FlightPolicy::Join => {
                        debug!("[{}] Joining in-flight operation for {}", self.name, key);
                        if let Some(ref m) = self.metrics {
                            m.dedup_joined.with_label_values(&[self.name]).inc();
                        }
                        Role::Joiner(slot.clone())
                    }
                }
            } else {
                let (tx, rx) = watch::channel(None);
                map.insert(key.to_string(), rx);
                if let Some(ref m) = self.metrics {
                    m.dedup_flights_started.with_label_values(&[self.name]).inc();
                }
                Role::Owner(tx)
            }
        };

        match role {
            Role::Joiner(mut slot) => match slot.wait_for(|outcome| outcome.is_some()).await {
                Ok(outcome) => outcome.clone().expect("settled flight has an outcome"),
                // Owner dropped without settling (panicked or cancelled)
                Err(_) => Err(MirrorError::Generic(format!(
                    "in-flight operation for {} was abandoned",
                    key
                ))),
            },
            Role::Owner(tx) => {
                // Removes the entry on success, failure, or cancellation
                let guard = RemoveOnDrop {
                    map: self.inflight.clone(),
                    key: key.to_string(),
                };
                let outcome = factory().await;
                let _ = tx.send(Some(outcome.clone()));
                drop(guard);
                outcome
            }
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inflight
            .lock()
            .expect("singleflight table poisoned")
            .contains_key(key)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inflight
            .lock()
            .expect("singleflight table poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Forget all bookkeeping. Error-recovery escape hatch only.
    ///
    /// This does NOT cancel the underlying in-flight operations; a new
    /// call with a forgotten key can submit a second ledger transaction
    /// while the first is still confirming.
    pub fn clear_all(&self) -> usize {
        let mut map = self.inflight.lock().expect("singleflight table poisoned");
        let cleared = map.len();
        map.clear();
        cleared
    }
}

struct RemoveOnDrop<T: Clone + Send + Sync + 'static> {
    map: FlightMap<T>,
    key: String,
}

impl<T: Clone + Send + Sync + 'static> Drop for RemoveOnDrop<T> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_shares_one_underlying_call() {
        let flight = Arc::new(SingleFlight::<Value>::new("reads"));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .acquire_or_join("getTodoList", FlightPolicy::Join, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!(["buy milk"]))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(["buy milk"]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flight.is_pending("getTodoList"));
    }

    #[tokio::test]
    async fn test_reject_then_accept_after_settlement() {
        let flight = Arc::new(SingleFlight::<Value>::new("writes"));

        let first = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .acquire_or_join("addTodo_buy milk", FlightPolicy::Reject, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("0xtx1"))
                    })
                    .await
            })
        };

        // Give the first call time to register
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(flight.is_pending("addTodo_buy milk"));

        let second = flight
            .acquire_or_join("addTodo_buy milk", FlightPolicy::Reject, || async {
                Ok(json!("0xtx2"))
            })
            .await;
        assert_eq!(
            second.unwrap_err(),
            MirrorError::DuplicateOperation("addTodo_buy milk".to_string())
        );

        assert_eq!(first.await.unwrap().unwrap(), json!("0xtx1"));

        // Settled: the same key is accepted again
        let third = flight
            .acquire_or_join("addTodo_buy milk", FlightPolicy::Reject, || async {
                Ok(json!("0xtx3"))
            })
            .await;
        assert_eq!(third.unwrap(), json!("0xtx3"));
    }

    #[tokio::test]
    async fn test_entry_removed_on_failure() {
        let flight = SingleFlight::<Value>::new("writes");
        let outcome = flight
            .acquire_or_join("completeTodo_3", FlightPolicy::Reject, || async {
                Err(MirrorError::Generic("reverted".to_string()))
            })
            .await;
        assert!(outcome.is_err());
        assert!(!flight.is_pending("completeTodo_3"));
    }

    #[tokio::test]
    async fn test_joiner_shares_failure() {
        let flight = Arc::new(SingleFlight::<Value>::new("reads"));
        let owner = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .acquire_or_join("getCount", FlightPolicy::Join, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(MirrorError::Generic("boom".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let joined = flight
            .acquire_or_join("getCount", FlightPolicy::Join, || async {
                panic!("joiner must not start a second operation")
            })
            .await;
        assert_eq!(joined.unwrap_err(), MirrorError::Generic("boom".to_string()));
        assert!(owner.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_owner_releases_key_and_fails_joiners() {
        let flight = Arc::new(SingleFlight::<Value>::new("writes"));
        let owner = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .acquire_or_join("addTodo_x", FlightPolicy::Join, || async {
                        futures::future::pending::<MirrorResult<Value>>().await
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(flight.is_pending("addTodo_x"));

        let joiner = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .acquire_or_join("addTodo_x", FlightPolicy::Join, || async {
                        panic!("must join, not start")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        owner.abort();
        let joined = joiner.await.unwrap();
        assert!(matches!(joined, Err(MirrorError::Generic(_))));
        assert!(!flight.is_pending("addTodo_x"));
    }

    #[tokio::test]
    async fn test_clear_all_forgets_bookkeeping_only() {
        let flight = Arc::new(SingleFlight::<Value>::new("writes"));
        let _running = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .acquire_or_join("addTodo_y", FlightPolicy::Reject, || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(json!("0xtx"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flight.pending_keys(), vec!["addTodo_y".to_string()]);

        assert_eq!(flight.clear_all(), 1);
        assert!(flight.pending_keys().is_empty());

        // The hazard: the key is immediately available again even though
        // the first operation is still running.
        let second = flight
            .acquire_or_join("addTodo_y", FlightPolicy::Reject, || async {
                Ok(json!("0xtx2"))
            })
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let flight = Arc::new(SingleFlight::<Value>::new("writes"));
        let a = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .acquire_or_join("addTodo_a", FlightPolicy::Reject, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("a"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A different key is not serialized behind "addTodo_a"
        let b = flight
            .acquire_or_join("addTodo_b", FlightPolicy::Reject, || async { Ok(json!("b")) })
            .await;
        assert_eq!(b.unwrap(), json!("b"));
        assert_eq!(a.await.unwrap().unwrap(), json!("a"));
    }
}
