// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deduplicated contract operations.
//!
//! Every verb runs through one of two single-flight tables. Reads
//! *join*: concurrent callers for the same view share one gateway
//! call. Writes *reject*: a second submission with the same operation
//! key fails with `DuplicateOperation` until the first settles, so a
//! double-clicked button cannot put two transactions on the ledger.
//!
//! Operation keys are content-derived (`addTodo_<content>`,
//! `completeTodo_<index>`). Two users adding an identical todo at the
//! same moment collide on the same key; the second is rejected like a
//! duplicate. Known limitation, inherited from the key scheme.

use crate::error::MirrorResult;
use crate::gateway::LedgerGateway;
use crate::metrics::MirrorMetrics;
use crate::singleflight::{FlightPolicy, SingleFlight};
use crate::types::TxReceipt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const TODO_LIST: &str = "TodoList";
const COUNTER: &str = "Counter";
const GREETING: &str = "Greeting";

pub struct ContractOps {
    gateway: Arc<dyn LedgerGateway>,
    reads: SingleFlight<Value>,
    writes: SingleFlight<TxReceipt>,
}

impl ContractOps {
    pub fn new(gateway: Arc<dyn LedgerGateway>) -> Self {
        Self {
            gateway,
            reads: SingleFlight::new("reads"),
            writes: SingleFlight::new("writes"),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.reads = self.reads.with_metrics(metrics.clone());
        self.writes = self.writes.with_metrics(metrics);
        self
    }

    // Reads: concurrent duplicates share one call.

    pub async fn todo_list(&self) -> MirrorResult<Value> {
        self.read(TODO_LIST, "getTodoList").await
    }

    pub async fn counter(&self) -> MirrorResult<Value> {
        self.read(COUNTER, "getCount").await
    }

    pub async fn greeting(&self) -> MirrorResult<Value> {
        self.read(GREETING, "getGreeting").await
    }

    // Writes: concurrent duplicates are rejected until settlement.

    pub async fn add_todo(&self, content: &str) -> MirrorResult<TxReceipt> {
        let key = format!("addTodo_{}", content);
        self.write(&key, TODO_LIST, "addTodo", vec![json!(content)])
            .await
    }

    pub async fn complete_todo(&self, index: u64) -> MirrorResult<TxReceipt> {
        let key = format!("completeTodo_{}", index);
        self.write(&key, TODO_LIST, "completeTodo", vec![json!(index)])
            .await
    }

    pub async fn increment_counter(&self) -> MirrorResult<TxReceipt> {
        self.write("incrementCounter", COUNTER, "increment", vec![])
            .await
    }

    pub async fn decrement_counter(&self) -> MirrorResult<TxReceipt> {
        self.write("decrementCounter", COUNTER, "decrement", vec![])
            .await
    }

    pub async fn reset_counter(&self) -> MirrorResult<TxReceipt> {
        self.write("resetCounter", COUNTER, "reset", vec![]).await
    }

    pub async fn set_greeting(&self, text: &str) -> MirrorResult<TxReceipt> {
        let key = format!("setGreeting_{}", text);
        self.write(&key, GREETING, "setGreeting", vec![json!(text)])
            .await
    }

    /// Operation keys currently in flight, both tables, sorted.
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys = self.reads.pending_keys();
        keys.extend(self.writes.pending_keys());
        keys.sort();
        keys
    }

    /// Forget all in-flight bookkeeping. Does not cancel anything;
    /// error-recovery escape hatch only.
    pub fn clear_all_pending(&self) -> usize {
        self.reads.clear_all() + self.writes.clear_all()
    }

    async fn read(&self, contract: &'static str, method: &'static str) -> MirrorResult<Value> {
        self.reads
            .acquire_or_join(method, FlightPolicy::Join, || async {
                self.gateway.call(contract, method, &[]).await
            })
            .await
    }

    async fn write(
        &self,
        key: &str,
        contract: &'static str,
        method: &'static str,
        args: Vec<Value>,
    ) -> MirrorResult<TxReceipt> {
        self.writes
            .acquire_or_join(key, FlightPolicy::Reject, || async {
                let submission = self.gateway.send(contract, method, &args).await?;
                info!(
                    "Submitted {}.{} as {}, awaiting confirmation",
                    contract,
                    method,
                    submission.tx_id()
                );
                submission.confirmed().await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorError;
    use crate::test_utils::MockGateway;
    use std::time::Duration;

    fn ops_with_mock() -> (ContractOps, Arc<MockGateway>) {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_call_response(TODO_LIST, "getTodoList", Ok(json!(["buy milk"])));
        gateway.set_call_response(COUNTER, "getCount", Ok(json!(3)));
        gateway.set_call_response(GREETING, "getGreeting", Ok(json!("hello")));
        let gateway_dyn: Arc<dyn LedgerGateway> = gateway.clone();
        (ContractOps::new(gateway_dyn), gateway)
    }

    #[tokio::test]
    async fn test_reads_pass_through() {
        let (ops, _gateway) = ops_with_mock();
        assert_eq!(ops.todo_list().await.unwrap(), json!(["buy milk"]));
        assert_eq!(ops.counter().await.unwrap(), json!(3));
        assert_eq!(ops.greeting().await.unwrap(), json!("hello"));
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_gateway_call() {
        let (ops, gateway) = ops_with_mock();
        gateway.set_call_delay(Duration::from_millis(50));
        let ops = Arc::new(ops);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ops = ops.clone();
            handles.push(tokio::spawn(async move { ops.todo_list().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(["buy milk"]));
        }
        assert_eq!(gateway.call_count(TODO_LIST, "getTodoList"), 1);
    }

    #[tokio::test]
    async fn test_double_add_todo_one_success_one_rejection_one_send() {
        let (ops, gateway) = ops_with_mock();
        gateway.set_confirmation_delay(Duration::from_millis(50));
        let ops = Arc::new(ops);

        let first = {
            let ops = ops.clone();
            tokio::spawn(async move { ops.add_todo("buy milk").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = ops.add_todo("buy milk").await;
        assert_eq!(
            second.unwrap_err(),
            MirrorError::DuplicateOperation("addTodo_buy milk".to_string())
        );

        let receipt = first.await.unwrap().unwrap();
        assert_eq!(receipt.confirmations, 1);
        // Exactly one transaction reached the ledger
        assert_eq!(gateway.sends().len(), 1);
        assert_eq!(gateway.sends()[0].1, "addTodo");
    }

    #[tokio::test]
    async fn test_same_key_accepted_after_settlement() {
        let (ops, gateway) = ops_with_mock();
        ops.add_todo("buy milk").await.unwrap();
        ops.add_todo("buy milk").await.unwrap();
        assert_eq!(gateway.sends().len(), 2);
    }

    #[tokio::test]
    async fn test_distinct_write_keys_do_not_collide() {
        let (ops, gateway) = ops_with_mock();
        gateway.set_confirmation_delay(Duration::from_millis(50));
        let ops = Arc::new(ops);

        let first = {
            let ops = ops.clone();
            tokio::spawn(async move { ops.add_todo("buy milk").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Different content, different key: accepted
        let second = ops.add_todo("walk dog").await;
        assert!(second.is_ok());
        assert!(first.await.unwrap().is_ok());
        assert_eq!(gateway.sends().len(), 2);
    }

    #[tokio::test]
    async fn test_counter_actions_use_fixed_keys() {
        let (ops, gateway) = ops_with_mock();
        gateway.set_confirmation_delay(Duration::from_millis(50));
        let ops = Arc::new(ops);

        let first = {
            let ops = ops.clone();
            tokio::spawn(async move { ops.increment_counter().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ops.pending_keys(), vec!["incrementCounter".to_string()]);

        let duplicate = ops.increment_counter().await;
        assert!(matches!(
            duplicate,
            Err(MirrorError::DuplicateOperation(_))
        ));
        // A different counter action is its own key
        assert!(ops.decrement_counter().await.is_ok());

        first.await.unwrap().unwrap();
        assert!(ops.pending_keys().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_propagates_and_releases_key() {
        let (ops, gateway) = ops_with_mock();
        gateway.push_send_result(Err(MirrorError::Generic("reverted".to_string())));

        let first = ops.set_greeting("hi").await;
        assert!(first.is_err());
        assert!(ops.pending_keys().is_empty());

        // Key is free again for a retry
        assert!(ops.set_greeting("hi").await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_all_pending_counts_entries() {
        let (ops, gateway) = ops_with_mock();
        gateway.set_confirmation_delay(Duration::from_millis(200));
        let ops = Arc::new(ops);

        let _running = {
            let ops = ops.clone();
            tokio::spawn(async move { ops.add_todo("x").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(ops.clear_all_pending(), 1);
        assert!(ops.pending_keys().is_empty());
    }
}
