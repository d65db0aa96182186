// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! A mock ledger gateway for tests.

use crate::error::{GatewayErrorKind, MirrorError, MirrorResult};
use crate::gateway::{EventSubscription, GatewayEvent, LedgerGateway, TxSubmission};
use crate::types::{ConnectivityStatus, TxReceipt};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type MethodKey = (String, String);

/// Scripted gateway used in syncer and ops tests.
///
/// Sticky responses answer every call; queued responses (for
/// fail-then-recover sequences) take precedence and are consumed.
#[derive(Clone, Default)]
pub struct MockGateway {
    sticky_calls: Arc<Mutex<HashMap<MethodKey, MirrorResult<Value>>>>,
    queued_calls: Arc<Mutex<HashMap<MethodKey, VecDeque<MirrorResult<Value>>>>>,
    call_counts: Arc<Mutex<HashMap<MethodKey, usize>>>,
    call_delay: Arc<Mutex<Option<Duration>>>,
    send_results: Arc<Mutex<VecDeque<MirrorResult<TxReceipt>>>>,
    sends: Arc<Mutex<Vec<(String, String, Vec<Value>)>>>,
    confirmation_delay: Arc<Mutex<Option<Duration>>>,
    event_tx: Arc<Mutex<Option<mpsc::Sender<GatewayEvent>>>>,
    unsubscribed: Arc<Mutex<Vec<String>>>,
    connected: Arc<Mutex<bool>>,
}

impl MockGateway {
    pub fn new() -> Self {
        let gateway = Self::default();
        *gateway.connected.lock().unwrap() = true;
        gateway
    }

    pub fn set_call_response(
        &self,
        contract: &str,
        method: &str,
        response: MirrorResult<Value>,
    ) {
        self.sticky_calls
            .lock()
            .unwrap()
            .insert((contract.to_string(), method.to_string()), response);
    }

    pub fn push_call_response(
        &self,
        contract: &str,
        method: &str,
        response: MirrorResult<Value>,
    ) {
        self.queued_calls
            .lock()
            .unwrap()
            .entry((contract.to_string(), method.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Delay applied to every `call`, for overlap tests.
    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = Some(delay);
    }

    pub fn push_send_result(&self, result: MirrorResult<TxReceipt>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    /// Delay between submission and confirmation settling.
    pub fn set_confirmation_delay(&self, delay: Duration) {
        *self.confirmation_delay.lock().unwrap() = Some(delay);
    }

    pub fn call_count(&self, contract: &str, method: &str) -> usize {
        self.call_counts
            .lock()
            .unwrap()
            .get(&(contract.to_string(), method.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_call_count(&self) -> usize {
        self.call_counts.lock().unwrap().values().sum()
    }

    pub fn sends(&self) -> Vec<(String, String, Vec<Value>)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn unsubscribed_contracts(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    /// Push an event into the active subscription.
    pub async fn inject_event(&self, event: GatewayEvent) {
        let sender = self
            .event_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no active subscription");
        sender.send(event).await.expect("subscription closed");
    }

    fn next_call_response(&self, contract: &str, method: &str) -> MirrorResult<Value> {
        let key = (contract.to_string(), method.to_string());
        if let Some(queue) = self.queued_calls.lock().unwrap().get_mut(&key) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        if let Some(response) = self.sticky_calls.lock().unwrap().get(&key) {
            return response.clone();
        }
        Err(MirrorError::gateway(
            GatewayErrorKind::MethodNotFound,
            format!("unscripted method {}.{}", contract, method),
        ))
    }
}

#[async_trait]
impl LedgerGateway for MockGateway {
    async fn call(&self, contract: &str, method: &str, _args: &[Value]) -> MirrorResult<Value> {
        *self
            .call_counts
            .lock()
            .unwrap()
            .entry((contract.to_string(), method.to_string()))
            .or_insert(0) += 1;
        let delay = *self.call_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.next_call_response(contract, method)
    }

    async fn send(
        &self,
        contract: &str,
        method: &str,
        args: &[Value],
    ) -> MirrorResult<TxSubmission> {
        self.sends
            .lock()
            .unwrap()
            .push((contract.to_string(), method.to_string(), args.to_vec()));
        let result = self
            .send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(TxReceipt {
                    tx_id: format!("0xmock{}", self.sends.lock().unwrap().len()),
                    block_number: 1,
                    confirmations: 1,
                })
            });
        let tx_id = match &result {
            Ok(receipt) => receipt.tx_id.clone(),
            Err(_) => "0xfailed".to_string(),
        };

        let delay = *self.confirmation_delay.lock().unwrap();
        match delay {
            Some(delay) => {
                let (submission, sender) = TxSubmission::pending(tx_id);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(result);
                });
                Ok(submission)
            }
            None => Ok(TxSubmission::resolved(tx_id, result)),
        }
    }

    async fn subscribe(&self, _contracts: &[String]) -> MirrorResult<EventSubscription> {
        let (tx, rx) = mpsc::channel(64);
        *self.event_tx.lock().unwrap() = Some(tx);
        Ok(EventSubscription::new(rx, CancellationToken::new()))
    }

    async fn unsubscribe(&self, contract: &str) {
        self.unsubscribed.lock().unwrap().push(contract.to_string());
    }

    async fn check_connectivity(&self) -> ConnectivityStatus {
        ConnectivityStatus {
            connected: *self.connected.lock().unwrap(),
            head_block: Some(1),
        }
    }
}
