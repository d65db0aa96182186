// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ledger gateway abstraction.
//!
//! The gateway is the only component that talks to the external
//! network. It carries no retry policy of its own; failures propagate
//! to the caller, which decides what to do with them.

use crate::error::{GatewayErrorKind, MirrorError, MirrorResult};
use crate::types::{ConnectivityStatus, TxReceipt};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

mod rpc;

pub use rpc::RpcLedgerGateway;

/// An event pushed by the gateway. Delivery is at-least-once: the same
/// underlying occurrence may be delivered more than once across
/// reconnects, and consumers must tolerate duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    pub contract: String,
    pub event_name: String,
    pub payload: BTreeMap<String, Value>,
    pub block_number: Option<u64>,
}

/// Handle for a submitted ledger mutation.
///
/// `confirmed` resolves only once the gateway has observed the
/// configured number of confirmations.
#[derive(Debug)]
pub struct TxSubmission {
    tx_id: String,
    confirmation: oneshot::Receiver<MirrorResult<TxReceipt>>,
}

impl TxSubmission {
    /// Create a submission whose confirmation is resolved later by the
    /// returned sender.
    pub fn pending(tx_id: impl Into<String>) -> (Self, oneshot::Sender<MirrorResult<TxReceipt>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx_id: tx_id.into(),
                confirmation: rx,
            },
            tx,
        )
    }

    /// Create an already-settled submission (tests and mock gateways).
    pub fn resolved(tx_id: impl Into<String>, result: MirrorResult<TxReceipt>) -> Self {
        let (submission, sender) = Self::pending(tx_id);
        let _ = sender.send(result);
        submission
    }

    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    /// Wait for the transaction to reach the configured confirmation depth.
    pub async fn confirmed(self) -> MirrorResult<TxReceipt> {
        match self.confirmation.await {
            Ok(result) => result,
            // The confirmation poller went away without settling
            Err(_) => Err(MirrorError::gateway(
                GatewayErrorKind::ConnectionFailed,
                format!("confirmation for tx {} was abandoned", self.tx_id),
            )),
        }
    }
}

/// A cancellable event subscription.
///
/// Wraps the push channel from the gateway; dropping the handle (or
/// calling `cancel`) tears the underlying feed down.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: mpsc::Receiver<GatewayEvent>,
    cancel: CancellationToken,
}

impl EventSubscription {
    pub fn new(receiver: mpsc::Receiver<GatewayEvent>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// Receive the next event; `None` once the feed has shut down.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.receiver.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Interface to the remote ledger for a set of named contracts.
#[async_trait]
pub trait LedgerGateway: Send + Sync + 'static {
    /// Read-only view call; no side effect on the ledger.
    async fn call(&self, contract: &str, method: &str, args: &[Value]) -> MirrorResult<Value>;

    /// Submit a mutating call. The returned handle settles once the
    /// transaction is confirmed.
    async fn send(
        &self,
        contract: &str,
        method: &str,
        args: &[Value],
    ) -> MirrorResult<TxSubmission>;

    /// Subscribe to events of the given contracts.
    async fn subscribe(&self, contracts: &[String]) -> MirrorResult<EventSubscription>;

    /// Drop any active subscription covering the given contract.
    async fn unsubscribe(&self, contract: &str);

    async fn check_connectivity(&self) -> ConnectivityStatus;
}
