// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC-over-HTTP ledger gateway.
//!
//! Thin client for the ledger's JSON-RPC endpoint. Event "push" is
//! implemented as a cursor long-poll task feeding an mpsc channel, so
//! consumers see the same subscription handle they would get from a
//! real push transport. Reconnect behavior makes delivery
//! at-least-once: a failed poll leaves the cursor in place, so the
//! next successful poll may replay events.

use crate::config::GatewayConfig;
use crate::error::{GatewayErrorKind, MirrorError, MirrorResult};
use crate::gateway::{EventSubscription, GatewayEvent, LedgerGateway, TxSubmission};
use crate::metrics::MirrorMetrics;
use crate::types::{ConnectivityStatus, TxReceipt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    method: String,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Clone)]
pub struct RpcLedgerGateway {
    http_client: reqwest::Client,
    rpc_url: String,
    request_id: Arc<AtomicU64>,
    confirmations: u64,
    poll_interval: Duration,
    metrics: Option<Arc<MirrorMetrics>>,
    // contract name -> cancellation of the poll task covering it
    subscriptions: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl RpcLedgerGateway {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        // Pooling tuned for many concurrent pollers, like the chain
        // syncer RPC client.
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(64)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(2))
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http_client,
            rpc_url: config.rpc_url.clone(),
            request_id: Arc::new(AtomicU64::new(1)),
            confirmations: config.confirmations,
            poll_interval: config.event_poll_interval(),
            metrics: None,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Probe the endpoint once and log what we are mirroring from.
    pub async fn connect(&self) -> MirrorResult<u64> {
        let head = self.head_block().await?;
        info!("Connected to ledger gateway at {} (head block {})", self.rpc_url, head);
        Ok(head)
    }

    async fn head_block(&self) -> MirrorResult<u64> {
        let result = self.rpc("ledger.head", vec![]).await?;
        result
            .get("number")
            .and_then(parse_u64)
            .ok_or_else(|| MirrorError::Generic("Failed to parse head block number".to_string()))
    }

    async fn rpc(&self, method: &str, params: Vec<Value>) -> MirrorResult<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(ref m) = self.metrics {
            m.gateway_rpc_queries.with_label_values(&[method]).inc();
        }
        let start = Instant::now();

        let result = self.rpc_inner(&request).await;

        if let Some(ref m) = self.metrics {
            m.gateway_rpc_latency
                .with_label_values(&[method])
                .observe(start.elapsed().as_secs_f64());
            if let Err(ref e) = result {
                m.gateway_rpc_errors
                    .with_label_values(&[method, e.error_type()])
                    .inc();
            }
        }
        result
    }

    async fn rpc_inner(&self, request: &JsonRpcRequest) -> MirrorResult<Value> {
        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(classify_transport_error)?;

        if let Some(error) = body.error {
            return Err(classify_rpc_error(&request.method, error));
        }
        body.result
            .ok_or_else(|| MirrorError::Generic(format!("Empty result for {}", request.method)))
    }

    /// Poll the receipt endpoint until the transaction reaches the
    /// required confirmation depth, then settle the oneshot. Errors
    /// propagate unretried; policy belongs to the caller.
    fn spawn_confirmation_poller(
        &self,
        tx_id: String,
        sender: tokio::sync::oneshot::Sender<MirrorResult<TxReceipt>>,
    ) {
        let gateway = self.clone();
        let required = self.confirmations;
        tokio::spawn(async move {
            let mut sender = sender;
            loop {
                if sender.is_closed() {
                    debug!("Confirmation wait for tx {} abandoned by caller", tx_id);
                    return;
                }
                match gateway
                    .rpc("ledger.getTransactionReceipt", vec![json!(tx_id)])
                    .await
                {
                    Ok(Value::Null) => {
                        // Not yet included
                        tokio::time::sleep(gateway.poll_interval).await;
                    }
                    Ok(receipt) => {
                        let confirmations =
                            receipt.get("confirmations").and_then(parse_u64).unwrap_or(0);
                        if confirmations >= required {
                            let block_number =
                                receipt.get("blockNumber").and_then(parse_u64).unwrap_or(0);
                            let _ = sender.send(Ok(TxReceipt {
                                tx_id: tx_id.clone(),
                                block_number,
                                confirmations,
                            }));
                            return;
                        }
                        tokio::time::sleep(gateway.poll_interval).await;
                    }
                    Err(e) => {
                        let _ = sender.send(Err(e));
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl LedgerGateway for RpcLedgerGateway {
    async fn call(&self, contract: &str, method: &str, args: &[Value]) -> MirrorResult<Value> {
        self.rpc(
            "ledger.call",
            vec![json!(contract), json!(method), json!(args)],
        )
        .await
    }

    async fn send(
        &self,
        contract: &str,
        method: &str,
        args: &[Value],
    ) -> MirrorResult<TxSubmission> {
        let result = self
            .rpc(
                "ledger.sendTransaction",
                vec![json!(contract), json!(method), json!(args)],
            )
            .await?;
        let tx_id = result
            .get("txId")
            .and_then(|v| v.as_str())
            .or_else(|| result.as_str())
            .ok_or_else(|| MirrorError::Generic("Missing txId in send response".to_string()))?
            .to_string();

        let (submission, sender) = TxSubmission::pending(tx_id.clone());
        self.spawn_confirmation_poller(tx_id, sender);
        Ok(submission)
    }

    async fn subscribe(&self, contracts: &[String]) -> MirrorResult<EventSubscription> {
        let cancel = CancellationToken::new();
        {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .expect("subscription registry poisoned");
            for contract in contracts {
                // A newer subscription supersedes any previous one
                if let Some(old) = subscriptions.insert(contract.clone(), cancel.clone()) {
                    old.cancel();
                }
            }
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let gateway = self.clone();
        let contracts = contracts.to_vec();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_event_poll_task(gateway, contracts, event_tx, task_cancel).await;
        });

        Ok(EventSubscription::new(event_rx, cancel))
    }

    async fn unsubscribe(&self, contract: &str) {
        let token = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .expect("subscription registry poisoned");
            subscriptions.remove(contract)
        };
        if let Some(token) = token {
            token.cancel();
            debug!("Unsubscribed from {} events", contract);
        }
    }

    async fn check_connectivity(&self) -> ConnectivityStatus {
        match self.head_block().await {
            Ok(head) => ConnectivityStatus {
                connected: true,
                head_block: Some(head),
            },
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                ConnectivityStatus {
                    connected: false,
                    head_block: None,
                }
            }
        }
    }
}

/// Cursor long-poll loop feeding the subscription channel.
async fn run_event_poll_task(
    gateway: RpcLedgerGateway,
    contracts: Vec<String>,
    event_tx: mpsc::Sender<GatewayEvent>,
    cancel: CancellationToken,
) {
    info!("Starting event poll task for {:?}", contracts);
    let mut cursor: Option<u64> = None;
    let mut interval = tokio::time::interval(gateway.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Event poll task for {:?} cancelled", contracts);
                return;
            }
            _ = interval.tick() => {
                match gateway
                    .rpc("ledger.getEvents", vec![json!(contracts), json!(cursor)])
                    .await
                {
                    Ok(page) => {
                        for raw in page
                            .get("events")
                            .and_then(|e| e.as_array())
                            .into_iter()
                            .flatten()
                        {
                            if let Some(event) = decode_event(raw) {
                                if event_tx.send(event).await.is_err() {
                                    // Subscriber is gone
                                    return;
                                }
                            } else {
                                warn!("Dropping undecodable gateway event: {}", raw);
                            }
                        }
                        if let Some(next) = page.get("cursor").and_then(parse_u64) {
                            cursor = Some(next);
                        }
                    }
                    Err(e) => {
                        // Cursor stays put: the next successful poll may
                        // replay events (at-least-once delivery).
                        warn!("Event poll failed for {:?}: {}", contracts, e);
                    }
                }
            }
        }
    }
}

fn decode_event(raw: &Value) -> Option<GatewayEvent> {
    let contract = raw.get("contract")?.as_str()?.to_string();
    let event_name = raw.get("eventName")?.as_str()?.to_string();
    let payload = raw
        .get("payload")
        .and_then(|p| p.as_object())
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<String, Value>>()
        })
        .unwrap_or_default();
    Some(GatewayEvent {
        contract,
        event_name,
        payload,
        block_number: raw.get("blockNumber").and_then(parse_u64),
    })
}

fn parse_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn classify_transport_error(e: reqwest::Error) -> MirrorError {
    let kind = if e.is_timeout() {
        GatewayErrorKind::Timeout
    } else {
        GatewayErrorKind::ConnectionFailed
    };
    MirrorError::gateway(kind, e.to_string())
}

fn classify_rpc_error(method: &str, error: JsonRpcError) -> MirrorError {
    // -32601 is the JSON-RPC "method not found" code; contract-level
    // reverts surface as execution errors with a revert message.
    let kind = if error.code == -32601 || error.message.contains("unknown method") {
        GatewayErrorKind::MethodNotFound
    } else if error.message.to_lowercase().contains("revert") {
        GatewayErrorKind::RevertedCall
    } else {
        GatewayErrorKind::ConnectionFailed
    };
    MirrorError::gateway(kind, format!("{} failed ({}): {}", method, error.code, error.message))
}
