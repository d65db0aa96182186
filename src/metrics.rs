// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

#[derive(Clone, Debug)]
pub struct MirrorMetrics {
    pub(crate) sync_cycles_total: IntCounter,
    pub(crate) sync_cycle_failures: IntCounter,
    pub(crate) sync_contract_fetch_failures: IntCounterVec,
    pub(crate) sync_cycle_latency: HistogramVec,
    pub(crate) last_sync_timestamp_ms: IntGauge,

    pub(crate) gateway_rpc_queries: IntCounterVec,
    pub(crate) gateway_rpc_errors: IntCounterVec,
    pub(crate) gateway_rpc_latency: HistogramVec,

    pub(crate) events_appended: IntCounter,
    pub(crate) events_deduped: IntCounter,
    pub(crate) events_purged: IntCounter,
    pub(crate) event_log_size: IntGauge,

    pub(crate) dedup_flights_started: IntCounterVec,
    pub(crate) dedup_joined: IntCounterVec,
    pub(crate) dedup_rejected: IntCounterVec,

    pub(crate) requests_received: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
}

impl MirrorMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            sync_cycles_total: register_int_counter_with_registry!(
                "mirror_sync_cycles_total",
                "Total number of completed sync cycles (successful saves)",
                registry,
            )
            .unwrap(),
            sync_cycle_failures: register_int_counter_with_registry!(
                "mirror_sync_cycle_failures",
                "Sync cycles that failed to persist a snapshot set",
                registry,
            )
            .unwrap(),
            sync_contract_fetch_failures: register_int_counter_vec_with_registry!(
                "mirror_sync_contract_fetch_failures",
                "Per-contract fetch failures during a cycle (partial success)",
                &["contract"],
                registry,
            )
            .unwrap(),
            sync_cycle_latency: register_histogram_vec_with_registry!(
                "mirror_sync_cycle_latency",
                "Latency of full sync cycles in seconds",
                &["trigger"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            last_sync_timestamp_ms: register_int_gauge_with_registry!(
                "mirror_last_sync_timestamp_ms",
                "Unix millis of the last successful sync cycle",
                registry,
            )
            .unwrap(),
            gateway_rpc_queries: register_int_counter_vec_with_registry!(
                "mirror_gateway_rpc_queries",
                "Gateway RPC requests by method",
                &["method"],
                registry,
            )
            .unwrap(),
            gateway_rpc_errors: register_int_counter_vec_with_registry!(
                "mirror_gateway_rpc_errors",
                "Gateway RPC failures by method and error type",
                &["method", "error"],
                registry,
            )
            .unwrap(),
            gateway_rpc_latency: register_histogram_vec_with_registry!(
                "mirror_gateway_rpc_latency",
                "Gateway RPC latency in seconds by method",
                &["method"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            events_appended: register_int_counter_with_registry!(
                "mirror_events_appended",
                "Events appended to the event log",
                registry,
            )
            .unwrap(),
            events_deduped: register_int_counter_with_registry!(
                "mirror_events_deduped",
                "Duplicate event deliveries dropped before append",
                registry,
            )
            .unwrap(),
            events_purged: register_int_counter_with_registry!(
                "mirror_events_purged",
                "Events removed by retention sweeps",
                registry,
            )
            .unwrap(),
            event_log_size: register_int_gauge_with_registry!(
                "mirror_event_log_size",
                "Current number of events in the log",
                registry,
            )
            .unwrap(),
            dedup_flights_started: register_int_counter_vec_with_registry!(
                "mirror_dedup_flights_started",
                "Single-flight operations started by table",
                &["table"],
                registry,
            )
            .unwrap(),
            dedup_joined: register_int_counter_vec_with_registry!(
                "mirror_dedup_joined",
                "Callers that joined an in-flight operation",
                &["table"],
                registry,
            )
            .unwrap(),
            dedup_rejected: register_int_counter_vec_with_registry!(
                "mirror_dedup_rejected",
                "Writes rejected because an identical one was in flight",
                &["table"],
                registry,
            )
            .unwrap(),
            requests_received: register_int_counter_vec_with_registry!(
                "mirror_requests_received",
                "HTTP API requests by route",
                &["route"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "mirror_err_requests",
                "HTTP API errors by route and error type",
                &["route", "error"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        Self::new(&Registry::new())
    }
}
