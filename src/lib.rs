// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chain state mirror node.
//!
//! Keeps a durable local mirror of tracked contract state (periodic
//! pull plus event push), records a bounded event log, and fronts
//! ledger reads and writes with single-flight deduplication.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod node;
pub mod ops;
pub mod server;
pub mod singleflight;
pub mod syncer;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
