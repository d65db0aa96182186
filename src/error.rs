// Copyright (c) The LedgerMirror Core Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

pub type MirrorResult<T> = Result<T, MirrorError>;

/// Failure classes reported by the ledger gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    // The gateway endpoint could not be reached
    ConnectionFailed,
    // The contract or view/mutating method does not exist
    MethodNotFound,
    // The ledger rejected (reverted) the call
    RevertedCall,
    // The request did not complete within the gateway deadline
    Timeout,
}

impl GatewayErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayErrorKind::ConnectionFailed => "connection_failed",
            GatewayErrorKind::MethodNotFound => "method_not_found",
            GatewayErrorKind::RevertedCall => "reverted_call",
            GatewayErrorKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    // Gateway call/send/subscription failure
    Gateway {
        kind: GatewayErrorKind,
        message: String,
    },
    // Cache store I/O failure
    Cache(String),
    // A write with the same operation key is already in flight
    DuplicateOperation(String),
    // Read requested before the first successful sync cycle
    NotYetSynced,
    // Uncategorized error
    Generic(String),
}

impl MirrorError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            MirrorError::Gateway { kind, .. } => kind.as_str(),
            MirrorError::Cache(_) => "cache",
            MirrorError::DuplicateOperation(_) => "duplicate_operation",
            MirrorError::NotYetSynced => "not_yet_synced",
            MirrorError::Generic(_) => "generic",
        }
    }

    pub fn gateway(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        MirrorError::Gateway {
            kind,
            message: message.into(),
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, MirrorError::Gateway { .. })
    }
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::Gateway { kind, message } => {
                write!(f, "gateway error ({}): {}", kind.as_str(), message)
            }
            MirrorError::Cache(msg) => write!(f, "cache error: {}", msg),
            MirrorError::DuplicateOperation(key) => {
                write!(f, "operation already in flight for key {}", key)
            }
            MirrorError::NotYetSynced => write!(f, "no sync cycle has completed yet"),
            MirrorError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for MirrorError {}
