//! Types for ledger gateway integration

use serde::{Deserialize, Serialize};

/// Token amount in the ledger's smallest denomination.
pub type Amount = u128;

/// An account address on the ledger.
///
/// Treated as an opaque string; the engine never interprets it beyond equality
/// checks and display. One identity maps to exactly one commitment lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    /// Get the address as a string for API calls
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.to_string())
    }
}

/// Network identifier for the active chain.
///
/// The engine only operates while the session's chain matches the configured
/// required chain; any mismatch suspends both reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainId(pub u64);

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for a submitted state-changing call that has not yet settled.
///
/// Returned by the submit operations and redeemed via `await_settlement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementHandle(pub String);

impl SettlementHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Error types for ledger gateway operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The gateway rejected the call with a structured error response.
    #[error("Ledger rejected call: {message}")]
    Rejected { code: Option<i64>, message: String },

    /// The submission was declined before dispatch (e.g. the user refused to sign).
    #[error("Submission declined: {0}")]
    Declined(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("No data returned")]
    NoData,

    /// Settlement was observed but the call failed on-chain.
    #[error("Settlement failed: {0}")]
    SettlementFailed(String),
}

impl LedgerError {
    /// The structured error code from the remote, when one was provided.
    pub fn code(&self) -> Option<i64> {
        match self {
            LedgerError::Rejected { code, .. } => *code,
            _ => None,
        }
    }

    /// The raw message text used for classification.
    pub fn message(&self) -> String {
        self.to_string()
    }
}
