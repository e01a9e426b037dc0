//! Error classification for ledger failures.
//!
//! Gateways and wallets return unstructured, vendor-specific error text. This
//! module maps any raw failure onto a bounded set of actionable kinds, each
//! with a fixed user-facing message. Classification is total: it never fails
//! and always returns exactly one kind, degrading to `Unknown` rather than
//! propagating unclassifiable errors.
//!
//! Structured RPC error codes, when the gateway provides them, are consulted
//! before text matching; the pattern table is ordered and the first match
//! wins.

use crate::ledger::LedgerError;

use serde::{Deserialize, Serialize};

/// Actionable categories for ledger failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The user declined the wallet prompt. Not surfaced as an error.
    UserRejected,
    /// The owner balance cannot cover the required amount.
    InsufficientBalance,
    /// The granted allowance is below the required amount.
    InsufficientAllowance,
    /// The call ran out of gas or gas estimation failed.
    GasFailure,
    /// Transport-level failure reaching the ledger.
    NetworkFailure,
    /// The gateway is throttling requests.
    RateLimited,
    /// A competing transaction from the same account got in first.
    NonceConflict,
    /// The contract reverted the call.
    ContractReverted,
    /// The deposit has already been made for this identity.
    AlreadyCommitted,
    /// Required addresses are missing or malformed. Fatal at startup.
    ConfigurationError,
    /// Anything that matched no rule.
    Unknown,
}

impl ErrorKind {
    /// Fixed user-facing explanation for this kind.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::UserRejected => "The request was cancelled in your wallet.",
            ErrorKind::InsufficientBalance => {
                "Your balance is too low to cover the required deposit."
            }
            ErrorKind::InsufficientAllowance => {
                "The approved allowance is no longer sufficient. Please approve again."
            }
            ErrorKind::GasFailure => "The transaction failed due to gas limits. Please retry.",
            ErrorKind::NetworkFailure => {
                "Could not reach the network. Check your connection and retry."
            }
            ErrorKind::RateLimited => "Too many requests. Please wait a moment and retry.",
            ErrorKind::NonceConflict => {
                "A conflicting transaction was detected. Please retry."
            }
            ErrorKind::ContractReverted => "The contract rejected the transaction.",
            ErrorKind::AlreadyCommitted => "The deposit has already been completed.",
            ErrorKind::ConfigurationError => {
                "The application is misconfigured. Contact the operator."
            }
            ErrorKind::Unknown => "Something went wrong. Please retry.",
        }
    }
}

/// Structured code rules, consulted before text matching.
///
/// 4001 is the EIP-1193 user-rejection code; 429 is plain HTTP throttling and
/// -32005 the JSON-RPC request-limit code.
const CODE_RULES: &[(i64, ErrorKind)] = &[
    (4001, ErrorKind::UserRejected),
    (429, ErrorKind::RateLimited),
    (-32005, ErrorKind::RateLimited),
];

/// Ordered substring rules over the lowercased message text. First match wins.
const PATTERN_RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::UserRejected,
        &["user rejected", "user denied", "rejected by user", "user cancelled", "declined"],
    ),
    (
        ErrorKind::AlreadyCommitted,
        &["already deposited", "already committed", "deposit exists"],
    ),
    (
        ErrorKind::InsufficientAllowance,
        &["insufficient allowance", "exceeds allowance", "allowance too low"],
    ),
    (
        ErrorKind::InsufficientBalance,
        &["insufficient funds", "insufficient balance", "exceeds balance"],
    ),
    (
        ErrorKind::NonceConflict,
        &["nonce too low", "nonce has already been used", "replacement transaction"],
    ),
    (
        ErrorKind::GasFailure,
        &["out of gas", "gas required exceeds", "intrinsic gas", "gas estimation"],
    ),
    (
        ErrorKind::RateLimited,
        &["rate limit", "too many requests", "throttled"],
    ),
    (
        ErrorKind::ConfigurationError,
        &["missing contract address", "invalid address", "not configured"],
    ),
    (
        ErrorKind::ContractReverted,
        &["execution reverted", "reverted", "require(false)"],
    ),
    (
        ErrorKind::NetworkFailure,
        &["network", "timeout", "timed out", "connection", "unreachable", "disconnected"],
    ),
];

/// Classify a raw ledger failure into exactly one `ErrorKind`.
pub fn classify(error: &LedgerError) -> ErrorKind {
    // Transport failures are structural, no text matching needed.
    if matches!(error, LedgerError::HttpError(_)) {
        return ErrorKind::NetworkFailure;
    }

    if let Some(code) = error.code() {
        for (rule_code, kind) in CODE_RULES {
            if code == *rule_code {
                return *kind;
            }
        }
    }

    classify_message(&error.message())
}

/// Classify raw message text against the ordered pattern table.
pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();

    for (kind, patterns) in PATTERN_RULES {
        if patterns.iter().any(|p| lowered.contains(p)) {
            return *kind;
        }
    }

    ErrorKind::Unknown
}
