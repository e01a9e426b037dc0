//! Shared engine state and snapshot publication.
//!
//! This module defines the single state tuple held per active identity
//! (commitment fact, approval and deposit sub-machine states, retry state,
//! surfaced error) and the cell that guards it. The cell is the only path to
//! the state: the reconciler and the orchestrator mutate it through their
//! narrow operation sets, and every mutation publishes a fresh read-only
//! snapshot over a watch channel for the presentation layer.

use crate::engine::errors::ErrorKind;
use crate::ledger::{Amount, Identity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Allowance approval sub-machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApprovalState {
    #[default]
    Idle,
    Pending,
    Approved,
    Failed,
}

/// Deposit sub-machine state. `Success` is terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DepositState {
    #[default]
    Idle,
    Pending,
    Success,
    Failed,
}

/// The operation a surfaced error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationSource {
    Approve,
    Deposit,
    StatusRead,
}

/// A surfaced, user-visible failure. At most one exists at a time; it lives
/// until dismissed or superseded by a newer error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub source: OperationSource,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, source: OperationSource) -> Self {
        Self {
            kind,
            message: kind.user_message().to_string(),
            source,
        }
    }
}

/// Reconciled remote commitment state for one identity.
///
/// Produced wholesale by a successful reconciliation read and replaced, never
/// partially updated. The one exception is the optimistic has-committed flip
/// the orchestrator applies on deposit success, ahead of the next read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentFact {
    pub has_committed: bool,
    pub required_amount: Amount,
    pub current_allowance: Amount,
    pub owner_balance: Amount,
    pub fetched_at: DateTime<Utc>,
}

/// Read-retry bookkeeping for the polling stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryState {
    /// Failed attempts since the last successful read.
    pub attempt: u32,
    /// Delay before the next automatic retry; zero when none is scheduled.
    pub next_delay: Duration,
}

/// Read-only view of the engine state, published on every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub approval: ApprovalState,
    pub deposit: DepositState,
    pub commitment: Option<CommitmentFact>,
    pub error: Option<ErrorRecord>,
    pub retry: RetryState,
}

/// The full mutable state behind the cell. Crate-internal: only the
/// reconciler and orchestrator operate on it.
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    pub approval: ApprovalState,
    pub deposit: DepositState,
    pub commitment: Option<CommitmentFact>,
    pub error: Option<ErrorRecord>,
    pub retry: RetryState,
    /// Set while an approve or deposit write is between submit and settlement.
    pub write_in_flight: bool,
    /// Bumped on every identity/network reset. Results computed under an older
    /// generation are discarded instead of applied.
    pub generation: u64,
    pub identity: Option<Identity>,
}

impl EngineState {
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            approval: self.approval,
            deposit: self.deposit,
            commitment: self.commitment.clone(),
            error: self.error.clone(),
            retry: self.retry,
        }
    }

    /// Whether either sub-machine has a write in flight.
    pub fn any_pending(&self) -> bool {
        self.write_in_flight
            || self.approval == ApprovalState::Pending
            || self.deposit == DepositState::Pending
    }
}

/// Guarded state cell with snapshot publication.
pub struct StateCell {
    inner: Mutex<EngineState>,
    publisher: watch::Sender<EngineSnapshot>,
}

impl StateCell {
    pub fn new() -> Arc<Self> {
        let (publisher, _) = watch::channel(EngineSnapshot::default());
        Arc::new(Self {
            inner: Mutex::new(EngineState::default()),
            publisher,
        })
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.publisher.subscribe()
    }

    /// Current snapshot without subscribing.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.lock().unwrap().snapshot()
    }

    /// Read from the state without mutating or publishing.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        f(&self.inner.lock().unwrap())
    }

    /// Apply a mutation and publish the resulting snapshot.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let (result, snapshot) = {
            let mut guard = self.inner.lock().unwrap();
            let result = f(&mut guard);
            (result, guard.snapshot())
        };
        self.publisher.send_replace(snapshot);
        result
    }

    /// Reset everything for a new identity (or none), invalidating any result
    /// still in flight under the previous generation.
    pub(crate) fn reset_for(&self, identity: Option<Identity>) -> u64 {
        self.update(|state| {
            let generation = state.generation + 1;
            *state = EngineState {
                generation,
                identity,
                ..EngineState::default()
            };
            generation
        })
    }
}
