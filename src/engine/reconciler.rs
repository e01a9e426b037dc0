//! Background reconciliation of local commitment state with the ledger.
//!
//! The `PollingReconciler` owns the repeating read of remote commitment state
//! for the active identity. It is the only producer of `CommitmentFact`s and
//! the only component allowed to feed the approval sub-machine forward
//! (Idle/Failed toward Approved) off a fresh read. Reads never overlap: the
//! next read is scheduled a fixed interval after the previous one completes.
//! Failures are classified and surfaced without discarding the last known
//! fact, and retried with exponential backoff up to a fixed attempt ceiling,
//! after which only a manual trigger resumes polling.
//!
//! Stopping cancels the next scheduled read; a read already dispatched is
//! allowed to complete and its result is discarded, both via the stop signal
//! and via the generation check inside the state cell. The generation check
//! also guarantees that a fact read for a previous identity is never applied
//! to a new session.

use crate::engine::backoff::BackoffPolicy;
use crate::engine::errors;
use crate::engine::state::{
    ApprovalState, CommitmentFact, DepositState, ErrorRecord, OperationSource, RetryState,
    StateCell,
};
use crate::ledger::{Identity, LedgerClient, LedgerError};

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

/// Repeating status reader for the active identity.
pub struct PollingReconciler {
    ledger: Arc<dyn LedgerClient>,
    state: Arc<StateCell>,
    policy: BackoffPolicy,
    poll_interval: Duration,
    /// Wakes the worker for an immediate read, bypassing any pending delay.
    poke: Arc<Notify>,
    /// Stop signal for the running worker, if any.
    running: Mutex<Option<watch::Sender<bool>>>,
}

impl PollingReconciler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        state: Arc<StateCell>,
        policy: BackoffPolicy,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            state,
            policy,
            poll_interval,
            poke: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    /// Start polling for the given identity under the given state generation.
    ///
    /// Any previous worker is stopped first. The first read happens
    /// immediately.
    pub fn start(&self, identity: Identity, generation: u64) {
        self.stop();

        info!("Starting status reconciliation for {}", identity);
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.running.lock().unwrap() = Some(stop_tx);

        let worker = ReconcilerWorker {
            ledger: self.ledger.clone(),
            state: self.state.clone(),
            policy: self.policy.clone(),
            poll_interval: self.poll_interval,
            poke: self.poke.clone(),
        };
        tokio::spawn(worker.run(identity, generation, stop_rx));
    }

    /// Stop polling. Idempotent; cancels the next scheduled read while any
    /// read already in flight completes and is discarded.
    pub fn stop(&self) {
        if let Some(stop_tx) = self.running.lock().unwrap().take() {
            debug!("Stopping status reconciliation");
            let _ = stop_tx.send(true);
        }
    }

    /// Retry a failed status read immediately, bypassing the backoff delay.
    pub fn manual_retry(&self) {
        info!("Manual status retry requested");
        self.poke.notify_one();
    }

    /// Request an immediate read ahead of the next scheduled one. Used by the
    /// write path after a settlement to refresh faster than the poll interval.
    pub fn request_refresh(&self) {
        debug!("Immediate status refresh requested");
        self.poke.notify_one();
    }
}

struct ReconcilerWorker {
    ledger: Arc<dyn LedgerClient>,
    state: Arc<StateCell>,
    policy: BackoffPolicy,
    poll_interval: Duration,
    poke: Arc<Notify>,
}

impl ReconcilerWorker {
    async fn run(self, identity: Identity, generation: u64, mut stop_rx: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let outcome = read_commitment_fact(&*self.ledger, &identity).await;

            if *stop_rx.borrow() {
                debug!("Reconciler stopped, discarding in-flight read result");
                break;
            }

            match outcome {
                Ok(fact) => {
                    if !self.apply_fact(generation, fact) {
                        break;
                    }
                    attempt = 0;

                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.poke.notified() => {
                            debug!("Waking for immediate read");
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
                Err(error) => {
                    if self.policy.allows_retry(attempt) {
                        let delay = self.policy.next_delay(attempt);
                        if !self.apply_failure(generation, &error, attempt + 1, delay) {
                            break;
                        }
                        warn!(
                            "Status read failed (attempt {}), retrying in {:?}: {}",
                            attempt + 1,
                            delay,
                            error
                        );
                        attempt += 1;

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.poke.notified() => {
                                debug!("Manual retry bypassing backoff delay");
                            }
                            _ = stop_rx.changed() => break,
                        }
                    } else {
                        if !self.apply_failure(generation, &error, attempt, Duration::ZERO) {
                            break;
                        }
                        warn!(
                            "Status read failed after {} attempts, waiting for manual retry: {}",
                            attempt, error
                        );

                        tokio::select! {
                            _ = self.poke.notified() => {}
                            _ = stop_rx.changed() => break,
                        }
                    }
                }
            }
        }

        debug!("Reconciler worker for {} exited", identity);
    }

    /// Apply a freshly read fact. Returns false if the session has moved on
    /// and the worker should exit.
    fn apply_fact(&self, generation: u64, fact: CommitmentFact) -> bool {
        self.state.update(|state| {
            if state.generation != generation {
                debug!("Discarding stale fact from a previous session");
                return false;
            }

            state.retry = RetryState::default();

            // A fresh read supersedes an earlier read error, never a write error.
            if matches!(&state.error, Some(e) if e.source == OperationSource::StatusRead) {
                state.error = None;
            }

            let write_pending = state.any_pending();
            let has_committed = fact.has_committed;
            let allowance_sufficient = fact.current_allowance >= fact.required_amount;
            debug!(
                "Reconciled fact: committed={}, allowance={}, balance={}",
                has_committed, fact.current_allowance, fact.owner_balance
            );
            state.commitment = Some(fact);

            // Never touch the sub-machines while a write is in flight; the
            // settling write decides its own outcome.
            if !write_pending {
                if has_committed && state.deposit != DepositState::Success {
                    info!("Ledger reports commitment already complete");
                    state.deposit = DepositState::Success;
                }

                if !has_committed
                    && allowance_sufficient
                    && matches!(state.approval, ApprovalState::Idle | ApprovalState::Failed)
                {
                    info!("Fresh read confirms sufficient allowance");
                    state.approval = ApprovalState::Approved;
                }
            }

            true
        })
    }

    /// Surface a read failure without clearing the last known fact. Returns
    /// false if the session has moved on.
    fn apply_failure(
        &self,
        generation: u64,
        error: &LedgerError,
        attempt: u32,
        next_delay: Duration,
    ) -> bool {
        let kind = errors::classify(error);

        self.state.update(|state| {
            if state.generation != generation {
                debug!("Discarding stale read failure from a previous session");
                return false;
            }

            state.retry = RetryState {
                attempt,
                next_delay,
            };
            state.error = Some(ErrorRecord::new(kind, OperationSource::StatusRead));
            true
        })
    }
}

/// Read the full commitment fact for an identity in one pass.
///
/// The four reads are sequential; the first failure aborts the cycle so a
/// fact is always built from a single consistent pass.
async fn read_commitment_fact(
    ledger: &dyn LedgerClient,
    identity: &Identity,
) -> Result<CommitmentFact, LedgerError> {
    let has_committed = ledger.has_committed(identity).await?;
    let required_amount = ledger.required_amount().await?;
    let current_allowance = ledger.allowance(identity).await?;
    let owner_balance = ledger.balance(identity).await?;

    Ok(CommitmentFact {
        has_committed,
        required_amount,
        current_allowance,
        owner_balance,
        fetched_at: Utc::now(),
    })
}
