//! Approve/deposit transaction orchestration.
//!
//! The `TransactionOrchestrator` owns both write sub-machines and serializes
//! user-initiated writes: at most one approve or deposit is in flight at a
//! time for the active identity. Before submitting, each sub-machine
//! re-verifies its preconditions against the freshest available commitment
//! fact rather than trusting state that might be minutes stale, and
//! short-circuits locally when the outcome is already known (a balance too
//! short to approve, a deposit already recorded on the ledger).
//!
//! Failures are classified once settled. A user declining a wallet prompt is
//! not an error: the sub-machine quietly returns to idle. Everything else
//! leaves the sub-machine in a failed state from which the same operation is
//! safely re-invocable, with exactly one surfaced error record.

use crate::engine::errors::{self, ErrorKind};
use crate::engine::reconciler::PollingReconciler;
use crate::engine::state::{
    ApprovalState, DepositState, EngineState, ErrorRecord, OperationSource, StateCell,
};
use crate::ledger::{Amount, Identity, LedgerClient, LedgerError};

use std::sync::Arc;
use tracing::{debug, info, warn};

/// Driver for the approve → deposit commitment sequence.
pub struct TransactionOrchestrator {
    ledger: Arc<dyn LedgerClient>,
    state: Arc<StateCell>,
    reconciler: Arc<PollingReconciler>,
}

impl TransactionOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        state: Arc<StateCell>,
        reconciler: Arc<PollingReconciler>,
    ) -> Self {
        Self {
            ledger,
            state,
            reconciler,
        }
    }

    /// Submit an allowance approval for the required amount.
    ///
    /// Valid from Idle or Failed. A balance already known to be short fails
    /// locally without any ledger call; a declined wallet prompt resets to
    /// Idle without surfacing an error.
    pub async fn approve(&self) {
        let Some((identity, generation, known_amount)) = self.state.update(|state| {
            if state.any_pending() {
                debug!("Approve ignored: a write is already in flight");
                return None;
            }
            if !matches!(state.approval, ApprovalState::Idle | ApprovalState::Failed) {
                debug!("Approve ignored from state {:?}", state.approval);
                return None;
            }
            if state.deposit == DepositState::Success
                || state.commitment.as_ref().is_some_and(|f| f.has_committed)
            {
                debug!("Approve ignored: commitment already complete");
                return None;
            }
            let identity = state.identity.clone()?;

            if let Some(fact) = &state.commitment {
                if fact.owner_balance < fact.required_amount {
                    warn!(
                        "Balance {} is short of required {}, failing approve locally",
                        fact.owner_balance, fact.required_amount
                    );
                    state.approval = ApprovalState::Failed;
                    state.error = Some(ErrorRecord::new(
                        ErrorKind::InsufficientBalance,
                        OperationSource::Approve,
                    ));
                    return None;
                }
            }

            state.approval = ApprovalState::Pending;
            state.write_in_flight = true;
            state.error = None;
            let known_amount = state.commitment.as_ref().map(|f| f.required_amount);
            Some((identity, state.generation, known_amount))
        }) else {
            return;
        };

        info!("Submitting allowance approval for {}", identity);
        let result = self.run_approve(&identity, known_amount).await;

        let settled_ok = self.state.update(|state| {
            if state.generation != generation {
                debug!("Discarding approve result from a previous session");
                return false;
            }
            state.write_in_flight = false;

            match &result {
                Ok(()) => {
                    info!("Allowance approval settled for {}", identity);
                    state.approval = ApprovalState::Approved;
                    true
                }
                Err(error) => {
                    let kind = errors::classify(error);
                    if kind == ErrorKind::UserRejected {
                        debug!("Approval declined by user, returning to idle");
                        state.approval = ApprovalState::Idle;
                    } else {
                        warn!("Approval failed ({:?}): {}", kind, error);
                        state.approval = ApprovalState::Failed;
                        state.error =
                            Some(ErrorRecord::new(kind, OperationSource::Approve));
                    }
                    false
                }
            }
        });

        if settled_ok {
            self.reconciler.request_refresh();
        }
    }

    async fn run_approve(
        &self,
        identity: &Identity,
        known_amount: Option<Amount>,
    ) -> Result<(), LedgerError> {
        let amount = match known_amount {
            Some(amount) => amount,
            // No fact yet for this session; ask the ledger directly.
            None => self.ledger.required_amount().await?,
        };
        let handle = self.ledger.submit_approve(identity, amount).await?;
        self.ledger.await_settlement(&handle).await
    }

    /// Submit the deposit call.
    ///
    /// Gated on an approved allowance; calling without it is a no-op, not an
    /// error. A fact already showing the commitment as made settles locally
    /// as success. An allowance regression discovered by the write forces the
    /// approval sub-machine back to idle so the user can re-approve.
    pub async fn deposit(&self) {
        let Some((identity, generation)) = self.state.update(|state| {
            if state.approval != ApprovalState::Approved {
                debug!("Deposit ignored: allowance not approved");
                return None;
            }
            if state.any_pending() {
                debug!("Deposit ignored: a write is already in flight");
                return None;
            }
            if !matches!(state.deposit, DepositState::Idle | DepositState::Failed) {
                debug!("Deposit ignored from state {:?}", state.deposit);
                return None;
            }
            let identity = state.identity.clone()?;

            if state.commitment.as_ref().is_some_and(|f| f.has_committed) {
                info!("Ledger already shows the deposit, settling locally");
                mark_committed(state);
                return None;
            }

            state.deposit = DepositState::Pending;
            state.write_in_flight = true;
            state.error = None;
            Some((identity, state.generation))
        }) else {
            return;
        };

        info!("Submitting deposit for {}", identity);
        let result = self.run_deposit(&identity).await;

        let settled_ok = self.state.update(|state| {
            if state.generation != generation {
                debug!("Discarding deposit result from a previous session");
                return false;
            }
            state.write_in_flight = false;

            match &result {
                Ok(()) => {
                    info!("Deposit settled for {}", identity);
                    mark_committed(state);
                    true
                }
                Err(error) => match errors::classify(error) {
                    ErrorKind::UserRejected => {
                        debug!("Deposit declined by user, returning to idle");
                        state.deposit = DepositState::Idle;
                        false
                    }
                    // "Already done" is success, not failure.
                    ErrorKind::AlreadyCommitted => {
                        info!("Deposit reported as already made, treating as success");
                        mark_committed(state);
                        true
                    }
                    ErrorKind::InsufficientAllowance => {
                        warn!("Allowance regressed under the deposit: {}", error);
                        state.deposit = DepositState::Failed;
                        // The one case where the write path overrides a sticky
                        // approval: the user must approve again.
                        state.approval = ApprovalState::Idle;
                        state.error = Some(ErrorRecord::new(
                            ErrorKind::InsufficientAllowance,
                            OperationSource::Deposit,
                        ));
                        false
                    }
                    kind => {
                        warn!("Deposit failed ({:?}): {}", kind, error);
                        state.deposit = DepositState::Failed;
                        state.error = Some(ErrorRecord::new(kind, OperationSource::Deposit));
                        false
                    }
                },
            }
        });

        if settled_ok {
            self.reconciler.request_refresh();
        }
    }

    async fn run_deposit(&self, identity: &Identity) -> Result<(), LedgerError> {
        let handle = self.ledger.submit_deposit(identity).await?;
        self.ledger.await_settlement(&handle).await
    }

    /// Re-invoke whichever write operation is in a failed state.
    ///
    /// A failed deposit whose approval was reset (allowance regression) routes
    /// back through approve, since the deposit cannot proceed without it.
    pub async fn retry_failed_transaction(&self) {
        enum Target {
            Approve,
            Deposit,
        }

        let target = self.state.read(|state| {
            if state.deposit == DepositState::Failed {
                if state.approval == ApprovalState::Approved {
                    Some(Target::Deposit)
                } else {
                    Some(Target::Approve)
                }
            } else if state.approval == ApprovalState::Failed {
                Some(Target::Approve)
            } else {
                None
            }
        });

        match target {
            Some(Target::Approve) => self.approve().await,
            Some(Target::Deposit) => self.deposit().await,
            None => debug!("Retry requested with nothing in a failed state"),
        }
    }

    /// Drop the surfaced error record, if any.
    pub fn dismiss_error(&self) {
        self.state.update(|state| {
            if state.error.take().is_some() {
                debug!("Error record dismissed");
            }
        });
    }
}

/// Terminal success: the deposit is made and the local fact reflects it
/// immediately, ahead of the next reconciliation read.
fn mark_committed(state: &mut EngineState) {
    state.deposit = DepositState::Success;
    if let Some(fact) = &mut state.commitment {
        fact.has_committed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backoff::BackoffPolicy;
    use crate::engine::state::CommitmentFact;
    use crate::engine::testing::MockLedger;
    use chrono::Utc;
    use std::time::Duration;

    fn fact(required: Amount, allowance: Amount, balance: Amount) -> CommitmentFact {
        CommitmentFact {
            has_committed: false,
            required_amount: required,
            current_allowance: allowance,
            owner_balance: balance,
            fetched_at: Utc::now(),
        }
    }

    fn setup(
        ledger: Arc<MockLedger>,
        seeded_fact: Option<CommitmentFact>,
    ) -> (Arc<StateCell>, TransactionOrchestrator) {
        let state = StateCell::new();
        state.reset_for(Some(Identity::from("0xaaa")));
        if let Some(fact) = seeded_fact {
            state.update(|s| s.commitment = Some(fact));
        }
        let reconciler = Arc::new(PollingReconciler::new(
            ledger.clone(),
            state.clone(),
            BackoffPolicy::default(),
            Duration::from_secs(30),
        ));
        let orchestrator = TransactionOrchestrator::new(ledger, state.clone(), reconciler);
        (state, orchestrator)
    }

    fn rejected(message: &str) -> LedgerError {
        LedgerError::Rejected {
            code: None,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn approve_short_circuits_on_known_short_balance() {
        let ledger = Arc::new(MockLedger::with_fact(150, 0, 100));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 0, 100)));

        orchestrator.approve().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.approval, ApprovalState::Failed);
        let error = snapshot.error.unwrap();
        assert_eq!(error.kind, ErrorKind::InsufficientBalance);
        assert_eq!(error.source, OperationSource::Approve);
        // Known-short balance means zero ledger calls were made.
        assert_eq!(ledger.read_calls(), 0);
        assert_eq!(ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn approve_settles_to_approved() {
        let ledger = Arc::new(MockLedger::with_fact(150, 0, 500));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 0, 500)));

        orchestrator.approve().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.approval, ApprovalState::Approved);
        assert!(snapshot.error.is_none());
        assert_eq!(ledger.submit_calls(), 1);
    }

    #[tokio::test]
    async fn approve_without_fact_reads_required_amount() {
        let ledger = Arc::new(MockLedger::with_fact(150, 0, 500));
        let (state, orchestrator) = setup(ledger.clone(), None);

        orchestrator.approve().await;

        assert_eq!(state.snapshot().approval, ApprovalState::Approved);
        assert_eq!(ledger.read_calls(), 1);
    }

    #[tokio::test]
    async fn approve_user_rejection_is_silent() {
        let ledger = Arc::new(MockLedger::with_fact(150, 0, 500));
        ledger.push_approve_outcome(Err(LedgerError::Declined(
            "user rejected the request".to_string(),
        )));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 0, 500)));

        orchestrator.approve().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.approval, ApprovalState::Idle);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn approve_failure_is_reenterable() {
        let ledger = Arc::new(MockLedger::with_fact(150, 0, 500));
        ledger.push_approve_outcome(Err(rejected("execution reverted: paused")));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 0, 500)));

        orchestrator.approve().await;
        let snapshot = state.snapshot();
        assert_eq!(snapshot.approval, ApprovalState::Failed);
        assert_eq!(snapshot.error.unwrap().kind, ErrorKind::ContractReverted);

        // Same operation retries cleanly from Failed.
        orchestrator.approve().await;
        let snapshot = state.snapshot();
        assert_eq!(snapshot.approval, ApprovalState::Approved);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn approve_is_blocked_while_write_in_flight() {
        let ledger = Arc::new(MockLedger::with_fact(150, 0, 500));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 0, 500)));
        state.update(|s| {
            s.deposit = DepositState::Pending;
            s.write_in_flight = true;
        });

        orchestrator.approve().await;

        assert_eq!(state.snapshot().approval, ApprovalState::Idle);
        assert_eq!(ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn deposit_without_approval_is_noop() {
        let ledger = Arc::new(MockLedger::with_fact(150, 150, 500));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 150, 500)));

        orchestrator.deposit().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.deposit, DepositState::Idle);
        assert!(snapshot.error.is_none());
        assert_eq!(ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn deposit_success_marks_committed_immediately() {
        let ledger = Arc::new(MockLedger::with_fact(150, 150, 500));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 150, 500)));
        state.update(|s| s.approval = ApprovalState::Approved);

        orchestrator.deposit().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.deposit, DepositState::Success);
        // Optimistic flip, ahead of the next reconciliation read.
        assert!(snapshot.commitment.unwrap().has_committed);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn deposit_user_rejection_is_silent() {
        let ledger = Arc::new(MockLedger::with_fact(150, 150, 500));
        ledger.push_deposit_outcome(Err(LedgerError::Declined(
            "user denied transaction signature".to_string(),
        )));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 150, 500)));
        state.update(|s| s.approval = ApprovalState::Approved);

        orchestrator.deposit().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.deposit, DepositState::Idle);
        assert_eq!(snapshot.approval, ApprovalState::Approved);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn deposit_allowance_regression_forces_reapproval() {
        let ledger = Arc::new(MockLedger::with_fact(150, 150, 500));
        ledger.push_deposit_outcome(Err(rejected(
            "ERC20: transfer amount exceeds allowance",
        )));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 150, 500)));
        state.update(|s| s.approval = ApprovalState::Approved);

        orchestrator.deposit().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.deposit, DepositState::Failed);
        assert_eq!(snapshot.approval, ApprovalState::Idle);
        let error = snapshot.error.unwrap();
        assert_eq!(error.kind, ErrorKind::InsufficientAllowance);
        assert_eq!(error.source, OperationSource::Deposit);
    }

    #[tokio::test]
    async fn deposit_already_committed_is_success() {
        let ledger = Arc::new(MockLedger::with_fact(150, 150, 500));
        ledger.push_deposit_outcome(Err(rejected("execution failed: already deposited")));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 150, 500)));
        state.update(|s| s.approval = ApprovalState::Approved);

        orchestrator.deposit().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.deposit, DepositState::Success);
        assert!(snapshot.commitment.unwrap().has_committed);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn deposit_other_failure_keeps_approval() {
        let ledger = Arc::new(MockLedger::with_fact(150, 150, 500));
        ledger.push_deposit_outcome(Err(rejected("execution reverted: cap reached")));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 150, 500)));
        state.update(|s| s.approval = ApprovalState::Approved);

        orchestrator.deposit().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.deposit, DepositState::Failed);
        assert_eq!(snapshot.approval, ApprovalState::Approved);
        assert_eq!(snapshot.error.unwrap().kind, ErrorKind::ContractReverted);
    }

    #[tokio::test]
    async fn deposit_short_circuits_on_committed_fact() {
        let ledger = Arc::new(MockLedger::with_fact(150, 150, 500));
        let mut committed = fact(150, 150, 500);
        committed.has_committed = true;
        let (state, orchestrator) = setup(ledger.clone(), Some(committed));
        state.update(|s| s.approval = ApprovalState::Approved);

        orchestrator.deposit().await;

        assert_eq!(state.snapshot().deposit, DepositState::Success);
        assert_eq!(ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn retry_routes_reset_approval_back_through_approve() {
        let ledger = Arc::new(MockLedger::with_fact(150, 150, 500));
        ledger.push_deposit_outcome(Err(rejected("exceeds allowance")));
        let (state, orchestrator) = setup(ledger.clone(), Some(fact(150, 150, 500)));
        state.update(|s| s.approval = ApprovalState::Approved);

        orchestrator.deposit().await;
        assert_eq!(state.snapshot().approval, ApprovalState::Idle);

        orchestrator.retry_failed_transaction().await;

        // The retry re-approves; the deposit stays failed until re-invoked.
        assert_eq!(state.snapshot().approval, ApprovalState::Approved);
        assert_eq!(state.snapshot().deposit, DepositState::Failed);
    }

    #[tokio::test]
    async fn dismiss_error_clears_record() {
        let ledger = Arc::new(MockLedger::with_fact(150, 0, 100));
        let (state, orchestrator) = setup(ledger, Some(fact(150, 0, 100)));

        orchestrator.approve().await;
        assert!(state.snapshot().error.is_some());

        orchestrator.dismiss_error();
        assert!(state.snapshot().error.is_none());
    }
}
