//! Commitment Engine Module
//!
//! This module provides all the core logic for driving a two-phase deposit
//! commitment (approve an allowance, then execute the deposit) against a
//! remote ledger, while continuously reconciling local belief with the
//! ledger's authoritative state. It is composed of several submodules, each
//! responsible for a specific aspect of the engine:
//!
//! - `orchestrator`: The approve/deposit state machine. Serializes writes and
//!   decides when reconciliation facts may override in-flight state.
//! - `reconciler`: The background polling reader that produces commitment
//!   facts and recovers from read failures with bounded backoff.
//! - `errors`: Classification of raw ledger failures into actionable kinds.
//! - `backoff`: Pure retry-delay policy for the polling stream.
//! - `state`: The shared state tuple, its guard cell, and snapshot
//!   publication for the presentation layer.
//!
//! The `CommitmentEngine` facade wires these together per session: starting
//! it binds an identity and network, stopping it invalidates everything. The
//! presentation layer subscribes to snapshots and calls the narrow operation
//! set; nothing else can touch the state.

/// Pure retry-delay policy
pub mod backoff;
/// Classification of ledger failures
pub mod errors;
/// Approve/deposit write orchestration
pub mod orchestrator;
/// Background status polling and reconciliation
pub mod reconciler;
/// Shared state and snapshot publication
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::BackoffPolicy;
pub use errors::ErrorKind;
pub use orchestrator::TransactionOrchestrator;
pub use reconciler::PollingReconciler;
pub use state::{
    ApprovalState, CommitmentFact, DepositState, EngineSnapshot, ErrorRecord, OperationSource,
    RetryState, StateCell,
};

use crate::config::{ConfigError, EngineConfig};
use crate::ledger::{ChainId, Identity, LedgerClient};

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Session-scoped facade over the reconciler and orchestrator.
///
/// One engine instance serves one identity lifecycle at a time; starting it
/// for a new identity or network discards everything held for the previous
/// one.
pub struct CommitmentEngine {
    state: Arc<StateCell>,
    reconciler: Arc<PollingReconciler>,
    orchestrator: TransactionOrchestrator,
    required_chain: ChainId,
}

impl CommitmentEngine {
    /// Build the engine from validated configuration.
    ///
    /// Configuration problems are fatal here: an engine with a missing or
    /// malformed contract address must never start.
    pub fn new(
        config: &EngineConfig,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let state = StateCell::new();
        let policy = BackoffPolicy::new(config.backoff_base, config.max_retry_attempts);
        let reconciler = Arc::new(PollingReconciler::new(
            ledger.clone(),
            state.clone(),
            policy,
            config.poll_interval,
        ));
        let orchestrator =
            TransactionOrchestrator::new(ledger, state.clone(), reconciler.clone());

        Ok(Self {
            state,
            reconciler,
            orchestrator,
            required_chain: config.required_chain,
        })
    }

    /// Begin a session for the given identity on the given chain.
    ///
    /// A chain other than the configured one suspends the engine entirely:
    /// neither reads nor writes happen until a session on the right chain
    /// starts.
    pub fn start(&self, identity: Identity, chain: ChainId) {
        if chain != self.required_chain {
            warn!(
                "Chain {} does not match required chain {}, suspending engine",
                chain, self.required_chain
            );
            self.stop();
            return;
        }

        info!("Starting commitment session for {} on chain {}", identity, chain);
        let generation = self.state.reset_for(Some(identity.clone()));
        self.reconciler.start(identity, generation);
    }

    /// End the current session, discarding all of its state. Idempotent.
    pub fn stop(&self) {
        self.reconciler.stop();
        self.state.reset_for(None);
    }

    /// Subscribe to read-only snapshots for rendering.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.state.subscribe()
    }

    /// Current snapshot without subscribing.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.state.snapshot()
    }

    /// Approve the required spend allowance.
    pub async fn approve(&self) {
        self.orchestrator.approve().await;
    }

    /// Execute the deposit. No-op unless the allowance is approved.
    pub async fn deposit(&self) {
        self.orchestrator.deposit().await;
    }

    /// Re-invoke whichever write operation last failed.
    pub async fn retry_failed_transaction(&self) {
        self.orchestrator.retry_failed_transaction().await;
    }

    /// Retry a failed status read immediately.
    pub fn retry_status_check(&self) {
        self.reconciler.manual_retry();
    }

    /// Dismiss the surfaced error record.
    pub fn dismiss_error(&self) {
        self.orchestrator.dismiss_error();
    }
}
