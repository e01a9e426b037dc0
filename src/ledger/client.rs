//! Ledger client contract consumed by the engine.
//!
//! The engine only depends on this narrow read/write surface. Reads return
//! current public state and may fail transiently; writes are submitted as
//! signed state-changing calls that eventually settle with success or failure.

use crate::ledger::types::{Amount, Identity, LedgerError, SettlementHandle};

/// Read/write contract against the remote ledger.
///
/// All reads may fail with a `LedgerError`. Submissions may fail synchronously
/// (rejected before dispatch, e.g. the user declines signing) or
/// asynchronously (settlement fails after inclusion).
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    /// Whether the identity has already completed its deposit commitment.
    async fn has_committed(&self, identity: &Identity) -> Result<bool, LedgerError>;

    /// The deposit amount the commitment contract requires.
    async fn required_amount(&self) -> Result<Amount, LedgerError>;

    /// The spend allowance currently granted to the commitment contract.
    async fn allowance(&self, identity: &Identity) -> Result<Amount, LedgerError>;

    /// The identity's token balance.
    async fn balance(&self, identity: &Identity) -> Result<Amount, LedgerError>;

    /// Submit an allowance approval for the given amount.
    async fn submit_approve(
        &self,
        identity: &Identity,
        amount: Amount,
    ) -> Result<SettlementHandle, LedgerError>;

    /// Submit the deposit call.
    async fn submit_deposit(
        &self,
        identity: &Identity,
    ) -> Result<SettlementHandle, LedgerError>;

    /// Wait for a submitted call to settle.
    ///
    /// Resolves `Ok(())` once the call succeeded on-chain, or an error once it
    /// is known to have failed. There is no timeout beyond what the gateway
    /// itself provides; callers remain cancellable at this suspension point.
    async fn await_settlement(&self, handle: &SettlementHandle) -> Result<(), LedgerError>;
}
