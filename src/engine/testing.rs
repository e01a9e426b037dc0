//! Test doubles shared by the engine unit tests.

use crate::ledger::{Amount, Identity, LedgerClient, LedgerError, SettlementHandle};

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;

/// Programmable in-memory ledger.
///
/// Reads serve the configured values, or fail while `read_failure` is set.
/// Submissions pop their next outcome from a queue (empty queue means
/// success). Every trait call is counted so tests can assert that
/// short-circuit paths make no ledger calls at all.
#[derive(Default)]
pub(crate) struct MockLedger {
    pub inner: Mutex<MockLedgerState>,
}

#[derive(Default)]
pub(crate) struct MockLedgerState {
    pub has_committed: bool,
    pub required_amount: Amount,
    pub allowance: Amount,
    pub balance: Amount,
    /// While set, every read fails with this message.
    pub read_failure: Option<String>,
    /// Next outcomes for approve submissions, popped per call.
    pub approve_outcomes: VecDeque<Result<(), LedgerError>>,
    /// Next outcomes for deposit submissions, popped per call.
    pub deposit_outcomes: VecDeque<Result<(), LedgerError>>,
    pub read_calls: u32,
    pub submit_calls: u32,
    /// Instants of read cycles, for asserting backoff schedules.
    pub read_times: Vec<Instant>,
}

impl MockLedger {
    pub fn with_fact(required: Amount, allowance: Amount, balance: Amount) -> Self {
        let ledger = Self::default();
        {
            let mut inner = ledger.inner.lock().unwrap();
            inner.required_amount = required;
            inner.allowance = allowance;
            inner.balance = balance;
        }
        ledger
    }

    pub fn set_read_failure(&self, message: Option<&str>) {
        self.inner.lock().unwrap().read_failure = message.map(str::to_string);
    }

    pub fn push_approve_outcome(&self, outcome: Result<(), LedgerError>) {
        self.inner.lock().unwrap().approve_outcomes.push_back(outcome);
    }

    pub fn push_deposit_outcome(&self, outcome: Result<(), LedgerError>) {
        self.inner.lock().unwrap().deposit_outcomes.push_back(outcome);
    }

    pub fn read_calls(&self) -> u32 {
        self.inner.lock().unwrap().read_calls
    }

    pub fn submit_calls(&self) -> u32 {
        self.inner.lock().unwrap().submit_calls
    }

    pub fn read_times(&self) -> Vec<Instant> {
        self.inner.lock().unwrap().read_times.clone()
    }

    fn record_read(&self) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.read_calls += 1;
        inner.read_times.push(Instant::now());
        match &inner.read_failure {
            Some(message) => Err(LedgerError::Rejected {
                code: None,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl LedgerClient for MockLedger {
    async fn has_committed(&self, _identity: &Identity) -> Result<bool, LedgerError> {
        self.record_read()?;
        Ok(self.inner.lock().unwrap().has_committed)
    }

    async fn required_amount(&self) -> Result<Amount, LedgerError> {
        self.record_read()?;
        Ok(self.inner.lock().unwrap().required_amount)
    }

    async fn allowance(&self, _identity: &Identity) -> Result<Amount, LedgerError> {
        self.record_read()?;
        Ok(self.inner.lock().unwrap().allowance)
    }

    async fn balance(&self, _identity: &Identity) -> Result<Amount, LedgerError> {
        self.record_read()?;
        Ok(self.inner.lock().unwrap().balance)
    }

    async fn submit_approve(
        &self,
        _identity: &Identity,
        amount: Amount,
    ) -> Result<SettlementHandle, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.submit_calls += 1;
        match inner.approve_outcomes.pop_front() {
            Some(Err(e)) => Err(e),
            _ => {
                // Mirror what settlement of a real approve would do.
                inner.allowance = amount;
                Ok(SettlementHandle(format!("approve-{}", inner.submit_calls)))
            }
        }
    }

    async fn submit_deposit(
        &self,
        _identity: &Identity,
    ) -> Result<SettlementHandle, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.submit_calls += 1;
        match inner.deposit_outcomes.pop_front() {
            Some(Err(e)) => Err(e),
            _ => {
                inner.has_committed = true;
                Ok(SettlementHandle(format!("deposit-{}", inner.submit_calls)))
            }
        }
    }

    async fn await_settlement(&self, _handle: &SettlementHandle) -> Result<(), LedgerError> {
        Ok(())
    }
}
