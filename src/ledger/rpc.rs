//!
//! JSON-RPC client for the commitment gateway.
//!
//! This module provides an async client for the HTTP gateway that fronts the
//! commitment contract. It executes read calls (balance, allowance, required
//! amount, has-committed flag), submits signed state-changing calls, and polls
//! for settlement receipts. Transient HTTP failures on read calls are retried
//! with exponential backoff before being surfaced to the engine, which applies
//! its own recovery policy on top.

use crate::ledger::client::LedgerClient;
use crate::ledger::types::{Amount, Identity, LedgerError, SettlementHandle};

use backoff::{ExponentialBackoff, future::retry};
use rand::Rng;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, error, info};

/// How often to poll the gateway for a settlement receipt.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Commitment gateway JSON-RPC client
#[derive(Clone)]
pub struct RpcLedgerClient {
    /// The underlying HTTP client for RPC calls.
    http_client: Client,
    /// The base URL of the gateway RPC endpoint.
    gateway_url: String,
    /// Address of the commitment contract on the active chain.
    contract_address: String,
    /// Address of the token whose allowance and balance are read.
    token_address: String,
}

impl RpcLedgerClient {
    /// Create a new gateway client.
    ///
    /// # Arguments
    /// * `gateway_url` - The HTTP endpoint of the commitment gateway.
    /// * `contract_address` - The commitment contract address.
    /// * `token_address` - The token contract address.
    pub fn new(gateway_url: String, contract_address: String, token_address: String) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            gateway_url,
            contract_address,
            token_address,
        }
    }

    /// Execute a single JSON-RPC call against the gateway.
    ///
    /// # Arguments
    /// * `method` - The RPC method name.
    /// * `params` - The positional parameters for the call.
    ///
    /// # Returns
    /// The `result` field of the RPC response, or a `LedgerError` if the
    /// request fails or the gateway returns a structured error object.
    async fn execute_call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let request_id: u64 = rand::rng().random();
        let request_body = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params
        });

        debug!("Executing gateway call: {}", method);

        let response = self
            .http_client
            .post(&self.gateway_url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LedgerError::Rejected {
                code: Some(response.status().as_u16() as i64),
                message: format!("HTTP error: {}", response.status()),
            });
        }

        let response_json: Value = response.json().await?;

        if let Some(error_obj) = response_json.get("error") {
            let code = error_obj.get("code").and_then(|c| c.as_i64());
            let message = error_obj
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown gateway error")
                .to_string();
            error!("Gateway call {} failed: {} (code {:?})", method, message, code);
            return Err(LedgerError::Rejected { code, message });
        }

        response_json
            .get("result")
            .cloned()
            .ok_or(LedgerError::NoData)
    }

    /// Execute a read call, retrying transient HTTP failures with backoff.
    ///
    /// Structured gateway rejections are permanent and surfaced immediately;
    /// connection-level failures are retried before the engine sees them.
    async fn execute_read(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        retry(ExponentialBackoff::default(), || async {
            self.execute_call(method, params.clone())
                .await
                .map_err(|e| match e {
                    LedgerError::HttpError(inner) => {
                        debug!("Transient gateway error on {}: {}", method, inner);
                        backoff::Error::transient(LedgerError::HttpError(inner))
                    }
                    other => backoff::Error::permanent(other),
                })
        })
        .await
    }

    /// Parse an amount encoded as a decimal string in an RPC result.
    fn parse_amount(result: &Value) -> Result<Amount, LedgerError> {
        result
            .as_str()
            .and_then(|s| s.parse::<Amount>().ok())
            .ok_or(LedgerError::NoData)
    }
}

#[async_trait::async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn has_committed(&self, identity: &Identity) -> Result<bool, LedgerError> {
        let result = self
            .execute_read(
                "commitment_hasCommitted",
                json!([self.contract_address, identity.as_str()]),
            )
            .await?;

        result.as_bool().ok_or(LedgerError::NoData)
    }

    async fn required_amount(&self) -> Result<Amount, LedgerError> {
        let result = self
            .execute_read("commitment_requiredAmount", json!([self.contract_address]))
            .await?;

        Self::parse_amount(&result)
    }

    async fn allowance(&self, identity: &Identity) -> Result<Amount, LedgerError> {
        let result = self
            .execute_read(
                "token_allowance",
                json!([self.token_address, identity.as_str(), self.contract_address]),
            )
            .await?;

        Self::parse_amount(&result)
    }

    async fn balance(&self, identity: &Identity) -> Result<Amount, LedgerError> {
        let result = self
            .execute_read(
                "token_balanceOf",
                json!([self.token_address, identity.as_str()]),
            )
            .await?;

        Self::parse_amount(&result)
    }

    async fn submit_approve(
        &self,
        identity: &Identity,
        amount: Amount,
    ) -> Result<SettlementHandle, LedgerError> {
        info!(
            "Submitting approve for {} with amount {}",
            identity, amount
        );

        let result = self
            .execute_call(
                "commitment_submitApprove",
                json!([
                    self.token_address,
                    self.contract_address,
                    identity.as_str(),
                    amount.to_string()
                ]),
            )
            .await?;

        let tx_hash = result.as_str().ok_or(LedgerError::NoData)?.to_string();
        info!("Approve submitted, settlement handle: {}", tx_hash);
        Ok(SettlementHandle(tx_hash))
    }

    async fn submit_deposit(
        &self,
        identity: &Identity,
    ) -> Result<SettlementHandle, LedgerError> {
        info!("Submitting deposit for {}", identity);

        let result = self
            .execute_call(
                "commitment_submitDeposit",
                json!([self.contract_address, identity.as_str()]),
            )
            .await?;

        let tx_hash = result.as_str().ok_or(LedgerError::NoData)?.to_string();
        info!("Deposit submitted, settlement handle: {}", tx_hash);
        Ok(SettlementHandle(tx_hash))
    }

    async fn await_settlement(&self, handle: &SettlementHandle) -> Result<(), LedgerError> {
        debug!("Awaiting settlement for {}", handle.as_str());

        // Poll the gateway for a receipt until the call reaches a terminal
        // status. No timeout here; the caller stays cancellable at each await.
        loop {
            let result = self
                .execute_read("commitment_getReceipt", json!([handle.as_str()]))
                .await?;

            match result.get("status").and_then(|s| s.as_str()) {
                Some("success") => {
                    info!("Settlement succeeded for {}", handle.as_str());
                    return Ok(());
                }
                Some("failed") => {
                    let reason = result
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("execution reverted")
                        .to_string();
                    error!("Settlement failed for {}: {}", handle.as_str(), reason);
                    return Err(LedgerError::SettlementFailed(reason));
                }
                Some("pending") | None => {
                    tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                }
                Some(other) => {
                    return Err(LedgerError::SettlementFailed(format!(
                        "Unknown settlement status: {}",
                        other
                    )));
                }
            }
        }
    }
}
