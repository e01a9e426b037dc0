//! Ledger gateway integration module
//!
//! This module provides the client contract and types for interacting with the
//! remote ledger that holds the commitment contract. The engine depends only on
//! the `LedgerClient` trait; the JSON-RPC gateway implementation lives here as
//! the production binding.

/// Ledger client contract consumed by the engine
mod client;
/// JSON-RPC gateway implementation of the ledger client
mod rpc;
/// Type definitions for ledger data and errors
mod types;

pub use client::LedgerClient;
pub use rpc::RpcLedgerClient;
pub use types::*;
