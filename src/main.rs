mod config;
mod engine;
mod ledger;
mod session;

use crate::config::EngineConfig;
use crate::engine::CommitmentEngine;
use crate::ledger::{ChainId, Identity, RpcLedgerClient};
use crate::session::{SessionEvent, SessionProvider, bind_session};

use futures_util::{Stream, StreamExt, stream};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info};

/// Session provider for headless runs: one identity from the environment,
/// connected once at startup.
struct EnvSession {
    identity: Identity,
    chain: ChainId,
}

impl SessionProvider for EnvSession {
    fn events(&self) -> Pin<Box<dyn Stream<Item = SessionEvent> + Send>> {
        let connected = SessionEvent::Connected {
            identity: self.identity.clone(),
            chain: self.chain,
        };
        Box::pin(stream::iter(vec![connected]).chain(stream::pending()))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::time())
        .init();

    info!("Starting commitment engine");

    // Configuration problems are fatal: never start into a broken state.
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    let identity = match std::env::var("COMMITMENT_IDENTITY") {
        Ok(address) if !address.trim().is_empty() => Identity(address),
        _ => {
            error!("COMMITMENT_IDENTITY must be set to the active address");
            return;
        }
    };

    let ledger = Arc::new(RpcLedgerClient::new(
        config.gateway_url.clone(),
        config.contract_address.clone(),
        config.token_address.clone(),
    ));

    info!("Created gateway client for {}", config.gateway_url);

    let engine = match CommitmentEngine::new(&config, ledger) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Failed to start commitment engine: {:?}", e);
            return;
        }
    };

    let provider = EnvSession {
        identity,
        chain: config.required_chain,
    };
    tokio::spawn(bind_session(engine.clone(), provider.events()));

    info!("Created commitment engine, watching status");

    // Log every published snapshot until the process is terminated.
    let mut snapshots = engine.subscribe();
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        info!(
            "approval={:?} deposit={:?} committed={} retry_attempt={}",
            snapshot.approval,
            snapshot.deposit,
            snapshot
                .commitment
                .as_ref()
                .map(|f| f.has_committed)
                .unwrap_or(false),
            snapshot.retry.attempt
        );
        if let Some(error) = &snapshot.error {
            error!("{:?} ({:?}): {}", error.kind, error.source, error.message);
        }
    }
}
