//! Session binding between the wallet session provider and the engine.
//!
//! The engine does not manage identity or network itself; it reacts to the
//! session provider's notifications. This module defines the session event
//! contract and the binding loop that translates connect, disconnect,
//! identity and network changes into engine start/stop calls. The rules are
//! mechanical: an identity on the required chain runs the engine, anything
//! else stops it, and every change of identity or chain goes through a full
//! stop-and-reset so nothing carries over between sessions.

use crate::engine::CommitmentEngine;
use crate::ledger::{ChainId, Identity};

use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Notifications emitted by the wallet session provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A wallet connected with the given identity on the given chain.
    Connected { identity: Identity, chain: ChainId },
    /// The active identity changed without a disconnect.
    IdentityChanged(Identity),
    /// The active network changed without a disconnect.
    NetworkChanged(ChainId),
    /// The wallet disconnected.
    Disconnected,
}

/// Source of the active identity and network.
///
/// Implementations wrap whatever wallet integration the host application
/// uses; the engine only consumes the event stream.
pub trait SessionProvider {
    /// The stream of session change notifications, starting with the current
    /// session state if one exists.
    fn events(&self) -> std::pin::Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;
}

/// Drive the engine's lifecycle from a stream of session events.
///
/// Runs until the stream ends, then stops the engine.
pub async fn bind_session(
    engine: Arc<CommitmentEngine>,
    mut events: impl Stream<Item = SessionEvent> + Unpin,
) {
    let mut identity: Option<Identity> = None;
    let mut chain: Option<ChainId> = None;

    while let Some(event) = events.next().await {
        debug!("Session event: {:?}", event);

        match event {
            SessionEvent::Connected {
                identity: new_identity,
                chain: new_chain,
            } => {
                identity = Some(new_identity);
                chain = Some(new_chain);
            }
            SessionEvent::IdentityChanged(new_identity) => {
                identity = Some(new_identity);
            }
            SessionEvent::NetworkChanged(new_chain) => {
                chain = Some(new_chain);
            }
            SessionEvent::Disconnected => {
                identity = None;
                chain = None;
            }
        }

        match (&identity, chain) {
            (Some(identity), Some(chain)) => {
                // The engine itself suspends on a chain mismatch.
                engine.start(identity.clone(), chain);
            }
            _ => {
                info!("No active session, stopping engine");
                engine.stop();
            }
        }
    }

    engine.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::testing::MockLedger;
    use crate::engine::{ApprovalState, EngineSnapshot};
    use futures_util::stream;
    use std::time::Duration;
    use tokio::time::Instant;

    fn config() -> EngineConfig {
        EngineConfig {
            gateway_url: "http://localhost:8545".to_string(),
            contract_address: "0xabc123".to_string(),
            token_address: "0xdef456".to_string(),
            required_chain: ChainId(1),
            poll_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            max_retry_attempts: 3,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(300);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// A binder over the given events that then stays idle instead of ending
    /// (ending the stream stops the engine by design).
    fn spawn_binder(engine: Arc<CommitmentEngine>, events: Vec<SessionEvent>) {
        let events = Box::pin(stream::iter(events).chain(stream::pending()));
        tokio::spawn(bind_session(engine, events));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_starts_and_disconnect_resets() {
        let ledger = Arc::new(MockLedger::with_fact(150, 200, 500));
        let engine = Arc::new(CommitmentEngine::new(&config(), ledger.clone()).unwrap());

        spawn_binder(
            engine.clone(),
            vec![SessionEvent::Connected {
                identity: Identity::from("0xaaa"),
                chain: ChainId(1),
            }],
        );
        wait_for(|| engine.snapshot().approval == ApprovalState::Approved).await;

        // A stream that ends behaves like a provider going away: full stop.
        bind_session(engine.clone(), stream::iter(vec![SessionEvent::Disconnected])).await;

        assert_eq!(engine.snapshot(), EngineSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn network_mismatch_keeps_engine_suspended() {
        let ledger = Arc::new(MockLedger::with_fact(150, 200, 500));
        let engine = Arc::new(CommitmentEngine::new(&config(), ledger.clone()).unwrap());

        spawn_binder(
            engine.clone(),
            vec![SessionEvent::Connected {
                identity: Identity::from("0xaaa"),
                chain: ChainId(42),
            }],
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ledger.read_calls(), 0);

        // Switching to the required chain brings the engine up.
        spawn_binder(
            engine.clone(),
            vec![
                SessionEvent::Connected {
                    identity: Identity::from("0xaaa"),
                    chain: ChainId(42),
                },
                SessionEvent::NetworkChanged(ChainId(1)),
            ],
        );
        wait_for(|| ledger.read_calls() > 0).await;

        engine.stop();
    }
}
