//! Fan-out of engine state to every session.
//!
//! Two frames per engine event: the public frame, serialized once and shared,
//! and a per-session personal overlay. Delivery is best-effort, at most once
//! per tick: a full buffer drops the tick for that session, except terminal
//! frames (betting-start, crash), which are pushed through off the engine's
//! task so no client misses a phase edge.

use crate::engine::LiveWager;
use crate::net::frames::{PublicState, ServerMessage};
use crate::net::session::{SessionFrame, SessionRegistry, SessionView};
use crate::types::ClientId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// How long a terminal frame may wait on a slow consumer before the session
/// is given up on for that frame.
const TERMINAL_SEND_TIMEOUT_SECS: u64 = 5;

pub struct BroadcastFabric {
    registry: Arc<SessionRegistry>,
}

impl BroadcastFabric {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Publish one engine event to every session.
    pub fn publish(
        &self,
        state: PublicState,
        live: &HashMap<ClientId, LiveWager>,
        terminal: bool,
    ) {
        let public = ServerMessage::GameState { state }.to_json();

        for view in self.registry.snapshot() {
            deliver(&view, SessionFrame::Text(public.clone()), terminal);

            let overlay = overlay_for(&view, live.get(&view.client)).to_json();
            deliver(&view, SessionFrame::Text(overlay), terminal);
        }
    }

    /// Direct frame to one session (acknowledgements, errors, notices).
    pub fn send_to(&self, client: ClientId, msg: &ServerMessage) {
        if let Some(view) = self.registry.view(client) {
            deliver(&view, SessionFrame::Text(msg.to_json()), false);
        }
    }
}

fn overlay_for(view: &SessionView, wager: Option<&LiveWager>) -> ServerMessage {
    match wager {
        Some(w) => ServerMessage::PlayerOverlay {
            has_wager: true,
            stake: Some(w.stake),
            auto_cashout: w.auto_cashout,
            cashed_out: w.cashout,
            payout: w.payout,
            balance: view.balance,
            authenticated: view.authenticated,
        },
        None => ServerMessage::PlayerOverlay {
            has_wager: false,
            stake: None,
            auto_cashout: None,
            cashed_out: None,
            payout: None,
            balance: view.balance,
            authenticated: view.authenticated,
        },
    }
}

fn deliver(view: &SessionView, frame: SessionFrame, terminal: bool) {
    match view.outbound.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(frame)) if terminal => {
            // Phase edges must land even on a briefly stalled consumer.
            let tx = view.outbound.clone();
            let client = view.client;
            tokio::spawn(async move {
                let sent = tokio::time::timeout(
                    Duration::from_secs(TERMINAL_SEND_TIMEOUT_SECS),
                    tx.send(frame),
                )
                .await;
                if sent.is_err() {
                    debug!("terminal frame timed out for {}", client);
                }
            });
        }
        Err(TrySendError::Full(_)) => {
            debug!("dropping tick for {}", view.client);
        }
        Err(TrySendError::Closed(_)) => {}
    }
}
