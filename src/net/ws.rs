//! Websocket attach and the per-connection read/write loops.
//!
//! Each connection is its own pair of tasks: the reader validates and
//! forwards actions to the engine mailbox, the writer drains the session's
//! bounded outbound buffer. The engine never touches a socket. Handshake
//! authentication accepts a `token` query parameter, an `Authorization`
//! bearer header, or a `bearer.<token>` subprotocol; anonymous callers get a
//! guest session with a virtual balance.

use crate::api::AppState;
use crate::error::Error;
use crate::net::frames::{
    parse_client, ClientMessage, ServerMessage, HEARTBEAT_MISSES, HEARTBEAT_SECS,
};
use crate::net::rate_limit::{InboundDecision, SessionInboundLimiter};
use crate::net::session::{SessionFrame, SESSION_BUFFER};
use crate::types::{now_ms, ClientId, Role};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let (token, subprotocol) = extract_token(&params, &headers);
    let identity = state.auth.resolve_optional(token.as_deref(), now_ms());

    let ws = match subprotocol {
        Some(proto) => ws.protocols([proto]),
        None => ws,
    };
    ws.on_upgrade(move |socket| handle_socket(state, socket, identity.map(|a| (a.id, a.role))))
}

/// Token from query parameter, bearer header, or `bearer.<token>`
/// subprotocol, in that order. Returns the subprotocol to echo, if used.
fn extract_token(
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> (Option<String>, Option<String>) {
    if let Some(token) = params.get("token") {
        return (Some(token.clone()), None);
    }

    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return (Some(token.trim().to_string()), None);
        }
    }

    if let Some(protocols) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        for candidate in protocols.split(',') {
            let candidate = candidate.trim();
            if let Some(token) = candidate.strip_prefix("bearer.") {
                return (Some(token.to_string()), Some(candidate.to_string()));
            }
        }
    }

    (None, None)
}

async fn handle_socket(state: AppState, socket: WebSocket, identity: Option<(u64, Role)>) {
    let (client, role, authenticated, balance) = match identity {
        Some((user_id, role)) => {
            let balance = state
                .store
                .find_user(user_id)
                .ok()
                .flatten()
                .map(|u| u.balance)
                .unwrap_or(state.cfg.game.default_balance);
            (ClientId::User(user_id), role, true, balance)
        }
        None => (
            state.registry.next_guest(),
            Role::Player,
            false,
            state.cfg.game.default_balance,
        ),
    };

    let (tx, mut rx) = mpsc::channel::<SessionFrame>(SESSION_BUFFER);
    let outcome = state
        .registry
        .attach(client, role, authenticated, balance, tx.clone());
    if let Some(old) = outcome.replaced {
        // The newer connection wins; the older socket is closed politely.
        let _ = old.try_send(SessionFrame::Close);
    }
    info!("session attached: {client} (authenticated={authenticated})");

    if let Ok(snapshot) = state.engine.snapshot().await {
        let hello = ServerMessage::Connected {
            client_id: client.to_string(),
            authenticated,
            balance,
            state: snapshot,
        };
        let _ = tx.send(SessionFrame::Text(hello.to_json())).await;
    }

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let out = match frame {
                SessionFrame::Text(text) => Message::Text(text),
                SessionFrame::Ping => Message::Ping(Vec::new()),
                SessionFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(out).await.is_err() {
                break;
            }
        }
    });

    let mut limiter = SessionInboundLimiter::new(state.cfg.rate.socket_msgs_per_sec);
    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // first tick is immediate
    let mut pings_unanswered = 0u32;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if pings_unanswered >= HEARTBEAT_MISSES {
                    warn!("heartbeat lost for {client}");
                    break;
                }
                pings_unanswered += 1;
                if tx.send(SessionFrame::Ping).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                None | Some(Err(_)) => break,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Pong(_))) => {
                    pings_unanswered = 0;
                    state.registry.touch(client);
                }
                Some(Ok(Message::Ping(_))) => {
                    // Transport pongs are handled below the frame layer.
                }
                Some(Ok(Message::Binary(_))) => {
                    send_error(&tx, &Error::InvalidArgument("text frames only".into())).await;
                }
                Some(Ok(Message::Text(text))) => {
                    state.registry.touch(client);
                    match limiter.check() {
                        InboundDecision::Admit => {
                            handle_text(&state, client, &text, &tx).await;
                        }
                        InboundDecision::Drop { notify } => {
                            if notify {
                                let msg = ServerMessage::Warning {
                                    code: "RATE_LIMITED".to_string(),
                                    message: "slow down, messages are being dropped".to_string(),
                                };
                                let _ = tx.try_send(SessionFrame::Text(msg.to_json()));
                            }
                        }
                    }
                }
            }
        }
    }

    state.registry.detach(client, outcome.conn_seq);
    let _ = tx.try_send(SessionFrame::Close);
    drop(tx);
    let _ = writer.await;
    info!("session detached: {client}");
}

async fn handle_text(
    state: &AppState,
    client: ClientId,
    text: &str,
    tx: &mpsc::Sender<SessionFrame>,
) {
    let msg = match parse_client(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("bad frame from {client}: {e}");
            send_error(tx, &e).await;
            return;
        }
    };

    match msg {
        ClientMessage::Ping => {}
        ClientMessage::Bet {
            amount,
            auto_cashout,
        } => match state.engine.place_bet(client, amount, auto_cashout).await {
            Ok(ack) => {
                let frame = ServerMessage::BetPlaced {
                    round: ack.round,
                    stake: ack.stake,
                    auto_cashout: ack.auto_cashout,
                    balance: ack.balance,
                };
                let _ = tx.send(SessionFrame::Text(frame.to_json())).await;
            }
            Err(e) => send_error(tx, &e).await,
        },
        ClientMessage::CashOut => match state.engine.cash_out(client).await {
            Ok(ack) => {
                let frame = ServerMessage::CashedOut {
                    round: ack.round,
                    multiplier: ack.multiplier,
                    payout: ack.payout,
                    balance: ack.balance,
                };
                let _ = tx.send(SessionFrame::Text(frame.to_json())).await;
            }
            Err(e) => send_error(tx, &e).await,
        },
    }
}

async fn send_error(tx: &mpsc::Sender<SessionFrame>, e: &Error) {
    let _ = tx
        .send(SessionFrame::Text(ServerMessage::from_error(e).to_json()))
        .await;
}
