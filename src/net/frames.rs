//! Wire protocol frames.
//!
//! JSON text over the socket, schema-validated before any side effect: an
//! unknown `type` or a mistyped field is a rejection, never a coercion.
//! Monetary fields are integer hundredths, multipliers likewise
//! (`"multiplier": 245` is 2.45x).

use crate::error::Error;
use crate::types::{Money, Multiplier, RoundNo};
use serde::{Deserialize, Serialize};

/// Upper bound on an inbound text frame. A bet is under 100 bytes.
pub const MAX_INBOUND_FRAME: usize = 4 * 1024;

/// Heartbeat ping cadence, and the pong tolerance in missed beats.
pub const HEARTBEAT_SECS: u64 = 15;
pub const HEARTBEAT_MISSES: u32 = 2;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Bet {
        amount: Money,
        #[serde(default)]
        auto_cashout: Option<Multiplier>,
    },
    CashOut,
    Ping,
}

impl ClientMessage {
    pub fn command(&self) -> &'static str {
        match self {
            ClientMessage::Bet { .. } => "bet",
            ClientMessage::CashOut => "cashOut",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Parse and validate one inbound frame.
pub fn parse_client(text: &str) -> Result<ClientMessage, Error> {
    if text.len() > MAX_INBOUND_FRAME {
        return Err(Error::InvalidArgument("frame too large".into()));
    }
    serde_json::from_str(text).map_err(|e| Error::InvalidArgument(format!("bad frame: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Betting,
    Running,
    Crashed,
    Paused,
}

/// Shared round state, serialized once per engine event and fanned out to
/// every session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicState {
    pub phase: PhaseName,
    pub round: RoundNo,
    pub multiplier: Multiplier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<u32>,
    pub players: u32,
    pub recent_crashes: Vec<Multiplier>,
    /// Hex commitment for the current round; the seed itself stays private
    /// until the round ends plus the reveal grace.
    pub server_seed_hash: String,
    pub maintenance: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        client_id: String,
        authenticated: bool,
        balance: Money,
        state: PublicState,
    },
    #[serde(rename_all = "camelCase")]
    GameState {
        #[serde(flatten)]
        state: PublicState,
    },
    #[serde(rename_all = "camelCase")]
    PlayerOverlay {
        has_wager: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        stake: Option<Money>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_cashout: Option<Multiplier>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cashed_out: Option<Multiplier>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payout: Option<Money>,
        balance: Money,
        authenticated: bool,
    },
    #[serde(rename_all = "camelCase")]
    BetPlaced {
        round: RoundNo,
        stake: Money,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_cashout: Option<Multiplier>,
        balance: Money,
    },
    #[serde(rename_all = "camelCase")]
    CashedOut {
        round: RoundNo,
        multiplier: Multiplier,
        payout: Money,
        balance: Money,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Warning { code: String, message: String },
}

impl ServerMessage {
    pub fn command(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::GameState { .. } => "gameState",
            ServerMessage::PlayerOverlay { .. } => "playerOverlay",
            ServerMessage::BetPlaced { .. } => "betPlaced",
            ServerMessage::CashedOut { .. } => "cashedOut",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Warning { .. } => "warning",
        }
    }

    pub fn from_error(e: &Error) -> Self {
        let retry_after_secs = match e {
            Error::ResourceExhausted { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        ServerMessage::Error {
            code: e.code().to_string(),
            message: e.client_message(),
            retry_after_secs,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","code":"INTERNAL","message":"internal error"}"#.to_string())
    }
}
