//! Core identifiers, fixed-point money, and durable entities.
//!
//! All monetary values are fixed-point integers in hundredths of a unit.
//! Floating point never touches a balance; the ledger invariant
//! (balance == sum of signed deltas) is only checkable with exact integers.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = u64;
pub type RoundNo = u64;
pub type WagerId = u64;

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Calendar-day key (UTC, `yyyymmdd`) for daily wagering counters.
pub fn day_key(at_ms: u64) -> u32 {
    use chrono::Datelike;
    let date = Utc
        .timestamp_millis_opt(at_ms as i64)
        .single()
        .map(|dt| dt.date_naive())
        .unwrap_or_default();
    date.year() as u32 * 10_000 + date.month() * 100 + date.day()
}

// =============================================================================
// FIXED-POINT MONEY AND MULTIPLIER
// =============================================================================

/// Currency amount in hundredths (minor units). `Money(150)` is 1.50.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_hundredths(h: i64) -> Self {
        Money(h)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0))
    }

    /// `stake × multiplier`, truncated to the hundredth.
    pub fn times(self, m: Multiplier) -> Money {
        Money(((self.0 as i128 * m.hundredths() as i128) / 100) as i64)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}

/// Game multiplier in hundredths. `Multiplier(245)` is 2.45x; 1.00x is the floor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Multiplier(u64);

impl Multiplier {
    pub const ONE: Multiplier = Multiplier(100);

    pub const fn from_hundredths(h: u64) -> Self {
        Multiplier(h)
    }

    pub const fn hundredths(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Live client identity. Guests are process-local and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientId {
    User(UserId),
    Guest(u64),
}

impl ClientId {
    pub fn user_id(self) -> Option<UserId> {
        match self {
            ClientId::User(id) => Some(id),
            ClientId::Guest(_) => None,
        }
    }

    pub fn is_guest(self) -> bool {
        matches!(self, ClientId::Guest(_))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::User(id) => write!(f, "u{}", id),
            ClientId::Guest(id) => write!(f, "g{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Player,
    Admin,
}

// =============================================================================
// DURABLE ENTITIES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoundStatus {
    Betting,
    Running,
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WagerStatus {
    Active,
    CashedOut,
    Lost,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    Deposit,
    Withdrawal,
    BetPlaced,
    BetWon,
    BetLost,
    FarmingClaim,
    Adjustment,
}

/// Aggregate per-user counters.
///
/// `total_won` accumulates net winnings (payout minus returned stake) and
/// `total_lost` accumulates lost stakes, so `net_profit = total_won - total_lost`
/// is a meaningful signed quantity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub total_wagered: Money,
    pub total_won: Money,
    pub total_lost: Money,
    pub games_played: u64,
    pub biggest_win: Money,
    pub biggest_loss: Money,
}

impl UserStats {
    pub fn net_profit(&self) -> i64 {
        self.total_won.hundredths() - self.total_lost.hundredths()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Messaging-platform identity, when the account came through platform auth.
    pub external_id: Option<String>,
    pub handle: String,
    pub role: Role,
    pub balance: Money,
    pub stats: UserStats,
    /// Count of wagers that ended CASHED_OUT; with `stats.games_played` this
    /// yields the leaderboard win rate.
    pub wins: u64,
    pub experience: u64,
    pub level: u32,
    pub active: bool,
    pub password_hash: Option<String>,
    /// Last farming claim, unix ms. Zero means never claimed.
    pub farming_last_claim: u64,
    pub created_at: u64,
    pub last_login: u64,
}

impl User {
    /// Level is a pure function of experience.
    pub fn level_for(xp: u64) -> u32 {
        1 + (xp / 1_000) as u32
    }

    pub fn win_rate_pct(&self) -> u32 {
        if self.stats.games_played == 0 {
            0
        } else {
            ((self.wins * 100) / self.stats.games_played) as u32
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub number: RoundNo,
    /// Private until the round ends plus the reveal grace period.
    pub server_seed: [u8; 32],
    /// Public commitment, published at creation.
    pub server_seed_hash: [u8; 32],
    pub client_seed: String,
    pub nonce: u64,
    pub crash_point: Multiplier,
    pub status: RoundStatus,
    pub started_at: u64,
    pub ended_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: WagerId,
    pub user_id: UserId,
    pub round: RoundNo,
    pub stake: Money,
    pub auto_cashout: Option<Multiplier>,
    pub cashout: Option<Multiplier>,
    pub payout: Option<Money>,
    pub status: WagerStatus,
    pub placed_at: u64,
    pub cashed_out_at: Option<u64>,
}

/// Append-only balance audit record. `balance_after - balance_before` is the
/// signed delta; the sum of deltas over a user's entries equals the balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub user_id: UserId,
    pub wager_id: Option<WagerId>,
    pub kind: LedgerKind,
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub note: String,
    pub created_at: u64,
}

impl LedgerEntry {
    pub fn signed_delta(&self) -> i64 {
        self.balance_after.hundredths() - self.balance_before.hundredths()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSettings {
    pub auto_cashout_enabled: bool,
    pub auto_cashout: Multiplier,
    pub sound_enabled: bool,
    pub daily_limits_enabled: bool,
    pub max_daily_wager: Money,
    pub max_daily_loss: Money,
    pub max_games_per_day: u32,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            auto_cashout_enabled: false,
            auto_cashout: Multiplier::from_hundredths(200),
            sound_enabled: true,
            daily_limits_enabled: false,
            max_daily_wager: Money::from_hundredths(100_000),
            max_daily_loss: Money::from_hundredths(50_000),
            max_games_per_day: 500,
        }
    }
}

/// Per-user per-day wagering counters, upserted on placement and settlement.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DailyCounter {
    pub wagered: Money,
    pub lost: Money,
    pub games: u32,
}
