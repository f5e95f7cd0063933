//! Durable state over sled.
//!
//! One keyspace, prefixed by record kind, so every mutating operation runs as
//! a single sled transaction: a balance never changes without its ledger row
//! committing in the same atomic step. Values are bincode; bincode is for
//! local storage only, never the wire.
//!
//! Key layout (integers big-endian so prefix scans come back ordered):
//!
//! | Prefix  | Key tail                  | Value          |
//! |---------|---------------------------|----------------|
//! | `u:`    | user id                   | `User`         |
//! | `xi:`   | external id bytes         | user id        |
//! | `hi:`   | handle bytes              | user id        |
//! | `r:`    | round number              | `Round`        |
//! | `w:`    | wager id                  | `Wager`        |
//! | `rw:`   | round number ∥ user id    | wager id       |
//! | `dl:`   | user id ∥ day (yyyymmdd)  | `DailyCounter` |
//! | `le:`   | user id ∥ entry id        | `LedgerEntry`  |
//! | `m:`    | counter name              | u64            |

use crate::error::{Error, Result};
use crate::fair::RoundFairness;
use crate::types::{
    day_key, DailyCounter, LedgerEntry, LedgerKind, Money, Multiplier, PlayerSettings, Role,
    Round, RoundNo, RoundStatus, User, UserId, UserStats, Wager, WagerId, WagerStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use std::path::Path;

const ROUND_SEQ: &[u8] = b"m:round_seq";

fn key_user(id: UserId) -> Vec<u8> {
    let mut k = b"u:".to_vec();
    k.extend_from_slice(&id.to_be_bytes());
    k
}

fn key_external(ext: &str) -> Vec<u8> {
    let mut k = b"xi:".to_vec();
    k.extend_from_slice(ext.as_bytes());
    k
}

fn key_handle(handle: &str) -> Vec<u8> {
    let mut k = b"hi:".to_vec();
    k.extend_from_slice(handle.as_bytes());
    k
}

fn key_round(number: RoundNo) -> Vec<u8> {
    let mut k = b"r:".to_vec();
    k.extend_from_slice(&number.to_be_bytes());
    k
}

fn key_wager(id: WagerId) -> Vec<u8> {
    let mut k = b"w:".to_vec();
    k.extend_from_slice(&id.to_be_bytes());
    k
}

fn key_round_wager(round: RoundNo, user: UserId) -> Vec<u8> {
    let mut k = b"rw:".to_vec();
    k.extend_from_slice(&round.to_be_bytes());
    k.extend_from_slice(&user.to_be_bytes());
    k
}

fn key_daily(user: UserId, day: u32) -> Vec<u8> {
    let mut k = b"dl:".to_vec();
    k.extend_from_slice(&user.to_be_bytes());
    k.extend_from_slice(&day.to_be_bytes());
    k
}

fn key_ledger(user: UserId, entry: u64) -> Vec<u8> {
    let mut k = b"le:".to_vec();
    k.extend_from_slice(&user.to_be_bytes());
    k.extend_from_slice(&entry.to_be_bytes());
    k
}

fn key_settings(user: UserId) -> Vec<u8> {
    let mut k = b"s:".to_vec();
    k.extend_from_slice(&user.to_be_bytes());
    k
}

fn enc<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn abort<T>(e: Error) -> ConflictableTransactionResult<T, Error> {
    Err(ConflictableTransactionError::Abort(e))
}

fn tx_get<T: DeserializeOwned>(
    tx: &TransactionalTree,
    key: &[u8],
) -> ConflictableTransactionResult<Option<T>, Error> {
    match tx.get(key)? {
        Some(iv) => match dec(&iv) {
            Ok(v) => Ok(Some(v)),
            Err(e) => abort(e),
        },
        None => Ok(None),
    }
}

fn tx_put<T: Serialize>(
    tx: &TransactionalTree,
    key: Vec<u8>,
    value: &T,
) -> ConflictableTransactionResult<(), Error> {
    match enc(value) {
        Ok(bytes) => {
            tx.insert(key, bytes)?;
            Ok(())
        }
        Err(e) => abort(e),
    }
}

fn unwrap_tx<T>(r: std::result::Result<T, TransactionError<Error>>) -> Result<T> {
    r.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => Error::from(e),
    })
}

/// Ledger write inside a transaction. Returns the entry for acknowledgement.
#[allow(clippy::too_many_arguments)]
fn tx_ledger(
    tx: &TransactionalTree,
    user: &User,
    wager_id: Option<WagerId>,
    kind: LedgerKind,
    amount: Money,
    balance_before: Money,
    note: &str,
    now: u64,
) -> ConflictableTransactionResult<LedgerEntry, Error> {
    let id = tx.generate_id()?;
    let entry = LedgerEntry {
        id,
        user_id: user.id,
        wager_id,
        kind,
        amount,
        balance_before,
        balance_after: user.balance,
        note: note.to_string(),
        created_at: now,
    };
    tx_put(tx, key_ledger(user.id, id), &entry)?;
    Ok(entry)
}

// =============================================================================
// PUBLIC SHAPES
// =============================================================================

#[derive(Debug, Clone)]
pub struct NewUser {
    pub external_id: Option<String>,
    pub handle: String,
    pub role: Role,
    pub password_hash: Option<String>,
    pub balance: Money,
}

#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub handle: Option<String>,
    pub role: Option<Role>,
    pub active: Option<bool>,
}

/// Allowlisted partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub auto_cashout_enabled: Option<bool>,
    pub auto_cashout: Option<Multiplier>,
    pub sound_enabled: Option<bool>,
    pub daily_limits_enabled: Option<bool>,
    pub max_daily_wager: Option<Money>,
    pub max_daily_loss: Option<Money>,
    pub max_games_per_day: Option<u32>,
}

/// Audit view of a finished round. The seed is withheld inside the reveal
/// grace period.
#[derive(Debug, Clone)]
pub struct FairRound {
    pub number: RoundNo,
    pub server_seed: Option<[u8; 32]>,
    pub server_seed_hash: [u8; 32],
    pub client_seed: String,
    pub nonce: u64,
    pub crash_point: Multiplier,
    pub ended_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderboardSort {
    Balance,
    TotalWon,
    WinRate,
    Level,
}

impl std::str::FromStr for LeaderboardSort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "balance" => Ok(Self::Balance),
            "totalWon" => Ok(Self::TotalWon),
            "winRate" => Ok(Self::WinRate),
            "level" => Ok(Self::Level),
            other => Err(Error::InvalidArgument(format!(
                "unknown leaderboard sort {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct AdminStats {
    pub users: u64,
    pub active_users: u64,
    pub rounds: u64,
    pub total_wagered: Money,
    pub total_won: Money,
    pub total_lost: Money,
}

// =============================================================================
// STORE
// =============================================================================

pub struct Store {
    #[allow(dead_code)]
    db: sled::Db,
    state: sled::Tree,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let state = db.open_tree("state")?;
        Ok(Self { db, state })
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    pub fn find_user(&self, id: UserId) -> Result<Option<User>> {
        match self.state.get(key_user(id))? {
            Some(iv) => Ok(Some(dec(&iv)?)),
            None => Ok(None),
        }
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.find_user(id)?
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    pub fn find_user_by_external_id(&self, ext: &str) -> Result<Option<User>> {
        match self.state.get(key_external(ext))? {
            Some(iv) => {
                let id = u64::from_be_bytes(iv.as_ref().try_into().map_err(|_| {
                    Error::internal("corrupt external-id index")
                })?);
                self.find_user(id)
            }
            None => Ok(None),
        }
    }

    pub fn find_user_by_handle(&self, handle: &str) -> Result<Option<User>> {
        match self.state.get(key_handle(handle))? {
            Some(iv) => {
                let id = u64::from_be_bytes(
                    iv.as_ref()
                        .try_into()
                        .map_err(|_| Error::internal("corrupt handle index"))?,
                );
                self.find_user(id)
            }
            None => Ok(None),
        }
    }

    /// Inserts the user row and its default settings row in one transaction.
    pub fn create_user(
        &self,
        new: NewUser,
        settings: PlayerSettings,
        now: u64,
    ) -> Result<User> {
        let r = self.state.transaction(
            |tx| -> ConflictableTransactionResult<User, Error> {
                if tx.get(key_handle(&new.handle))?.is_some() {
                    return abort(Error::AlreadyExists(format!("handle {:?}", new.handle)));
                }
                if let Some(ext) = &new.external_id {
                    if tx.get(key_external(ext))?.is_some() {
                        return abort(Error::AlreadyExists(format!("external id {ext:?}")));
                    }
                }

                let id = tx.generate_id()?;
                let user = User {
                    id,
                    external_id: new.external_id.clone(),
                    handle: new.handle.clone(),
                    role: new.role,
                    balance: new.balance,
                    stats: UserStats::default(),
                    wins: 0,
                    experience: 0,
                    level: 1,
                    active: true,
                    password_hash: new.password_hash.clone(),
                    farming_last_claim: 0,
                    created_at: now,
                    last_login: now,
                };

                tx_put(tx, key_user(id), &user)?;
                tx.insert(key_handle(&new.handle), id.to_be_bytes().to_vec())?;
                if let Some(ext) = &new.external_id {
                    tx.insert(key_external(ext), id.to_be_bytes().to_vec())?;
                }
                tx_put(tx, key_settings(id), &settings)?;
                // The opening balance is itself a ledger event, so the sum of
                // deltas always equals the balance.
                if new.balance.is_positive() {
                    tx_ledger(
                        tx,
                        &user,
                        None,
                        LedgerKind::Deposit,
                        new.balance,
                        Money::ZERO,
                        "opening balance",
                        now,
                    )?;
                }
                Ok(user)
            },
        );
        unwrap_tx(r)
    }

    /// Password login. The envelope is always `Result<User, Error>`; a bad
    /// handle and a bad password are indistinguishable to the caller.
    pub fn authenticate_user(&self, handle: &str, password: &str, now: u64) -> Result<User> {
        let user = self
            .find_user_by_handle(handle)?
            .ok_or(Error::Unauthenticated)?;
        let hash = user.password_hash.as_deref().ok_or(Error::Unauthenticated)?;
        if !crate::auth::verify_password(password, hash) {
            return Err(Error::Unauthenticated);
        }
        if !user.active {
            return Err(Error::PermissionDenied);
        }
        self.touch_last_login(user.id, now)
    }

    pub fn touch_last_login(&self, id: UserId, now: u64) -> Result<User> {
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<User, Error> {
                let mut user: User = match tx_get(tx, &key_user(id))? {
                    Some(u) => u,
                    None => return abort(Error::NotFound(format!("user {id}"))),
                };
                user.last_login = now;
                tx_put(tx, key_user(id), &user)?;
                Ok(user)
            });
        unwrap_tx(r)
    }

    pub fn update_user(&self, id: UserId, patch: UserPatch) -> Result<User> {
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<User, Error> {
                let mut user: User = match tx_get(tx, &key_user(id))? {
                    Some(u) => u,
                    None => return abort(Error::NotFound(format!("user {id}"))),
                };

                if let Some(handle) = &patch.handle {
                    if handle != &user.handle {
                        if tx.get(key_handle(handle))?.is_some() {
                            return abort(Error::AlreadyExists(format!("handle {handle:?}")));
                        }
                        tx.remove(key_handle(&user.handle))?;
                        tx.insert(key_handle(handle), id.to_be_bytes().to_vec())?;
                        user.handle = handle.clone();
                    }
                }
                if let Some(role) = patch.role {
                    user.role = role;
                }
                if let Some(active) = patch.active {
                    user.active = active;
                }

                tx_put(tx, key_user(id), &user)?;
                Ok(user)
            });
        unwrap_tx(r)
    }

    pub fn set_password_hash(&self, id: UserId, hash: String) -> Result<()> {
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<(), Error> {
                let mut user: User = match tx_get(tx, &key_user(id))? {
                    Some(u) => u,
                    None => return abort(Error::NotFound(format!("user {id}"))),
                };
                user.password_hash = Some(hash.clone());
                tx_put(tx, key_user(id), &user)?;
                Ok(())
            });
        unwrap_tx(r)
    }

    /// Signed balance change with its ledger row, atomically. Fails with
    /// `InsufficientFunds` if the result would be negative.
    pub fn adjust_balance(
        &self,
        id: UserId,
        delta_hundredths: i64,
        kind: LedgerKind,
        note: &str,
        now: u64,
    ) -> Result<User> {
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<User, Error> {
                let mut user: User = match tx_get(tx, &key_user(id))? {
                    Some(u) => u,
                    None => return abort(Error::NotFound(format!("user {id}"))),
                };
                let before = user.balance;
                let after = before.hundredths() + delta_hundredths;
                if after < 0 {
                    return abort(Error::InsufficientFunds);
                }
                user.balance = Money::from_hundredths(after);
                tx_put(tx, key_user(id), &user)?;
                tx_ledger(
                    tx,
                    &user,
                    None,
                    kind,
                    Money::from_hundredths(delta_hundredths.abs()),
                    before,
                    note,
                    now,
                )?;
                Ok(user)
            });
        unwrap_tx(r)
    }

    // -------------------------------------------------------------------------
    // Rounds
    // -------------------------------------------------------------------------

    /// Insert the next round in BETTING. Numbers come from a persisted
    /// counter, so they stay strictly increasing across restarts.
    pub fn create_round(&self, fair: &RoundFairness, now: u64) -> Result<Round> {
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<Round, Error> {
                let prev = match tx.get(ROUND_SEQ)? {
                    Some(iv) => u64::from_be_bytes(iv.as_ref().try_into().unwrap_or_default()),
                    None => 0,
                };
                let number = prev + 1;
                tx.insert(ROUND_SEQ, number.to_be_bytes().to_vec())?;

                let round = Round {
                    number,
                    server_seed: fair.server_seed,
                    server_seed_hash: fair.server_seed_hash,
                    client_seed: fair.client_seed.clone(),
                    nonce: fair.nonce,
                    crash_point: fair.crash_point,
                    status: RoundStatus::Betting,
                    started_at: now,
                    ended_at: None,
                };
                tx_put(tx, key_round(number), &round)?;
                Ok(round)
            });
        unwrap_tx(r)
    }

    pub fn get_round(&self, number: RoundNo) -> Result<Round> {
        match self.state.get(key_round(number))? {
            Some(iv) => Ok(dec(&iv)?),
            None => Err(Error::NotFound(format!("round {number}"))),
        }
    }

    /// Highest assigned round number; zero before the first round.
    pub fn last_round_number(&self) -> Result<RoundNo> {
        match self.state.get(ROUND_SEQ)? {
            Some(iv) => Ok(u64::from_be_bytes(
                iv.as_ref().try_into().unwrap_or_default(),
            )),
            None => Ok(0),
        }
    }

    pub fn update_round_status(
        &self,
        number: RoundNo,
        status: RoundStatus,
        ended_at: Option<u64>,
    ) -> Result<()> {
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<(), Error> {
                let mut round: Round = match tx_get(tx, &key_round(number))? {
                    Some(r) => r,
                    None => return abort(Error::NotFound(format!("round {number}"))),
                };
                round.status = status;
                if ended_at.is_some() {
                    round.ended_at = ended_at;
                }
                tx_put(tx, key_round(number), &round)?;
                Ok(())
            });
        unwrap_tx(r)
    }

    /// Close out rounds interrupted by a hard stop. Their wagers are
    /// refunded and cancelled, and the rounds marked CRASHED, so at most one
    /// live round ever exists even across restarts. Returns how many rounds
    /// were recovered.
    pub fn recover_stale_rounds(&self, now: u64) -> Result<u32> {
        let mut stale = Vec::new();
        for item in self.state.scan_prefix(b"r:") {
            let (_, iv) = item?;
            let round: Round = dec(&iv)?;
            if round.status != RoundStatus::Crashed {
                stale.push(round.number);
            }
        }
        for &number in &stale {
            self.cancel_active_wagers(number, now)?;
            self.update_round_status(number, RoundStatus::Crashed, Some(now))?;
        }
        Ok(stale.len() as u32)
    }

    // -------------------------------------------------------------------------
    // Wagers
    // -------------------------------------------------------------------------

    /// Admit a wager: phase, duplicate, balance, and daily-limit checks plus
    /// the debit, wager row, ledger row, and counter bump, in one transaction.
    pub fn place_wager(
        &self,
        user_id: UserId,
        round_no: RoundNo,
        stake: Money,
        auto_cashout: Option<Multiplier>,
        now: u64,
    ) -> Result<(Wager, User)> {
        let day = day_key(now);
        let r = self.state.transaction(
            |tx| -> ConflictableTransactionResult<(Wager, User), Error> {
                let round: Round = match tx_get(tx, &key_round(round_no))? {
                    Some(r) => r,
                    None => return abort(Error::NotFound(format!("round {round_no}"))),
                };
                if round.status != RoundStatus::Betting {
                    return abort(Error::FailedPrecondition(
                        "round is not accepting bets".into(),
                    ));
                }
                if tx.get(key_round_wager(round_no, user_id))?.is_some() {
                    return abort(Error::AlreadyExists("wager already placed".into()));
                }

                let mut user: User = match tx_get(tx, &key_user(user_id))? {
                    Some(u) => u,
                    None => return abort(Error::NotFound(format!("user {user_id}"))),
                };
                if !user.active {
                    return abort(Error::PermissionDenied);
                }
                if user.balance < stake {
                    return abort(Error::InsufficientFunds);
                }

                let settings: PlayerSettings =
                    tx_get(tx, &key_settings(user_id))?.unwrap_or_default();
                let mut daily: DailyCounter =
                    tx_get(tx, &key_daily(user_id, day))?.unwrap_or_default();
                if settings.daily_limits_enabled {
                    if daily.wagered.saturating_add(stake) > settings.max_daily_wager {
                        return abort(Error::DailyLimitExceeded);
                    }
                    if daily.lost >= settings.max_daily_loss {
                        return abort(Error::DailyLimitExceeded);
                    }
                    if daily.games + 1 > settings.max_games_per_day {
                        return abort(Error::DailyLimitExceeded);
                    }
                }

                let before = user.balance;
                user.balance = user.balance.saturating_sub(stake);
                user.stats.total_wagered = user.stats.total_wagered.saturating_add(stake);
                user.stats.games_played += 1;

                let wager_id = tx.generate_id()?;
                let wager = Wager {
                    id: wager_id,
                    user_id,
                    round: round_no,
                    stake,
                    auto_cashout,
                    cashout: None,
                    payout: None,
                    status: WagerStatus::Active,
                    placed_at: now,
                    cashed_out_at: None,
                };

                daily.wagered = daily.wagered.saturating_add(stake);
                daily.games += 1;

                tx_put(tx, key_user(user_id), &user)?;
                tx_put(tx, key_wager(wager_id), &wager)?;
                tx.insert(key_round_wager(round_no, user_id), wager_id.to_be_bytes().to_vec())?;
                tx_put(tx, key_daily(user_id, day), &daily)?;
                tx_ledger(
                    tx,
                    &user,
                    Some(wager_id),
                    LedgerKind::BetPlaced,
                    stake,
                    before,
                    &format!("bet on round {round_no}"),
                    now,
                )?;
                Ok((wager, user))
            },
        );
        unwrap_tx(r)
    }

    pub fn get_wager(&self, id: WagerId) -> Result<Wager> {
        match self.state.get(key_wager(id))? {
            Some(iv) => Ok(dec(&iv)?),
            None => Err(Error::NotFound(format!("wager {id}"))),
        }
    }

    pub fn find_wager_for(&self, round: RoundNo, user: UserId) -> Result<Option<Wager>> {
        match self.state.get(key_round_wager(round, user))? {
            Some(iv) => {
                let id = u64::from_be_bytes(
                    iv.as_ref()
                        .try_into()
                        .map_err(|_| Error::internal("corrupt round-wager index"))?,
                );
                Ok(Some(self.get_wager(id)?))
            }
            None => Ok(None),
        }
    }

    /// Settle a cashout: payout credit, terminal wager state, BET_WON ledger
    /// row, and counter bumps, in one transaction.
    pub fn cashout_wager(
        &self,
        wager_id: WagerId,
        multiplier: Multiplier,
        now: u64,
    ) -> Result<(Wager, User)> {
        let r = self.state.transaction(
            |tx| -> ConflictableTransactionResult<(Wager, User), Error> {
                let mut wager: Wager = match tx_get(tx, &key_wager(wager_id))? {
                    Some(w) => w,
                    None => return abort(Error::NotFound(format!("wager {wager_id}"))),
                };
                match wager.status {
                    WagerStatus::Active => {}
                    WagerStatus::CashedOut => {
                        return abort(Error::AlreadyExists("wager already cashed out".into()))
                    }
                    _ => {
                        return abort(Error::FailedPrecondition("wager is not active".into()))
                    }
                }

                let round: Round = match tx_get(tx, &key_round(wager.round))? {
                    Some(r) => r,
                    None => return abort(Error::NotFound(format!("round {}", wager.round))),
                };
                if round.status != RoundStatus::Running {
                    return abort(Error::FailedPrecondition("round is not running".into()));
                }

                let mut user: User = match tx_get(tx, &key_user(wager.user_id))? {
                    Some(u) => u,
                    None => return abort(Error::NotFound(format!("user {}", wager.user_id))),
                };

                let payout = wager.stake.times(multiplier);
                let net_win = payout.saturating_sub(wager.stake);
                let before = user.balance;

                user.balance = user.balance.saturating_add(payout);
                user.stats.total_won = user.stats.total_won.saturating_add(net_win);
                user.stats.biggest_win = user.stats.biggest_win.max(net_win);
                user.wins += 1;
                user.experience += (wager.stake.hundredths() / 100).max(0) as u64;
                user.level = User::level_for(user.experience);

                wager.status = WagerStatus::CashedOut;
                wager.cashout = Some(multiplier);
                wager.payout = Some(payout);
                wager.cashed_out_at = Some(now);

                tx_put(tx, key_user(user.id), &user)?;
                tx_put(tx, key_wager(wager_id), &wager)?;
                tx_ledger(
                    tx,
                    &user,
                    Some(wager_id),
                    LedgerKind::BetWon,
                    payout,
                    before,
                    &format!("cashout at {multiplier}"),
                    now,
                )?;
                Ok((wager, user))
            },
        );
        unwrap_tx(r)
    }

    /// Mark every still-active wager of the round LOST, with stats, ledger,
    /// and daily-loss bookkeeping. Returns how many wagers were settled.
    pub fn settle_crashed_round(&self, round_no: RoundNo, now: u64) -> Result<u32> {
        // Index scan happens outside the transaction; each wager is
        // re-checked inside so a concurrent cashout is never overwritten.
        let mut prefix = b"rw:".to_vec();
        prefix.extend_from_slice(&round_no.to_be_bytes());
        let mut wager_ids = Vec::new();
        for item in self.state.scan_prefix(&prefix) {
            let (_, iv) = item?;
            wager_ids.push(u64::from_be_bytes(
                iv.as_ref()
                    .try_into()
                    .map_err(|_| Error::internal("corrupt round-wager index"))?,
            ));
        }

        let day = day_key(now);
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<u32, Error> {
                let mut settled = 0u32;
                for &wager_id in &wager_ids {
                    let mut wager: Wager = match tx_get(tx, &key_wager(wager_id))? {
                        Some(w) => w,
                        None => continue,
                    };
                    if wager.status != WagerStatus::Active {
                        continue;
                    }

                    let mut user: User = match tx_get(tx, &key_user(wager.user_id))? {
                        Some(u) => u,
                        None => continue,
                    };
                    let before = user.balance;

                    user.stats.total_lost = user.stats.total_lost.saturating_add(wager.stake);
                    user.stats.biggest_loss = user.stats.biggest_loss.max(wager.stake);
                    user.experience += (wager.stake.hundredths() / 100).max(0) as u64;
                    user.level = User::level_for(user.experience);

                    wager.status = WagerStatus::Lost;

                    let mut daily: DailyCounter =
                        tx_get(tx, &key_daily(wager.user_id, day))?.unwrap_or_default();
                    daily.lost = daily.lost.saturating_add(wager.stake);

                    tx_put(tx, key_user(user.id), &user)?;
                    tx_put(tx, key_wager(wager_id), &wager)?;
                    tx_put(tx, key_daily(wager.user_id, day), &daily)?;
                    tx_ledger(
                        tx,
                        &user,
                        Some(wager_id),
                        LedgerKind::BetLost,
                        wager.stake,
                        before,
                        &format!("crashed on round {round_no}"),
                        now,
                    )?;
                    settled += 1;
                }
                Ok(settled)
            });
        unwrap_tx(r)
    }

    /// Refund and cancel every still-active wager of a round. Shutdown path
    /// for a round whose run never happened.
    pub fn cancel_active_wagers(&self, round_no: RoundNo, now: u64) -> Result<u32> {
        let mut prefix = b"rw:".to_vec();
        prefix.extend_from_slice(&round_no.to_be_bytes());
        let mut wager_ids = Vec::new();
        for item in self.state.scan_prefix(&prefix) {
            let (_, iv) = item?;
            wager_ids.push(u64::from_be_bytes(
                iv.as_ref()
                    .try_into()
                    .map_err(|_| Error::internal("corrupt round-wager index"))?,
            ));
        }

        let day = day_key(now);
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<u32, Error> {
                let mut cancelled = 0u32;
                for &wager_id in &wager_ids {
                    let mut wager: Wager = match tx_get(tx, &key_wager(wager_id))? {
                        Some(w) => w,
                        None => continue,
                    };
                    if wager.status != WagerStatus::Active {
                        continue;
                    }

                    let mut user: User = match tx_get(tx, &key_user(wager.user_id))? {
                        Some(u) => u,
                        None => continue,
                    };
                    let before = user.balance;

                    user.balance = user.balance.saturating_add(wager.stake);
                    // Placement bookkeeping is unwound; the round never ran.
                    user.stats.total_wagered =
                        user.stats.total_wagered.saturating_sub(wager.stake);
                    user.stats.games_played = user.stats.games_played.saturating_sub(1);

                    wager.status = WagerStatus::Cancelled;

                    let mut daily: DailyCounter =
                        tx_get(tx, &key_daily(wager.user_id, day))?.unwrap_or_default();
                    daily.wagered = daily.wagered.saturating_sub(wager.stake);
                    daily.games = daily.games.saturating_sub(1);

                    tx_put(tx, key_user(user.id), &user)?;
                    tx_put(tx, key_wager(wager_id), &wager)?;
                    tx_put(tx, key_daily(wager.user_id, day), &daily)?;
                    tx_ledger(
                        tx,
                        &user,
                        Some(wager_id),
                        LedgerKind::Adjustment,
                        wager.stake,
                        before,
                        &format!("round {round_no} cancelled, stake refunded"),
                        now,
                    )?;
                    cancelled += 1;
                }
                Ok(cancelled)
            });
        unwrap_tx(r)
    }

    // -------------------------------------------------------------------------
    // Settings, farming, ledger
    // -------------------------------------------------------------------------

    pub fn get_player_settings(&self, user: UserId, defaults: &PlayerSettings) -> Result<PlayerSettings> {
        match self.state.get(key_settings(user))? {
            Some(iv) => Ok(dec(&iv)?),
            None => Ok(defaults.clone()),
        }
    }

    pub fn upsert_player_settings(
        &self,
        user: UserId,
        patch: SettingsPatch,
        defaults: &PlayerSettings,
    ) -> Result<PlayerSettings> {
        let defaults = defaults.clone();
        let r = self.state.transaction(
            |tx| -> ConflictableTransactionResult<PlayerSettings, Error> {
                if tx.get(key_user(user))?.is_none() {
                    return abort(Error::NotFound(format!("user {user}")));
                }
                let mut s: PlayerSettings =
                    tx_get(tx, &key_settings(user))?.unwrap_or_else(|| defaults.clone());

                if let Some(v) = patch.auto_cashout_enabled {
                    s.auto_cashout_enabled = v;
                }
                if let Some(v) = patch.auto_cashout {
                    s.auto_cashout = v;
                }
                if let Some(v) = patch.sound_enabled {
                    s.sound_enabled = v;
                }
                if let Some(v) = patch.daily_limits_enabled {
                    s.daily_limits_enabled = v;
                }
                if let Some(v) = patch.max_daily_wager {
                    s.max_daily_wager = v;
                }
                if let Some(v) = patch.max_daily_loss {
                    s.max_daily_loss = v;
                }
                if let Some(v) = patch.max_games_per_day {
                    s.max_games_per_day = v;
                }

                tx_put(tx, key_settings(user), &s)?;
                Ok(s)
            },
        );
        unwrap_tx(r)
    }

    /// Cooldown-gated reward credit with ledger row and XP bump.
    pub fn claim_farming_points(
        &self,
        user_id: UserId,
        cycle_secs: u64,
        reward: Money,
        now: u64,
    ) -> Result<User> {
        let r = self
            .state
            .transaction(|tx| -> ConflictableTransactionResult<User, Error> {
                let mut user: User = match tx_get(tx, &key_user(user_id))? {
                    Some(u) => u,
                    None => return abort(Error::NotFound(format!("user {user_id}"))),
                };
                let ready_at = user.farming_last_claim + cycle_secs * 1_000;
                if user.farming_last_claim != 0 && now < ready_at {
                    return abort(Error::FailedPrecondition(format!(
                        "farming cooldown, ready in {}s",
                        (ready_at - now) / 1_000
                    )));
                }

                let before = user.balance;
                user.balance = user.balance.saturating_add(reward);
                user.farming_last_claim = now;
                user.experience += (reward.hundredths() / 100).max(0) as u64;
                user.level = User::level_for(user.experience);

                tx_put(tx, key_user(user_id), &user)?;
                tx_ledger(
                    tx,
                    &user,
                    None,
                    LedgerKind::FarmingClaim,
                    reward,
                    before,
                    "farming claim",
                    now,
                )?;
                Ok(user)
            });
        unwrap_tx(r)
    }

    /// Newest-first ledger entries for a user.
    pub fn ledger_for_user(&self, user: UserId, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut prefix = b"le:".to_vec();
        prefix.extend_from_slice(&user.to_be_bytes());
        let mut out = Vec::new();
        for item in self.state.scan_prefix(&prefix).rev().take(limit) {
            let (_, iv) = item?;
            out.push(dec(&iv)?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Audit and admin queries
    // -------------------------------------------------------------------------

    /// Most recent CRASHED rounds, newest first. Seeds are revealed only for
    /// rounds that ended more than `grace_secs` before `now`.
    pub fn recent_fair_rounds(
        &self,
        limit: usize,
        grace_secs: u64,
        now: u64,
    ) -> Result<Vec<FairRound>> {
        let mut out = Vec::new();
        for item in self.state.scan_prefix(b"r:").rev() {
            if out.len() >= limit {
                break;
            }
            let (_, iv) = item?;
            let round: Round = dec(&iv)?;
            if round.status != RoundStatus::Crashed {
                continue;
            }
            let revealed = round
                .ended_at
                .map(|end| end + grace_secs * 1_000 <= now)
                .unwrap_or(false);
            out.push(FairRound {
                number: round.number,
                server_seed: revealed.then_some(round.server_seed),
                server_seed_hash: round.server_seed_hash,
                client_seed: round.client_seed,
                nonce: round.nonce,
                crash_point: round.crash_point,
                ended_at: round.ended_at,
            });
        }
        Ok(out)
    }

    pub fn leaderboard(
        &self,
        sort: LeaderboardSort,
        limit: usize,
        min_games_for_win_rate: u64,
    ) -> Result<Vec<User>> {
        let mut users = Vec::new();
        for item in self.state.scan_prefix(b"u:") {
            let (_, iv) = item?;
            let user: User = dec(&iv)?;
            if !user.active {
                continue;
            }
            if sort == LeaderboardSort::WinRate && user.stats.games_played < min_games_for_win_rate
            {
                continue;
            }
            users.push(user);
        }
        match sort {
            LeaderboardSort::Balance => users.sort_by_key(|u| std::cmp::Reverse(u.balance)),
            LeaderboardSort::TotalWon => {
                users.sort_by_key(|u| std::cmp::Reverse(u.stats.total_won))
            }
            LeaderboardSort::WinRate => {
                users.sort_by_key(|u| std::cmp::Reverse(u.win_rate_pct()))
            }
            LeaderboardSort::Level => {
                users.sort_by_key(|u| std::cmp::Reverse((u.level, u.experience)))
            }
        }
        users.truncate(limit);
        Ok(users)
    }

    pub fn list_users(&self, limit: usize) -> Result<Vec<User>> {
        let mut out = Vec::new();
        for item in self.state.scan_prefix(b"u:").take(limit) {
            let (_, iv) = item?;
            out.push(dec(&iv)?);
        }
        Ok(out)
    }

    /// Newest-first rounds for the admin surface. Seeds of rounds that have
    /// not crashed yet are scrubbed; commitment integrity holds for everyone.
    pub fn list_rounds(&self, limit: usize) -> Result<Vec<Round>> {
        let mut out = Vec::new();
        for item in self.state.scan_prefix(b"r:").rev().take(limit) {
            let (_, iv) = item?;
            let mut round: Round = dec(&iv)?;
            if round.status != RoundStatus::Crashed {
                round.server_seed = [0u8; 32];
            }
            out.push(round);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<AdminStats> {
        let mut s = AdminStats {
            rounds: self.last_round_number()?,
            ..AdminStats::default()
        };
        for item in self.state.scan_prefix(b"u:") {
            let (_, iv) = item?;
            let user: User = dec(&iv)?;
            s.users += 1;
            if user.active {
                s.active_users += 1;
            }
            s.total_wagered = s.total_wagered.saturating_add(user.stats.total_wagered);
            s.total_won = s.total_won.saturating_add(user.stats.total_won);
            s.total_lost = s.total_lost.saturating_add(user.stats.total_lost);
        }
        Ok(s)
    }

    /// Today's counters for a user, for limit displays.
    pub fn daily_counter(&self, user: UserId, at_ms: u64) -> Result<DailyCounter> {
        match self.state.get(key_daily(user, day_key(at_ms)))? {
            Some(iv) => Ok(dec(&iv)?),
            None => Ok(DailyCounter::default()),
        }
    }
}
