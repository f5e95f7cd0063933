//! Wager admission: bets, cashouts, and the auto-cashout sweep.
//!
//! These run on the engine task, so requests against one round are naturally
//! serialized and the one-wager-per-user rule holds without store-level
//! coordination. Guests play against their session's virtual balance and
//! never touch the store; authenticated users go through the gateway's
//! atomic operations.

use crate::engine::{retry_once, BetAck, CashoutAck, Engine, LiveWager, Phase};
use crate::error::{Error, Result};
use crate::types::{ClientId, Money, Multiplier};
use tracing::{debug, warn};

impl Engine {
    pub(crate) fn place_bet(
        &mut self,
        who: ClientId,
        amount: Money,
        auto_cashout: Option<Multiplier>,
        now: u64,
    ) -> Result<BetAck> {
        if !self.registry.contains(who) {
            return Err(Error::Unauthenticated);
        }
        if !amount.is_positive() || amount < self.cfg.min_bet || amount > self.cfg.max_bet {
            return Err(Error::InvalidArgument(format!(
                "stake must be between {} and {}",
                self.cfg.min_bet, self.cfg.max_bet
            )));
        }
        if let Some(threshold) = auto_cashout {
            if threshold <= Multiplier::ONE {
                return Err(Error::InvalidArgument(
                    "auto cashout must exceed 1.00x".into(),
                ));
            }
        }
        if !matches!(self.phase, Phase::Betting { .. }) {
            return Err(Error::FailedPrecondition("bets are closed".into()));
        }
        // One wager per user per round, fixed, not an operator dial. The
        // live set is the authoritative record for the open round.
        if self.live.contains_key(&who) {
            return Err(Error::AlreadyExists("wager already placed".into()));
        }
        let round = self
            .round
            .as_ref()
            .ok_or_else(|| Error::FailedPrecondition("no round open".into()))?
            .number;

        let (wager_id, balance) = match who {
            ClientId::User(user_id) => {
                let (wager, user) =
                    retry_once(|| self.store.place_wager(user_id, round, amount, auto_cashout, now))?;
                self.registry.set_balance(who, user.balance);
                (Some(wager.id), user.balance)
            }
            ClientId::Guest(_) => (None, self.registry.debit_guest(who, amount)?),
        };

        self.live.insert(
            who,
            LiveWager {
                wager_id,
                stake: amount,
                auto_cashout,
                cashout: None,
                payout: None,
            },
        );
        debug!("{who} bet {amount} on round {round}");

        Ok(BetAck {
            round,
            stake: amount,
            auto_cashout,
            balance,
        })
    }

    pub(crate) fn cash_out(&mut self, who: ClientId, now: u64) -> Result<CashoutAck> {
        if !self.registry.contains(who) {
            return Err(Error::Unauthenticated);
        }
        let wager = self
            .live
            .get(&who)
            .ok_or_else(|| Error::NotFound("no wager in this round".into()))?;
        if !matches!(self.phase, Phase::Running { .. }) {
            return Err(Error::FailedPrecondition("round is not running".into()));
        }
        if wager.is_cashed_out() {
            return Err(Error::AlreadyExists("wager already cashed out".into()));
        }

        // Atomic snapshot of the engine-owned multiplier, already pinned to
        // the crash point.
        let multiplier = self.multiplier;
        self.settle_cashout(who, multiplier, now)
    }

    /// Fire auto-cashouts whose threshold the current tick reached. Runs
    /// before the crash check, so `threshold < crash_point` always wins and
    /// `threshold > crash_point` can never fire. Pays the threshold, not the
    /// tick multiplier.
    pub(crate) fn run_auto_cashouts(&mut self, now: u64) {
        let reached = self.multiplier;
        let due: Vec<(ClientId, Multiplier)> = self
            .live
            .iter()
            .filter_map(|(who, w)| match (w.is_cashed_out(), w.auto_cashout) {
                (false, Some(threshold)) if threshold <= reached => Some((*who, threshold)),
                _ => None,
            })
            .collect();

        for (who, threshold) in due {
            // Fires even for detached users; their durable wager survives the
            // disconnect. Detached guests have nothing left to credit.
            if let Err(e) = self.settle_cashout(who, threshold, now) {
                warn!("auto cashout for {who} failed: {e}");
            }
        }
    }

    fn settle_cashout(&mut self, who: ClientId, multiplier: Multiplier, now: u64) -> Result<CashoutAck> {
        let round = self
            .round
            .as_ref()
            .ok_or_else(|| Error::FailedPrecondition("no round open".into()))?
            .number;
        let wager = self
            .live
            .get(&who)
            .ok_or_else(|| Error::NotFound("no wager in this round".into()))?;

        let (payout, balance) = match (who, wager.wager_id) {
            (ClientId::User(_), Some(wager_id)) => {
                let (settled, user) =
                    retry_once(|| self.store.cashout_wager(wager_id, multiplier, now))?;
                self.registry.set_balance(who, user.balance);
                (settled.payout.unwrap_or(Money::ZERO), user.balance)
            }
            _ => {
                let payout = wager.stake.times(multiplier);
                let balance = self.registry.credit_guest(who, payout).unwrap_or(Money::ZERO);
                (payout, balance)
            }
        };

        if let Some(w) = self.live.get_mut(&who) {
            w.cashout = Some(multiplier);
            w.payout = Some(payout);
        }
        debug!("{who} cashed out at {multiplier} for {payout}");

        Ok(CashoutAck {
            round,
            multiplier,
            payout,
            balance,
        })
    }
}
