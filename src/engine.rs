//! The round engine: single owner of the authoritative game state.
//!
//! One task drives the BETTING → RUNNING → CRASHED cycle and is the only
//! writer of the current round, multiplier, and live-wager set, so those
//! fields need no locks. Bet and cashout requests arrive as mailbox messages
//! and are handled between ticks — serialization for free, and a command
//! drained before the crash tick is honored at the pre-crash multiplier.
//!
//! The state-machine core is synchronous and takes the clock explicitly;
//! [`run`] wraps it in timers. Oracle failure parks the engine in a PAUSED
//! state with backoff; settlement failure is retried a bounded number of
//! times and then logged as degraded consistency rather than stalling play.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fair::{FairnessOracle, RoundFairness};
use crate::net::broadcast::BroadcastFabric;
use crate::net::frames::{PhaseName, PublicState};
use crate::net::session::SessionRegistry;
use crate::store::Store;
use crate::types::{now_ms, ClientId, Money, Multiplier, RoundNo, RoundStatus, WagerId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Crash points kept in the public history ring.
pub const RECENT_CRASH_HISTORY: usize = 10;

/// Settlement attempts before declaring degraded consistency.
const SETTLE_ATTEMPTS: u32 = 3;

/// Oracle-failure backoff bounds.
const PAUSE_BACKOFF_BASE_MS: u64 = 1_000;
const PAUSE_BACKOFF_MAX_MS: u64 = 60_000;

/// Multiplier growth `m(t) = 1 + t/3` with `t` in seconds, in hundredths:
/// one hundredth every 30ms. Monotonic in elapsed time; the crash point is
/// computed against this same curve.
pub fn growth(elapsed_ms: u64) -> Multiplier {
    Multiplier::from_hundredths(100 + elapsed_ms / 30)
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub countdown_secs: u32,
    pub tick_ms: u64,
    pub post_crash_pause_ms: u64,
    pub min_bet: Money,
    pub max_bet: Money,
}

impl EngineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            countdown_secs: cfg.game.countdown_secs,
            tick_ms: cfg.game.tick_ms,
            post_crash_pause_ms: cfg.game.post_crash_pause_ms,
            min_bet: cfg.game.min_bet,
            max_bet: cfg.game.max_bet,
        }
    }
}

/// In-memory mirror of a wager for the current round. Guests have no durable
/// row, so `wager_id` is absent for them.
#[derive(Debug, Clone)]
pub struct LiveWager {
    pub wager_id: Option<WagerId>,
    pub stake: Money,
    pub auto_cashout: Option<Multiplier>,
    pub cashout: Option<Multiplier>,
    pub payout: Option<Money>,
}

impl LiveWager {
    pub fn is_cashed_out(&self) -> bool {
        self.cashout.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Phase {
    Betting { seconds_left: u32 },
    Running { started_at: u64 },
    Crashed { at: u64 },
    Paused { since: u64 },
}

impl Phase {
    pub fn name(&self) -> PhaseName {
        match self {
            Phase::Betting { .. } => PhaseName::Betting,
            Phase::Running { .. } => PhaseName::Running,
            Phase::Crashed { .. } => PhaseName::Crashed,
            Phase::Paused { .. } => PhaseName::Paused,
        }
    }
}

/// Bounded FIFO of recent crash points.
#[derive(Debug, Default)]
pub struct CrashHistory {
    ring: VecDeque<Multiplier>,
}

impl CrashHistory {
    pub fn push(&mut self, m: Multiplier) {
        if self.ring.len() == RECENT_CRASH_HISTORY {
            self.ring.pop_front();
        }
        self.ring.push_back(m);
    }

    pub fn to_vec(&self) -> Vec<Multiplier> {
        self.ring.iter().copied().collect()
    }
}

#[derive(Debug, Clone)]
pub struct LiveRound {
    pub number: RoundNo,
    pub crash_point: Multiplier,
    pub server_seed_hash: [u8; 32],
}

impl LiveRound {
    fn from_fair(number: RoundNo, fair: &RoundFairness) -> Self {
        Self {
            number,
            crash_point: fair.crash_point,
            server_seed_hash: fair.server_seed_hash,
        }
    }
}

#[derive(Debug)]
pub struct BetAck {
    pub round: RoundNo,
    pub stake: Money,
    pub auto_cashout: Option<Multiplier>,
    pub balance: Money,
}

#[derive(Debug)]
pub struct CashoutAck {
    pub round: RoundNo,
    pub multiplier: Multiplier,
    pub payout: Money,
    pub balance: Money,
}

pub enum Command {
    PlaceBet {
        who: ClientId,
        amount: Money,
        auto_cashout: Option<Multiplier>,
        reply: oneshot::Sender<Result<BetAck>>,
    },
    CashOut {
        who: ClientId,
        reply: oneshot::Sender<Result<CashoutAck>>,
    },
    Snapshot {
        reply: oneshot::Sender<PublicState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the engine mailbox. The mailbox is bounded; under
/// extreme load client actions are refused, the engine never stalls.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub async fn place_bet(
        &self,
        who: ClientId,
        amount: Money,
        auto_cashout: Option<Multiplier>,
    ) -> Result<BetAck> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(Command::PlaceBet {
                who,
                amount,
                auto_cashout,
                reply,
            })
            .map_err(|_| Error::ResourceExhausted {
                retry_after_secs: 1,
            })?;
        rx.await.map_err(|_| Error::internal("engine unavailable"))?
    }

    pub async fn cash_out(&self, who: ClientId) -> Result<CashoutAck> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(Command::CashOut { who, reply })
            .map_err(|_| Error::ResourceExhausted {
                retry_after_secs: 1,
            })?;
        rx.await.map_err(|_| Error::internal("engine unavailable"))?
    }

    pub async fn snapshot(&self) -> Result<PublicState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| Error::internal("engine unavailable"))?;
        rx.await.map_err(|_| Error::internal("engine unavailable"))
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) store: Arc<Store>,
    oracle: FairnessOracle,
    pub(crate) registry: Arc<SessionRegistry>,
    fabric: BroadcastFabric,
    pub(crate) phase: Phase,
    pub(crate) round: Option<LiveRound>,
    pub(crate) multiplier: Multiplier,
    pub(crate) live: HashMap<ClientId, LiveWager>,
    history: CrashHistory,
    backoff_ms: u64,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        store: Arc<Store>,
        oracle: FairnessOracle,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let fabric = BroadcastFabric::new(registry.clone());
        Self {
            cfg,
            store,
            oracle,
            registry,
            fabric,
            phase: Phase::Paused { since: 0 },
            round: None,
            multiplier: Multiplier::ONE,
            live: HashMap::new(),
            history: CrashHistory::default(),
            backoff_ms: PAUSE_BACKOFF_BASE_MS,
        }
    }

    /// Open the first betting phase. Returns ms until the next step.
    pub fn start(&mut self, now: u64) -> u64 {
        self.enter_betting(now)
    }

    /// Advance the state machine one step. Returns ms until the next step.
    pub fn step(&mut self, now: u64) -> u64 {
        match self.phase {
            Phase::Betting { seconds_left } => self.step_betting(seconds_left, now),
            Phase::Running { started_at } => self.step_running(started_at, now),
            Phase::Crashed { .. } => self.enter_betting(now),
            Phase::Paused { .. } => self.enter_betting(now),
        }
    }

    pub fn handle(&mut self, cmd: Command, now: u64) {
        match cmd {
            Command::PlaceBet {
                who,
                amount,
                auto_cashout,
                reply,
            } => {
                let _ = reply.send(self.place_bet(who, amount, auto_cashout, now));
            }
            Command::CashOut { who, reply } => {
                let _ = reply.send(self.cash_out(who, now));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.public_state());
            }
            Command::Shutdown { reply } => {
                self.drain(now);
                let _ = reply.send(());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn enter_betting(&mut self, now: u64) -> u64 {
        let fair = match self.oracle.next_round() {
            Ok(fair) => fair,
            Err(e) => return self.pause(now, &e),
        };

        let round = match retry_once(|| self.store.create_round(&fair, now)) {
            Ok(round) => round,
            Err(e) => return self.pause(now, &e),
        };

        self.backoff_ms = PAUSE_BACKOFF_BASE_MS;
        self.live.clear();
        self.multiplier = Multiplier::ONE;
        self.round = Some(LiveRound::from_fair(round.number, &fair));
        self.phase = Phase::Betting {
            seconds_left: self.cfg.countdown_secs,
        };
        info!(
            "round {} betting open, crash committed ({})",
            round.number,
            hex::encode(&fair.server_seed_hash[..8])
        );
        self.broadcast(true);
        1_000
    }

    fn step_betting(&mut self, seconds_left: u32, now: u64) -> u64 {
        if seconds_left <= 1 {
            return self.enter_running(now);
        }
        self.phase = Phase::Betting {
            seconds_left: seconds_left - 1,
        };
        self.broadcast(false);
        1_000
    }

    fn enter_running(&mut self, now: u64) -> u64 {
        let number = match &self.round {
            Some(r) => r.number,
            None => return self.pause(now, &Error::internal("running without a round")),
        };

        if let Err(e) =
            retry_once(|| self.store.update_round_status(number, RoundStatus::Running, None))
        {
            // Fatal for this round: pin the committed crash point and settle.
            error!("round {number} failed to start: {e}");
            return self.enter_crashed(now);
        }

        self.multiplier = Multiplier::ONE;
        self.phase = Phase::Running { started_at: now };
        self.broadcast(false);
        self.cfg.tick_ms
    }

    fn step_running(&mut self, started_at: u64, now: u64) -> u64 {
        let crash = match &self.round {
            Some(r) => r.crash_point,
            None => return self.pause(now, &Error::internal("running without a round")),
        };

        let m = growth(now.saturating_sub(started_at));
        self.multiplier = m.min(crash);

        // Auto-cashouts precede the crash check within the tick; a threshold
        // above the crash point can never fire.
        self.run_auto_cashouts(now);

        if m >= crash {
            self.enter_crashed(now)
        } else {
            self.broadcast(false);
            self.cfg.tick_ms
        }
    }

    fn enter_crashed(&mut self, now: u64) -> u64 {
        let round = match self.round.clone() {
            Some(r) => r,
            None => return self.pause(now, &Error::internal("crash without a round")),
        };

        self.multiplier = round.crash_point;
        self.phase = Phase::Crashed { at: now };

        let mut settled = None;
        for attempt in 1..=SETTLE_ATTEMPTS {
            match self.store.settle_crashed_round(round.number, now) {
                Ok(count) => {
                    settled = Some(count);
                    break;
                }
                Err(e) => warn!(
                    "round {} settlement attempt {attempt}/{SETTLE_ATTEMPTS} failed: {e}",
                    round.number
                ),
            }
        }
        match settled {
            Some(count) => info!(
                "round {} crashed at {} ({count} wagers lost)",
                round.number, round.crash_point
            ),
            // Administrative reconciliation is the escape hatch; play goes on.
            None => error!(
                "degraded consistency: round {} settlement exhausted retries",
                round.number
            ),
        }

        if let Err(e) = retry_once(|| {
            self.store
                .update_round_status(round.number, RoundStatus::Crashed, Some(now))
        }) {
            error!("degraded consistency: round {} close failed: {e}", round.number);
        }

        self.history.push(round.crash_point);
        self.broadcast(true);
        self.cfg.post_crash_pause_ms
    }

    fn pause(&mut self, now: u64, cause: &Error) -> u64 {
        warn!("engine paused: {cause}");
        self.phase = Phase::Paused { since: now };
        self.round = None;
        self.live.clear();
        self.broadcast(true);
        let delay = self.backoff_ms;
        self.backoff_ms = (self.backoff_ms * 2).min(PAUSE_BACKOFF_MAX_MS);
        delay
    }

    /// Shutdown path: finish the current round so no wager is left dangling.
    /// A round still in betting is cancelled with stakes refunded.
    pub fn drain(&mut self, now: u64) {
        match self.phase {
            Phase::Running { .. } => {
                self.enter_crashed(now);
            }
            Phase::Betting { .. } => {
                if let Some(round) = self.round.clone() {
                    match self.store.cancel_active_wagers(round.number, now) {
                        Ok(n) if n > 0 => info!("round {} cancelled, {n} stakes refunded", round.number),
                        Ok(_) => {}
                        Err(e) => error!("round {} cancel failed: {e}", round.number),
                    }
                    if let Err(e) = self.store.update_round_status(
                        round.number,
                        RoundStatus::Crashed,
                        Some(now),
                    ) {
                        error!("round {} close failed: {e}", round.number);
                    }
                }
                self.round = None;
                self.live.clear();
            }
            _ => {}
        }
        info!("engine drained");
    }

    // -------------------------------------------------------------------------
    // State views
    // -------------------------------------------------------------------------

    pub fn public_state(&self) -> PublicState {
        let countdown = match self.phase {
            Phase::Betting { seconds_left } => Some(seconds_left),
            _ => None,
        };
        PublicState {
            phase: self.phase.name(),
            round: self.round.as_ref().map(|r| r.number).unwrap_or(0),
            multiplier: self.multiplier,
            countdown,
            players: self.registry.count() as u32,
            recent_crashes: self.history.to_vec(),
            server_seed_hash: self
                .round
                .as_ref()
                .map(|r| hex::encode(r.server_seed_hash))
                .unwrap_or_default(),
            maintenance: matches!(self.phase, Phase::Paused { .. }),
        }
    }

    pub(crate) fn broadcast(&self, terminal: bool) {
        self.fabric.publish(self.public_state(), &self.live, terminal);
    }
}

/// One retry on transient kinds, per the persistence contract; hard kinds
/// propagate immediately.
pub(crate) fn retry_once<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(e) if e.is_transient() => op(),
        other => other,
    }
}

/// Timer-driven wrapper around the synchronous state machine.
pub async fn run(mut engine: Engine, mut commands: mpsc::Receiver<Command>) {
    let mut delay = engine.start(now_ms());
    let mut next = tokio::time::Instant::now() + std::time::Duration::from_millis(delay);
    loop {
        tokio::select! {
            biased;
            maybe = commands.recv() => match maybe {
                Some(Command::Shutdown { reply }) => {
                    engine.drain(now_ms());
                    let _ = reply.send(());
                    break;
                }
                Some(cmd) => engine.handle(cmd, now_ms()),
                None => {
                    engine.drain(now_ms());
                    break;
                }
            },
            _ = tokio::time::sleep_until(next) => {
                delay = engine.step(now_ms());
                next = tokio::time::Instant::now() + std::time::Duration::from_millis(delay);
            }
        }
    }
    info!("round engine stopped");
}

/// Build the mailbox pair for an engine task.
pub fn channel(capacity: usize) -> (EngineHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EngineHandle { tx }, rx)
}
