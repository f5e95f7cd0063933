//! Request budgets for sockets and routes.
//!
//! A budget is integer fixed-point, like every other quantity in this crate:
//! thousandths of a permit, replenished from elapsed milliseconds. No floats,
//! so refill math is exact and the retry-after hint is a plain ceiling
//! division.

use crate::error::Error;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

/// Millipermits per permit.
const MILLI: u64 = 1_000;

/// Refillable request allowance. Starts full; `admit` spends one permit.
#[derive(Debug, Clone)]
pub struct RequestBudget {
    /// Millipermits currently available.
    level: u64,
    /// Ceiling, in millipermits; also the burst size.
    cap: u64,
    /// Refill rate in millipermits per second.
    rate: u64,
    /// Last time `level` actually gained; short elapsed spans that round to
    /// zero gain leave this untouched so slow drips still accumulate.
    topped_up: Instant,
}

impl RequestBudget {
    /// `per_min` permits per minute, bursting up to `per_min` at once.
    pub fn per_minute(per_min: u32) -> Self {
        let per_min = per_min.max(1) as u64;
        Self::with(per_min, per_min * MILLI / 60)
    }

    /// `per_sec` permits per second, bursting up to `per_sec` at once.
    pub fn per_second(per_sec: u32) -> Self {
        let per_sec = per_sec.max(1) as u64;
        Self::with(per_sec, per_sec * MILLI)
    }

    fn with(cap_permits: u64, rate_milli_per_sec: u64) -> Self {
        Self {
            level: cap_permits * MILLI,
            cap: cap_permits * MILLI,
            rate: rate_milli_per_sec.max(1),
            topped_up: Instant::now(),
        }
    }

    fn replenish(&mut self) {
        let elapsed_ms = self.topped_up.elapsed().as_millis() as u64;
        let gained = elapsed_ms.saturating_mul(self.rate) / MILLI;
        if gained == 0 {
            return;
        }
        self.level = (self.level + gained).min(self.cap);
        self.topped_up = Instant::now();
    }

    /// Spend one permit if the budget allows.
    pub fn admit(&mut self) -> bool {
        self.replenish();
        if self.level >= MILLI {
            self.level -= MILLI;
            true
        } else {
            false
        }
    }

    /// Whole permits currently available.
    pub fn remaining(&mut self) -> u64 {
        self.replenish();
        self.level / MILLI
    }

    /// Seconds until the next permit; zero when one is already available.
    pub fn retry_after_secs(&mut self) -> u64 {
        self.replenish();
        if self.level >= MILLI {
            return 0;
        }
        let missing = MILLI - self.level;
        missing.div_ceil(self.rate)
    }
}

/// Inbound message budget for one socket session.
///
/// Excess messages are dropped; the session is told once per dry spell, not
/// once per dropped message.
#[derive(Debug)]
pub struct SessionInboundLimiter {
    budget: RequestBudget,
    notified: bool,
}

pub enum InboundDecision {
    Admit,
    /// Drop the message; `notify` is true the first time in this window.
    Drop { notify: bool },
}

impl SessionInboundLimiter {
    pub fn new(msgs_per_sec: u32) -> Self {
        Self {
            budget: RequestBudget::per_second(msgs_per_sec),
            notified: false,
        }
    }

    pub fn check(&mut self) -> InboundDecision {
        if self.budget.admit() {
            self.notified = false;
            InboundDecision::Admit
        } else {
            let notify = !self.notified;
            self.notified = true;
            InboundDecision::Drop { notify }
        }
    }
}

// =============================================================================
// PER-ROUTE LIMITS
// =============================================================================

/// Route classes with distinct budgets. Auth and admin are tight; settings
/// reads are high-throughput, settings writes are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Auth,
    Admin,
    SettingsRead,
    SettingsWrite,
    General,
}

/// Limits key on the user when known, else the caller address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKey {
    User(u64),
    Ip(IpAddr),
}

struct KeyedBudget {
    budget: RequestBudget,
    last_used: Instant,
}

/// Budgets are created lazily per (route, key) and swept once the map grows
/// past `SWEEP_THRESHOLD`.
pub struct RouteLimiter {
    auth_per_min: u32,
    admin_per_min: u32,
    settings_read_per_min: u32,
    settings_write_per_min: u32,
    general_per_min: u32,
    budgets: Mutex<HashMap<(RouteClass, RateKey), KeyedBudget>>,
}

const SWEEP_THRESHOLD: usize = 10_000;
const STALE_AFTER_SECS: u64 = 600;

impl RouteLimiter {
    pub fn new(cfg: &crate::config::RateConfig) -> Self {
        Self {
            auth_per_min: cfg.auth_per_min,
            admin_per_min: cfg.admin_per_min,
            settings_read_per_min: cfg.settings_read_per_min,
            settings_write_per_min: cfg.settings_write_per_min,
            general_per_min: cfg.general_per_min,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    fn budget_per_min(&self, route: RouteClass) -> u32 {
        match route {
            RouteClass::Auth => self.auth_per_min,
            RouteClass::Admin => self.admin_per_min,
            RouteClass::SettingsRead => self.settings_read_per_min,
            RouteClass::SettingsWrite => self.settings_write_per_min,
            RouteClass::General => self.general_per_min,
        }
    }

    /// Admit or reject one request. Rejections carry the retry-after hint and
    /// never terminate the connection.
    pub fn check(&self, route: RouteClass, key: RateKey) -> Result<(), Error> {
        let per_min = self.budget_per_min(route);
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());

        if budgets.len() > SWEEP_THRESHOLD {
            let now = Instant::now();
            budgets.retain(|_, b| now.duration_since(b.last_used).as_secs() < STALE_AFTER_SECS);
        }

        let entry = budgets.entry((route, key)).or_insert_with(|| KeyedBudget {
            budget: RequestBudget::per_minute(per_min),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();

        if entry.budget.admit() {
            Ok(())
        } else {
            Err(Error::ResourceExhausted {
                retry_after_secs: entry.budget.retry_after_secs().max(1),
            })
        }
    }
}
