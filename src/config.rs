//! Operator configuration.
//!
//! Loaded from a TOML file with every key optional; defaults below are the
//! shipped values. Monetary keys are fixed-point hundredths (`min_bet = 100`
//! is 1.00) and multiplier keys are hundredths as well.

use crate::error::{Error, Result};
use crate::types::{Money, PlayerSettings};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_port: u16,
    pub data_dir: PathBuf,
    pub game: GameConfig,
    pub farming: FarmingConfig,
    pub daily: DailyLimitDefaults,
    pub token: TokenConfig,
    pub admin: AdminConfig,
    pub cors: CorsConfig,
    pub rate: RateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub min_bet: Money,
    pub max_bet: Money,
    /// Starting balance for new accounts and guest sessions.
    pub default_balance: Money,
    /// House edge in basis points; 100 = 1%.
    pub house_edge_bp: u16,
    /// Client entropy mixed into every round until per-player seeds exist.
    pub client_seed: String,
    pub countdown_secs: u32,
    pub tick_ms: u64,
    pub post_crash_pause_ms: u64,
    /// Server seeds stay private this long after a round ends.
    pub seed_reveal_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmingConfig {
    pub cycle_secs: u64,
    pub reward: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyLimitDefaults {
    pub enabled: bool,
    pub max_daily_wager: Money,
    pub max_daily_loss: Money,
    pub max_games_per_day: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HS256 signing secret. The default is for development only; operators
    /// must override it.
    pub secret: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    /// Sessions idle beyond this are reaped.
    pub session_idle_secs: u64,
    /// Secret shared with the external messaging platform for signed logins.
    pub platform_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Empty list disables the IP gate.
    pub ip_allowlist: Vec<IpAddr>,
    pub registration_enabled: bool,
    pub registration_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

/// Per-route request budgets, per minute unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub auth_per_min: u32,
    pub admin_per_min: u32,
    pub settings_read_per_min: u32,
    pub settings_write_per_min: u32,
    pub general_per_min: u32,
    /// Inbound socket messages per second per session.
    pub socket_msgs_per_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            data_dir: PathBuf::from("./data"),
            game: GameConfig::default(),
            farming: FarmingConfig::default(),
            daily: DailyLimitDefaults::default(),
            token: TokenConfig::default(),
            admin: AdminConfig::default(),
            cors: CorsConfig::default(),
            rate: RateConfig::default(),
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_bet: Money::from_hundredths(100),
            max_bet: Money::from_hundredths(1_000_00),
            default_balance: Money::from_hundredths(1_000_00),
            house_edge_bp: 100,
            client_seed: "apogee-public".to_string(),
            countdown_secs: 5,
            tick_ms: 50,
            post_crash_pause_ms: 3_000,
            seed_reveal_grace_secs: 300,
        }
    }
}

impl Default for FarmingConfig {
    fn default() -> Self {
        Self {
            cycle_secs: 6 * 60 * 60,
            reward: Money::from_hundredths(6_000_00),
        }
    }
}

impl Default for DailyLimitDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            max_daily_wager: Money::from_hundredths(100_000),
            max_daily_loss: Money::from_hundredths(50_000),
            max_games_per_day: 500,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "dev-secret-change-me".to_string(),
            access_ttl_secs: 7 * 24 * 60 * 60,
            refresh_ttl_secs: 30 * 24 * 60 * 60,
            session_idle_secs: 24 * 60 * 60,
            platform_secret: String::new(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            ip_allowlist: Vec::new(),
            registration_enabled: false,
            registration_key: String::new(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            auth_per_min: 10,
            admin_per_min: 30,
            settings_read_per_min: 120,
            settings_write_per_min: 12,
            general_per_min: 60,
            socket_msgs_per_sec: 10,
        }
    }
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            None => Ok(Config::default()),
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| Error::internal(format!("read {}: {e}", p.display())))?;
                toml::from_str(&raw)
                    .map_err(|e| Error::InvalidArgument(format!("config {}: {e}", p.display())))
            }
        }
    }

    /// Player-settings row defaults derived from the operator daily limits.
    pub fn default_settings(&self) -> PlayerSettings {
        PlayerSettings {
            daily_limits_enabled: self.daily.enabled,
            max_daily_wager: self.daily.max_daily_wager,
            max_daily_loss: self.daily.max_daily_loss,
            max_games_per_day: self.daily.max_games_per_day,
            ..PlayerSettings::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.game.min_bet.is_positive() || self.game.max_bet < self.game.min_bet {
            return Err(Error::InvalidArgument(
                "game.min_bet must be positive and <= game.max_bet".into(),
            ));
        }
        if self.game.house_edge_bp >= 10_000 {
            return Err(Error::InvalidArgument(
                "game.house_edge_bp must be below 10000".into(),
            ));
        }
        if self.game.tick_ms == 0 || self.game.countdown_secs == 0 {
            return Err(Error::InvalidArgument(
                "game.tick_ms and game.countdown_secs must be nonzero".into(),
            ));
        }
        if self.token.secret.is_empty() {
            return Err(Error::InvalidArgument("token.secret must be set".into()));
        }
        Ok(())
    }
}
