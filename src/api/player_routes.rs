//! Player-facing routes: settings, fairness audit, leaderboard, farming.

use super::{check_rate, require_user, AppState, UserProfile};
use crate::error::Result;
use crate::net::rate_limit::RouteClass;
use crate::store::{LeaderboardSort, SettingsPatch};
use crate::types::{now_ms, Money, Multiplier, PlayerSettings, RoundNo};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Users below this many settled games are excluded from the win-rate board.
const MIN_GAMES_FOR_WIN_RATE: u64 = 10;

const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
}

// =============================================================================
// SETTINGS
// =============================================================================

pub async fn get_settings(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<PlayerSettings>> {
    let user = require_user(&state, &headers)?;
    check_rate(&state, RouteClass::SettingsRead, Some(&user), &conn)?;
    let settings = state
        .store
        .get_player_settings(user.id, &state.cfg.default_settings())?;
    Ok(Json(settings))
}

pub async fn update_settings(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<PlayerSettings>> {
    let user = require_user(&state, &headers)?;
    check_rate(&state, RouteClass::SettingsWrite, Some(&user), &conn)?;
    let settings =
        state
            .store
            .upsert_player_settings(user.id, patch, &state.cfg.default_settings())?;
    Ok(Json(settings))
}

// =============================================================================
// FAIRNESS AUDIT
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FairRoundRow {
    pub round: RoundNo,
    /// Hex, null until the reveal grace has passed.
    pub server_seed: Option<String>,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub nonce: u64,
    pub crash_point: Multiplier,
    pub ended_at: Option<u64>,
}

/// Recent crashed rounds with their commitments; seeds revealed only past
/// the grace period, so a just-finished round cannot be correlated with late
/// cashouts.
pub async fn fairness_rounds(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<FairRoundRow>>> {
    check_rate(&state, RouteClass::General, None, &conn)?;
    let rounds = state.store.recent_fair_rounds(
        clamp_limit(q.limit, 20),
        state.cfg.game.seed_reveal_grace_secs,
        now_ms(),
    )?;
    Ok(Json(
        rounds
            .into_iter()
            .map(|r| FairRoundRow {
                round: r.number,
                server_seed: r.server_seed.map(hex::encode),
                server_seed_hash: hex::encode(r.server_seed_hash),
                client_seed: r.client_seed,
                nonce: r.nonce,
                crash_point: r.crash_point,
                ended_at: r.ended_at,
            })
            .collect(),
    ))
}

// =============================================================================
// LEADERBOARD
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub sort: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub rank: u32,
    pub handle: String,
    pub level: u32,
    pub balance: Money,
    pub total_won: Money,
    pub net_profit: i64,
    pub win_rate_pct: u32,
    pub games_played: u64,
}

pub async fn leaderboard(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    Query(q): Query<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardRow>>> {
    check_rate(&state, RouteClass::General, None, &conn)?;
    let sort: LeaderboardSort = q.sort.as_deref().unwrap_or("balance").parse()?;
    let users = state.store.leaderboard(
        sort,
        clamp_limit(q.limit, 10),
        MIN_GAMES_FOR_WIN_RATE,
    )?;
    Ok(Json(
        users
            .iter()
            .enumerate()
            .map(|(i, u)| LeaderboardRow {
                rank: i as u32 + 1,
                handle: u.handle.clone(),
                level: u.level,
                balance: u.balance,
                total_won: u.stats.total_won,
                net_profit: u.stats.net_profit(),
                win_rate_pct: u.win_rate_pct(),
                games_played: u.stats.games_played,
            })
            .collect(),
    ))
}

// =============================================================================
// FARMING
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmingStatus {
    pub ready: bool,
    pub last_claim: Option<u64>,
    pub ready_at: u64,
    pub reward: Money,
    pub cycle_secs: u64,
}

pub async fn farming_status(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<FarmingStatus>> {
    let user = require_user(&state, &headers)?;
    check_rate(&state, RouteClass::General, Some(&user), &conn)?;
    let row = state.store.get_user(user.id)?;
    let now = now_ms();

    let ready_at = if row.farming_last_claim == 0 {
        now
    } else {
        row.farming_last_claim + state.cfg.farming.cycle_secs * 1_000
    };
    Ok(Json(FarmingStatus {
        ready: now >= ready_at,
        last_claim: (row.farming_last_claim != 0).then_some(row.farming_last_claim),
        ready_at,
        reward: state.cfg.farming.reward,
        cycle_secs: state.cfg.farming.cycle_secs,
    }))
}

pub async fn farming_claim(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>> {
    let user = require_user(&state, &headers)?;
    check_rate(&state, RouteClass::General, Some(&user), &conn)?;
    let row = state.store.claim_farming_points(
        user.id,
        state.cfg.farming.cycle_secs,
        state.cfg.farming.reward,
        now_ms(),
    )?;
    Ok(Json(UserProfile::from(&row)))
}
