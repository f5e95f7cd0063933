//! Administrative routes. All gated by role ADMIN plus the optional caller
//! IP allowlist.

use super::{check_rate, require_admin, AppState, UserProfile};
use crate::error::Result;
use crate::net::rate_limit::RouteClass;
use crate::store::{AdminStats, UserPatch};
use crate::types::{now_ms, LedgerKind, Multiplier, Role, RoundNo, RoundStatus};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

pub async fn stats(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<AdminStats>> {
    let admin = require_admin(&state, &headers, &conn.0)?;
    check_rate(&state, RouteClass::Admin, Some(&admin), &conn)?;
    Ok(Json(state.store.stats()?))
}

pub async fn users(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<UserProfile>>> {
    let admin = require_admin(&state, &headers, &conn.0)?;
    check_rate(&state, RouteClass::Admin, Some(&admin), &conn)?;
    let users = state
        .store
        .list_users(q.limit.unwrap_or(100).clamp(1, MAX_LIST_LIMIT))?;
    Ok(Json(users.iter().map(UserProfile::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUserUpdate {
    pub handle: Option<String>,
    pub role: Option<Role>,
    pub active: Option<bool>,
    /// Signed hundredths; writes an ADJUSTMENT ledger entry.
    pub balance_delta: Option<i64>,
    pub note: Option<String>,
}

pub async fn update_user(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(user_id): Path<u64>,
    Json(body): Json<AdminUserUpdate>,
) -> Result<Json<UserProfile>> {
    let admin = require_admin(&state, &headers, &conn.0)?;
    check_rate(&state, RouteClass::Admin, Some(&admin), &conn)?;

    let mut row = state.store.update_user(
        user_id,
        UserPatch {
            handle: body.handle,
            role: body.role,
            active: body.active,
        },
    )?;

    if let Some(delta) = body.balance_delta {
        if delta != 0 {
            let note = body.note.unwrap_or_else(|| format!("adjustment by admin {}", admin.id));
            row = state
                .store
                .adjust_balance(user_id, delta, LedgerKind::Adjustment, &note, now_ms())?;
            info!("admin {} adjusted user {user_id} balance by {delta}", admin.id);
        }
    }

    Ok(Json(UserProfile::from(&row)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRoundRow {
    pub number: RoundNo,
    pub status: RoundStatus,
    pub crash_point: Multiplier,
    pub server_seed_hash: String,
    /// Present only for crashed rounds.
    pub server_seed: Option<String>,
    pub client_seed: String,
    pub nonce: u64,
    pub started_at: u64,
    pub ended_at: Option<u64>,
}

pub async fn rounds(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<AdminRoundRow>>> {
    let admin = require_admin(&state, &headers, &conn.0)?;
    check_rate(&state, RouteClass::Admin, Some(&admin), &conn)?;

    let rounds = state
        .store
        .list_rounds(q.limit.unwrap_or(50).clamp(1, MAX_LIST_LIMIT))?;
    Ok(Json(
        rounds
            .into_iter()
            .map(|r| AdminRoundRow {
                number: r.number,
                status: r.status,
                crash_point: r.crash_point,
                server_seed_hash: hex::encode(r.server_seed_hash),
                server_seed: (r.status == RoundStatus::Crashed)
                    .then(|| hex::encode(r.server_seed)),
                client_seed: r.client_seed,
                nonce: r.nonce,
                started_at: r.started_at,
                ended_at: r.ended_at,
            })
            .collect(),
    ))
}
