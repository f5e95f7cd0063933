//! Request-reply surface: validation, rate limits, and delegation.
//!
//! No game logic lives here. Handlers validate, consult the per-route
//! limiter, and call into the store, the credential service, or the engine
//! mailbox. Error kinds translate to HTTP statuses uniformly.

pub mod admin_routes;
pub mod auth_routes;
pub mod player_routes;

use crate::auth::{AuthService, AuthUser};
use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::Error;
use crate::net::rate_limit::{RateKey, RouteClass, RouteLimiter};
use crate::net::session::SessionRegistry;
use crate::store::Store;
use crate::types::{now_ms, Role, User};
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<Store>,
    pub auth: Arc<AuthService>,
    pub registry: Arc<SessionRegistry>,
    pub engine: EngineHandle,
    pub limiter: Arc<RouteLimiter>,
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.cfg);
    Router::new()
        .route("/ws", get(crate::net::ws::ws_handler))
        .route("/auth/platform", post(auth_routes::platform_login))
        .route("/auth/admin/login", post(auth_routes::admin_login))
        .route("/auth/admin/register", post(auth_routes::admin_register))
        .route("/auth/refresh", post(auth_routes::refresh))
        .route("/auth/logout", post(auth_routes::logout))
        .route("/auth/profile", get(auth_routes::profile))
        .route("/auth/password", post(auth_routes::change_password))
        .route(
            "/player/settings",
            get(player_routes::get_settings).put(player_routes::update_settings),
        )
        .route("/fairness/rounds", get(player_routes::fairness_rounds))
        .route("/leaderboard", get(player_routes::leaderboard))
        .route("/farming/status", get(player_routes::farming_status))
        .route("/farming/claim", post(player_routes::farming_claim))
        .route("/admin/stats", get(admin_routes::stats))
        .route("/admin/users", get(admin_routes::users))
        .route("/admin/users/:id", patch(admin_routes::update_user))
        .route("/admin/rounds", get(admin_routes::rounds))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(cfg: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::new()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if let Error::Internal(detail) = &self {
            error!("internal error: {detail}");
        }
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.client_message(),
        });
        if let Error::InvalidArgument(detail) = &self {
            body["details"] = serde_json::json!([detail]);
        }
        if let Error::ResourceExhausted { retry_after_secs } = &self {
            body["retryAfterSecs"] = serde_json::json!(retry_after_secs);
        }

        let mut response = (status, axum::Json(body)).into_response();
        if let Error::ResourceExhausted { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// =============================================================================
// SHARED EXTRACTION HELPERS
// =============================================================================

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

pub(crate) fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, Error> {
    let token = bearer_token(headers).ok_or(Error::Unauthenticated)?;
    state.auth.validate_access(&token, now_ms())
}

/// Role gate plus the optional operator IP allowlist.
pub(crate) fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
    addr: &SocketAddr,
) -> Result<AuthUser, Error> {
    let user = require_user(state, headers)?;
    if user.role != Role::Admin {
        return Err(Error::PermissionDenied);
    }
    let allowlist = &state.cfg.admin.ip_allowlist;
    if !allowlist.is_empty() && !allowlist.contains(&addr.ip()) {
        return Err(Error::PermissionDenied);
    }
    Ok(user)
}

/// Limits key on the user when known, else the caller address.
pub(crate) fn rate_key(user: Option<&AuthUser>, addr: &SocketAddr) -> RateKey {
    match user {
        Some(u) => RateKey::User(u.id),
        None => RateKey::Ip(addr.ip()),
    }
}

pub(crate) fn check_rate(
    state: &AppState,
    route: RouteClass,
    user: Option<&AuthUser>,
    conn: &ConnectInfo<SocketAddr>,
) -> Result<(), Error> {
    state.limiter.check(route, rate_key(user, &conn.0))
}

// =============================================================================
// SHARED RESPONSE SHAPES
// =============================================================================

/// Client-safe projection of a user row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: u64,
    pub handle: String,
    pub role: Role,
    pub balance: crate::types::Money,
    pub total_wagered: crate::types::Money,
    pub total_won: crate::types::Money,
    pub total_lost: crate::types::Money,
    pub net_profit: i64,
    pub games_played: u64,
    pub wins: u64,
    pub win_rate_pct: u32,
    pub biggest_win: crate::types::Money,
    pub biggest_loss: crate::types::Money,
    pub experience: u64,
    pub level: u32,
    pub active: bool,
    pub created_at: u64,
    pub last_login: u64,
}

impl From<&User> for UserProfile {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            handle: u.handle.clone(),
            role: u.role,
            balance: u.balance,
            total_wagered: u.stats.total_wagered,
            total_won: u.stats.total_won,
            total_lost: u.stats.total_lost,
            net_profit: u.stats.net_profit(),
            games_played: u.stats.games_played,
            wins: u.wins,
            win_rate_pct: u.win_rate_pct(),
            biggest_win: u.stats.biggest_win,
            biggest_loss: u.stats.biggest_loss,
            experience: u.experience,
            level: u.level,
            active: u.active,
            created_at: u.created_at,
            last_login: u.last_login,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub access_expires_at: u64,
    pub refresh_token: String,
    pub refresh_expires_at: u64,
    pub user: UserProfile,
}
