//! Authentication routes: platform login, admin password flow, token
//! lifecycle, profile.

use super::{check_rate, require_user, AppState, TokenResponse, UserProfile};
use crate::auth::{self, PlatformPayload};
use crate::error::{Error, Result};
use crate::net::rate_limit::RouteClass;
use crate::store::NewUser;
use crate::types::{now_ms, Role, User};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::info;

fn token_response(state: &AppState, user: &User, now: u64) -> Result<TokenResponse> {
    let pair = state.auth.issue(user, now)?;
    Ok(TokenResponse {
        access_token: pair.access,
        access_expires_at: pair.access_expires_at,
        refresh_token: pair.refresh,
        refresh_expires_at: pair.refresh_expires_at,
        user: UserProfile::from(user),
    })
}

/// Validate a signed messaging-platform identity, upsert the user, and issue
/// tokens.
pub async fn platform_login(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    Json(payload): Json<PlatformPayload>,
) -> Result<Json<TokenResponse>> {
    check_rate(&state, RouteClass::Auth, None, &conn)?;
    let now = now_ms();

    let identity = auth::verify_platform_payload(&payload, &state.cfg.token.platform_secret, now)?;

    let user = match state.store.find_user_by_external_id(&identity.external_id)? {
        Some(existing) => {
            if !existing.active {
                return Err(Error::PermissionDenied);
            }
            state.store.touch_last_login(existing.id, now)?
        }
        None => {
            let new = NewUser {
                external_id: Some(identity.external_id.clone()),
                handle: identity.handle.clone(),
                role: Role::Player,
                password_hash: None,
                balance: state.cfg.game.default_balance,
            };
            match state
                .store
                .create_user(new.clone(), state.cfg.default_settings(), now)
            {
                Ok(user) => {
                    info!("registered platform user {} ({})", user.id, user.handle);
                    user
                }
                // Handle collision with an unrelated account; qualify and retry.
                Err(Error::AlreadyExists(_)) => state.store.create_user(
                    NewUser {
                        handle: format!("{}-{}", identity.handle, identity.external_id),
                        ..new
                    },
                    state.cfg.default_settings(),
                    now,
                )?,
                Err(e) => return Err(e),
            }
        }
    };

    Ok(Json(token_response(&state, &user, now)?))
}

#[derive(Debug, Deserialize)]
pub struct PasswordLogin {
    pub handle: String,
    pub password: String,
}

pub async fn admin_login(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    Json(body): Json<PasswordLogin>,
) -> Result<Json<TokenResponse>> {
    check_rate(&state, RouteClass::Auth, None, &conn)?;
    let now = now_ms();

    let user = state
        .store
        .authenticate_user(&body.handle, &body.password, now)?;
    if user.role != Role::Admin {
        return Err(Error::PermissionDenied);
    }

    Ok(Json(token_response(&state, &user, now)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRegister {
    pub handle: String,
    pub password: String,
    pub registration_key: String,
}

/// Gated twice: the operator must enable registration explicitly, and the
/// caller must present the pre-shared key.
pub async fn admin_register(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    Json(body): Json<AdminRegister>,
) -> Result<Json<TokenResponse>> {
    check_rate(&state, RouteClass::Auth, None, &conn)?;
    let now = now_ms();

    if !state.cfg.admin.registration_enabled {
        return Err(Error::PermissionDenied);
    }
    if state.cfg.admin.registration_key.is_empty()
        || body.registration_key != state.cfg.admin.registration_key
    {
        return Err(Error::PermissionDenied);
    }
    if body.handle.len() < 3 || body.handle.len() > 32 {
        return Err(Error::InvalidArgument(
            "handle must be 3..=32 characters".into(),
        ));
    }
    if body.password.len() < 8 {
        return Err(Error::InvalidArgument(
            "password must be at least 8 characters".into(),
        ));
    }

    let user = state.store.create_user(
        NewUser {
            external_id: None,
            handle: body.handle.clone(),
            role: Role::Admin,
            password_hash: Some(auth::hash_password(&body.password)?),
            balance: state.cfg.game.default_balance,
        },
        state.cfg.default_settings(),
        now,
    )?;
    info!("registered admin {} ({})", user.id, user.handle);

    Ok(Json(token_response(&state, &user, now)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub access_expires_at: u64,
}

pub async fn refresh(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>> {
    check_rate(&state, RouteClass::Auth, None, &conn)?;
    let now = now_ms();

    let refreshed = state.auth.refresh(&body.refresh_token, now)?;
    let user = state.store.get_user(refreshed.user_id)?;
    if !user.active {
        state.auth.logout(user.id);
        return Err(Error::PermissionDenied);
    }

    Ok(Json(RefreshResponse {
        access_token: refreshed.access,
        access_expires_at: refreshed.access_expires_at,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let user = require_user(&state, &headers)?;
    check_rate(&state, RouteClass::Auth, Some(&user), &conn)?;
    state.auth.logout(user.id);
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn profile(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>> {
    let user = require_user(&state, &headers)?;
    check_rate(&state, RouteClass::General, Some(&user), &conn)?;
    let row = state.store.get_user(user.id)?;
    Ok(Json(UserProfile::from(&row)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePassword {
    pub old_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    conn: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ChangePassword>,
) -> Result<Json<serde_json::Value>> {
    let user = require_user(&state, &headers)?;
    check_rate(&state, RouteClass::Auth, Some(&user), &conn)?;

    if body.new_password.len() < 8 {
        return Err(Error::InvalidArgument(
            "password must be at least 8 characters".into(),
        ));
    }

    let row = state.store.get_user(user.id)?;
    let current = row.password_hash.as_deref().ok_or(Error::FailedPrecondition(
        "account has no password".into(),
    ))?;
    if !auth::verify_password(&body.old_password, current) {
        return Err(Error::Unauthenticated);
    }

    state
        .store
        .set_password_hash(user.id, auth::hash_password(&body.new_password)?)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
