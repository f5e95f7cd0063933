//! Token issuance and session tracking.
//!
//! Two HS256 token kinds: short-lived access tokens and longer-lived refresh
//! tokens (`typ` claim). A token is only as good as its in-process session:
//! the service remembers the fingerprint of the most recent access token per
//! user, so logout and re-issue both invalidate older tokens immediately,
//! without a denylist. Idle sessions are reaped periodically.

use crate::config::TokenConfig;
use crate::error::{Error, Result};
use crate::types::{Role, User, UserId};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// Platform login payloads older than this are replays.
const PLATFORM_AUTH_MAX_AGE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: UserId,
    role: Role,
    typ: TokenKind,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: UserId,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: String,
    pub access_expires_at: u64,
    pub refresh: String,
    pub refresh_expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct RefreshedAccess {
    pub user_id: UserId,
    pub access: String,
    pub access_expires_at: u64,
}

struct AuthSession {
    access_fp: [u8; 32],
    last_activity: u64,
}

pub struct AuthService {
    cfg: TokenConfig,
    enc: EncodingKey,
    dec: DecodingKey,
    sessions: Mutex<HashMap<UserId, AuthSession>>,
}

fn fingerprint(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

impl AuthService {
    pub fn new(cfg: TokenConfig) -> Self {
        let enc = EncodingKey::from_secret(cfg.secret.as_bytes());
        let dec = DecodingKey::from_secret(cfg.secret.as_bytes());
        Self {
            cfg,
            enc,
            dec,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sign(&self, sub: UserId, role: Role, typ: TokenKind, ttl_secs: u64, now: u64) -> Result<(String, u64)> {
        let iat = now / 1_000;
        let exp = iat + ttl_secs;
        let claims = Claims {
            sub,
            role,
            typ,
            iat,
            exp,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.enc)
            .map_err(|e| Error::internal(format!("token encode: {e}")))?;
        Ok((token, exp * 1_000))
    }

    fn decode(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<Claims>(token, &self.dec, &validation)
            .map(|data| data.claims)
            .map_err(|_| Error::Unauthenticated)
    }

    /// Issue a fresh token pair and (re)open the user's session. Any access
    /// token issued earlier stops validating.
    pub fn issue(&self, user: &User, now: u64) -> Result<TokenPair> {
        let (access, access_expires_at) =
            self.sign(user.id, user.role, TokenKind::Access, self.cfg.access_ttl_secs, now)?;
        let (refresh, refresh_expires_at) =
            self.sign(user.id, user.role, TokenKind::Refresh, self.cfg.refresh_ttl_secs, now)?;

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            user.id,
            AuthSession {
                access_fp: fingerprint(&access),
                last_activity: now,
            },
        );

        Ok(TokenPair {
            access,
            access_expires_at,
            refresh,
            refresh_expires_at,
        })
    }

    /// Validate an access token against signature, expiry, and the live
    /// session fingerprint. Touches last-activity on success.
    pub fn validate_access(&self, token: &str, now: u64) -> Result<AuthUser> {
        let claims = self.decode(token)?;
        if claims.typ != TokenKind::Access {
            return Err(Error::Unauthenticated);
        }

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.get_mut(&claims.sub).ok_or(Error::Unauthenticated)?;
        if session.access_fp != fingerprint(token) {
            return Err(Error::Unauthenticated);
        }
        session.last_activity = now;

        Ok(AuthUser {
            id: claims.sub,
            role: claims.role,
        })
    }

    /// Identity if a valid token is present; anonymous callers pass through.
    pub fn resolve_optional(&self, token: Option<&str>, now: u64) -> Option<AuthUser> {
        token.and_then(|t| self.validate_access(t, now).ok())
    }

    /// Exchange a refresh token for a new access token. Requires a live
    /// session; a logged-out refresh token is dead.
    pub fn refresh(&self, refresh_token: &str, now: u64) -> Result<RefreshedAccess> {
        let claims = self.decode(refresh_token)?;
        if claims.typ != TokenKind::Refresh {
            return Err(Error::Unauthenticated);
        }

        {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if !sessions.contains_key(&claims.sub) {
                return Err(Error::Unauthenticated);
            }
        }

        let (access, access_expires_at) =
            self.sign(claims.sub, claims.role, TokenKind::Access, self.cfg.access_ttl_secs, now)?;

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            claims.sub,
            AuthSession {
                access_fp: fingerprint(&access),
                last_activity: now,
            },
        );

        Ok(RefreshedAccess {
            user_id: claims.sub,
            access,
            access_expires_at,
        })
    }

    pub fn logout(&self, user_id: UserId) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&user_id);
    }

    /// Drop sessions idle beyond the configured threshold. Returns how many
    /// were reaped.
    pub fn reap(&self, now: u64) -> usize {
        let idle_ms = self.cfg.session_idle_secs * 1_000;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| s.last_activity + idle_ms > now);
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// =============================================================================
// EXTERNAL-PLATFORM LOGIN
// =============================================================================

/// Signed identity payload from the messaging platform: a flat field set plus
/// a hex HMAC over the canonical `key=value` lines.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformPayload {
    pub fields: BTreeMap<String, String>,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct PlatformIdentity {
    pub external_id: String,
    pub handle: String,
}

/// Validate the platform signature before trusting any field.
///
/// Canonical form: fields sorted by key, rendered `key=value`, joined with
/// `\n`; MAC key is `SHA-256(platform_secret)`. The `auth_date` field, when
/// present, bounds replay age.
pub fn verify_platform_payload(
    payload: &PlatformPayload,
    platform_secret: &str,
    now: u64,
) -> Result<PlatformIdentity> {
    if platform_secret.is_empty() {
        return Err(Error::FailedPrecondition(
            "platform login is not configured".into(),
        ));
    }

    let data_check: String = payload
        .fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");

    let key = Sha256::digest(platform_secret.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(data_check.as_bytes());

    let claimed = hex::decode(&payload.hash).map_err(|_| Error::Unauthenticated)?;
    mac.verify_slice(&claimed).map_err(|_| Error::Unauthenticated)?;

    if let Some(auth_date) = payload.fields.get("auth_date") {
        let at: u64 = auth_date.parse().map_err(|_| {
            Error::InvalidArgument("auth_date must be a unix timestamp".into())
        })?;
        if at * 1_000 + PLATFORM_AUTH_MAX_AGE_SECS * 1_000 < now {
            return Err(Error::Unauthenticated);
        }
    }

    let external_id = payload
        .fields
        .get("id")
        .cloned()
        .ok_or_else(|| Error::InvalidArgument("missing id field".into()))?;
    let handle = payload
        .fields
        .get("username")
        .or_else(|| payload.fields.get("first_name"))
        .cloned()
        .unwrap_or_else(|| format!("player-{external_id}"));

    Ok(PlatformIdentity {
        external_id,
        handle,
    })
}

// =============================================================================
// PASSWORDS
// =============================================================================

pub fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
    let salt = SaltString::generate(&mut OsRng);
    argon2::Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::internal(format!("password hash: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    match PasswordHash::new(hash) {
        Ok(parsed) => argon2::Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Sign a platform payload the way the platform would. Test-only helper kept
/// here so the canonical form lives in one place.
pub fn sign_platform_fields(fields: &BTreeMap<String, String>, platform_secret: &str) -> String {
    let data_check: String = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    let key = Sha256::digest(platform_secret.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(data_check.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
