//! Authentication: the single account, JWT access tokens, and rotating
//! refresh tokens.
//!
//! Access tokens are short-lived HS256 JWTs carried in the `Authorization`
//! header. Refresh tokens are opaque random strings; only their SHA-256 hash
//! is stored. Each refresh rotates the token, and every token produced from
//! one login shares a family id so a replayed token can revoke the lot.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{RefreshRecord, TokenPair, User};
use crate::store::GraphStore;
use crate::AppState;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

/// Cookie carrying the refresh token.
pub const REFRESH_COOKIE: &str = "pkm_refresh";
pub const REFRESH_COOKIE_PATH: &str = "/api/auth";

const AUTHORIZATION_BEARER_PREFIX: &str = "Bearer ";
/// Maximum bearer token length (8 KiB).
const MAX_TOKEN_LENGTH: usize = 8192;
/// Tolerated clock skew for `iat`, in seconds.
const MAX_IAT_SKEW_SECS: i64 = 300;
const ACCESS_TOKEN_TYPE: &str = "access";
const REFRESH_TOKEN_BYTES: usize = 32;

const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;
const MIN_PASSWORD_LEN: usize = 8;

// ============================================================================
// Rate Limiting
// ============================================================================

/// Tracks login failures for rate limiting with exponential backoff.
#[derive(Debug, Default)]
pub struct LoginRateLimit {
    pub failures: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LoginRateLimit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked_until.is_some_and(|until| Utc::now() < until)
    }

    /// Seconds until the lock lifts, rounded up; 0 when unlocked.
    pub fn retry_after_secs(&self) -> u64 {
        match self.locked_until {
            Some(until) => {
                let ms = (until - Utc::now()).num_milliseconds();
                if ms <= 0 {
                    0
                } else {
                    ((ms + 999) / 1000) as u64
                }
            }
            None => 0,
        }
    }

    /// Record a failed login attempt. After 5 failures, apply exponential backoff capped at 64s.
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= 5 {
            let delay_secs = std::cmp::min(1i64 << (self.failures - 5).min(6), 64);
            self.locked_until = Some(Utc::now() + Duration::seconds(delay_secs));
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.locked_until = None;
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Signing material and lifetimes derived from `Config`.
#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl AuthKeys {
    pub fn from_config(config: &Config) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            issuer: config.jwt_issuer.clone(),
            access_ttl: Duration::minutes(config.access_ttl_minutes),
            refresh_ttl: Duration::days(config.refresh_ttl_days),
        }
    }
}

// ============================================================================
// Passwords
// ============================================================================

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "stored password hash is malformed");
            false
        }
    }
}

fn validate_credentials(username: &str, password: &str) -> AppResult<()> {
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(AppError::BadRequest(format!(
            "username must be {}-{} characters",
            MIN_USERNAME_LEN, MAX_USERNAME_LEN
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(AppError::BadRequest(
            "username may only contain letters, digits, '_', '.' and '-'".into(),
        ));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

// ============================================================================
// Account
// ============================================================================

/// Create the one account. Fails with Conflict once an account exists.
pub fn register(store: &GraphStore, username: &str, password: &str) -> AppResult<User> {
    validate_credentials(username, password)?;

    let _guard = store.write_guard();
    if store.user_count() > 0 {
        return Err(AppError::Conflict("an account already exists".into()));
    }
    let user = User {
        username: username.to_string(),
        password_hash: hash_password(password)?,
        created: Utc::now(),
    };
    store.put_user(&user)?;
    tracing::info!(username, "account registered");
    Ok(user)
}

pub fn login(
    store: &GraphStore,
    keys: &AuthKeys,
    rate_limit: &Mutex<LoginRateLimit>,
    username: &str,
    password: &str,
) -> AppResult<TokenPair> {
    {
        let limit = rate_limit.lock().unwrap_or_else(|e| e.into_inner());
        if limit.is_locked() {
            return Err(AppError::TooManyRequests(limit.retry_after_secs().max(1)));
        }
    }

    let ok = match store.get_user(username)? {
        Some(user) => verify_password(password, &user.password_hash),
        None => false,
    };

    let mut limit = rate_limit.lock().unwrap_or_else(|e| e.into_inner());
    if !ok {
        limit.record_failure();
        tracing::warn!(username, failures = limit.failures, "login failed");
        return Err(AppError::Unauthorized("invalid username or password".into()));
    }
    limit.reset();
    drop(limit);

    let family = uuid::Uuid::new_v4().to_string();
    let _guard = store.write_guard();
    let pair = issue_tokens(store, keys, username, &family)?;
    tracing::info!(username, "login succeeded");
    Ok(pair)
}

// ============================================================================
// Access Tokens
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub typ: String,
}

pub fn issue_access_token(keys: &AuthKeys, username: &str) -> AppResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: username.to_string(),
        iat: now.timestamp(),
        exp: (now + keys.access_ttl).timestamp(),
        iss: keys.issuer.clone(),
        typ: ACCESS_TOKEN_TYPE.to_string(),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
        .map_err(|e| AppError::Internal(format!("token signing failed: {}", e)))
}

pub fn validate_access_token(keys: &AuthKeys, token: &str) -> AppResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.set_issuer(&[keys.issuer.as_str()]);
    validation.set_required_spec_claims(&["exp", "sub", "iss"]);

    let data = decode::<Claims>(token, &keys.decoding, &validation).map_err(|e| {
        tracing::debug!(error = %e, "access token rejected");
        AppError::Unauthorized("invalid or expired token".into())
    })?;
    let claims = data.claims;

    if claims.typ != ACCESS_TOKEN_TYPE || claims.sub.trim().is_empty() {
        return Err(AppError::Unauthorized("invalid or expired token".into()));
    }
    // Reject tokens with iat far in the future
    if claims.iat > Utc::now().timestamp() + MAX_IAT_SKEW_SECS {
        return Err(AppError::Unauthorized("invalid or expired token".into()));
    }
    Ok(claims)
}

// ============================================================================
// Refresh Tokens
// ============================================================================

pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex SHA-256 of a refresh token, used as its storage key.
pub fn hash_refresh_token(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Mint a token pair in `family` and sweep expired refresh records.
/// Callers hold the write guard.
fn issue_tokens(
    store: &GraphStore,
    keys: &AuthKeys,
    username: &str,
    family: &str,
) -> AppResult<TokenPair> {
    let purged = store.purge_expired_refresh(Utc::now())?;
    if purged > 0 {
        tracing::debug!(purged, "expired refresh tokens purged");
    }

    let access_token = issue_access_token(keys, username)?;
    let refresh_token = generate_refresh_token();
    let record = RefreshRecord {
        username: username.to_string(),
        family: family.to_string(),
        expires: Utc::now() + keys.refresh_ttl,
        revoked: false,
    };
    store.put_refresh(&hash_refresh_token(&refresh_token), &record)?;

    Ok(TokenPair {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: keys.access_ttl.num_seconds(),
        refresh_token,
        refresh_expires_in: keys.refresh_ttl.num_seconds(),
    })
}

/// Revoke every token of a family. Returns how many were newly revoked.
fn revoke_family(store: &GraphStore, family: &str) -> AppResult<usize> {
    let mut revoked = 0;
    for (hash, mut record) in store.refresh_records()? {
        if record.family == family && !record.revoked {
            record.revoked = true;
            store.put_refresh(&hash, &record)?;
            revoked += 1;
        }
    }
    Ok(revoked)
}

/// Exchange a refresh token for a new pair, retiring the presented one.
pub fn refresh(store: &GraphStore, keys: &AuthKeys, token: &str) -> AppResult<TokenPair> {
    let invalid = || AppError::Unauthorized("invalid refresh token".into());
    if token.is_empty() || token.len() > MAX_TOKEN_LENGTH {
        return Err(invalid());
    }
    let hash = hash_refresh_token(token);

    let _guard = store.write_guard();
    let mut record = store.get_refresh(&hash)?.ok_or_else(invalid)?;

    if record.revoked {
        let revoked = revoke_family(store, &record.family)?;
        tracing::warn!(
            username = %record.username,
            family = %record.family,
            revoked,
            "refresh token reused, family revoked"
        );
        return Err(invalid());
    }
    if record.expires <= Utc::now() {
        return Err(AppError::Unauthorized("refresh token expired".into()));
    }
    if store.get_user(&record.username)?.is_none() {
        return Err(invalid());
    }

    record.revoked = true;
    store.put_refresh(&hash, &record)?;
    let pair = issue_tokens(store, keys, &record.username, &record.family)?;
    tracing::debug!(username = %record.username, "refresh token rotated");
    Ok(pair)
}

/// Revoke the family of the given token. Unknown tokens are ignored.
pub fn logout(store: &GraphStore, token: &str) -> AppResult<()> {
    let _guard = store.write_guard();
    if let Some(record) = store.get_refresh(&hash_refresh_token(token))? {
        revoke_family(store, &record.family)?;
        tracing::info!(username = %record.username, "logged out");
    }
    Ok(())
}

pub fn purge_expired(store: &GraphStore) -> AppResult<usize> {
    let _guard = store.write_guard();
    let purged = store.purge_expired_refresh(Utc::now())?;
    if purged > 0 {
        tracing::info!(purged, "expired refresh tokens purged");
    }
    Ok(purged)
}

// ============================================================================
// Cookies
// ============================================================================

pub fn refresh_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE, token))
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(secure)
        .path(REFRESH_COOKIE_PATH)
        .build()
}

pub fn clear_refresh_cookie() -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE, ""))
        .path(REFRESH_COOKIE_PATH)
        .build()
}

// ============================================================================
// Extractor
// ============================================================================

/// The authenticated account, resolved from a bearer access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
}

fn extract_bearer_token(header: Option<&str>) -> AppResult<&str> {
    let header =
        header.ok_or_else(|| AppError::Unauthorized("missing authorization header".into()))?;
    let token = header
        .strip_prefix(AUTHORIZATION_BEARER_PREFIX)
        .ok_or_else(|| AppError::Unauthorized("expected a bearer token".into()))?;
    if token.is_empty() || token.len() > MAX_TOKEN_LENGTH {
        return Err(AppError::Unauthorized("expected a bearer token".into()));
    }
    Ok(token)
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = extract_bearer_token(header)?;
        let claims = validate_access_token(&state.keys, token)?;
        Ok(AuthUser {
            username: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> AuthKeys {
        AuthKeys::from_config(&Config::for_data_dir("unused"))
    }

    fn sign(keys: &AuthKeys, claims: &Claims) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &keys.encoding).unwrap()
    }

    fn claims(offset_iat: i64, offset_exp: i64) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            sub: "ada".into(),
            iat: now + offset_iat,
            exp: now + offset_exp,
            iss: "pkm".into(),
            typ: "access".into(),
        }
    }

    fn registered() -> GraphStore {
        let store = GraphStore::temporary().unwrap();
        register(&store, "ada", "correct horse").unwrap();
        store
    }

    #[test]
    fn test_rate_limit_backoff() {
        let mut limit = LoginRateLimit::new();
        for _ in 0..4 {
            limit.record_failure();
        }
        assert!(!limit.is_locked());
        limit.record_failure();
        assert!(limit.is_locked());
        assert!(limit.retry_after_secs() <= 1);

        for _ in 0..20 {
            limit.record_failure();
        }
        assert!(limit.retry_after_secs() <= 64);
        assert!(limit.retry_after_secs() > 32);

        limit.reset();
        assert!(!limit.is_locked());
        assert_eq!(limit.retry_after_secs(), 0);
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("hunter2hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2hunter2", &hash));
        assert!(!verify_password("hunter3hunter3", &hash));
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn test_register_single_account() {
        let store = registered();
        assert!(matches!(
            register(&store, "bob", "another password"),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn test_register_validation() {
        let store = GraphStore::temporary().unwrap();
        for (u, p) in [("ab", "longenough"), ("bad name", "longenough"), ("ada", "short")] {
            assert!(matches!(register(&store, u, p), Err(AppError::BadRequest(_))));
        }
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn test_login_and_lockout() {
        let store = registered();
        let keys = keys();
        let limit = Mutex::new(LoginRateLimit::new());

        let pair = login(&store, &keys, &limit, "ada", "correct horse").unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 15 * 60);
        assert_eq!(validate_access_token(&keys, &pair.access_token).unwrap().sub, "ada");

        for _ in 0..5 {
            assert!(matches!(
                login(&store, &keys, &limit, "ada", "wrong"),
                Err(AppError::Unauthorized(_))
            ));
        }
        // Locked now, even with the right password.
        assert!(matches!(
            login(&store, &keys, &limit, "ada", "correct horse"),
            Err(AppError::TooManyRequests(_))
        ));
    }

    #[test]
    fn test_unknown_user_counts_as_failure() {
        let store = registered();
        let limit = Mutex::new(LoginRateLimit::new());
        assert!(login(&store, &keys(), &limit, "eve", "correct horse").is_err());
        assert_eq!(limit.lock().unwrap().failures, 1);
    }

    #[test]
    fn test_validate_rejects_bad_tokens() {
        let keys = keys();
        assert!(validate_access_token(&keys, &sign(&keys, &claims(0, 600))).is_ok());
        // expired beyond leeway
        assert!(validate_access_token(&keys, &sign(&keys, &claims(-7200, -3600))).is_err());
        // issued in the future
        assert!(validate_access_token(&keys, &sign(&keys, &claims(3600, 7200))).is_err());

        let mut wrong_iss = claims(0, 600);
        wrong_iss.iss = "other".into();
        assert!(validate_access_token(&keys, &sign(&keys, &wrong_iss)).is_err());

        let mut wrong_typ = claims(0, 600);
        wrong_typ.typ = "refresh".into();
        assert!(validate_access_token(&keys, &sign(&keys, &wrong_typ)).is_err());

        let mut other = Config::for_data_dir("unused");
        other.jwt_secret = "a-different-secret".into();
        let forged = sign(&AuthKeys::from_config(&other), &claims(0, 600));
        assert!(validate_access_token(&keys, &forged).is_err());

        assert!(validate_access_token(&keys, "not.a.jwt").is_err());
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert!(extract_bearer_token(None).is_err());
        assert!(extract_bearer_token(Some("Basic abc")).is_err());
        assert!(extract_bearer_token(Some("Bearer ")).is_err());
        let huge = format!("Bearer {}", "x".repeat(MAX_TOKEN_LENGTH + 1));
        assert!(extract_bearer_token(Some(&huge)).is_err());
    }

    #[test]
    fn test_refresh_token_shape() {
        let token = generate_refresh_token();
        assert_eq!(token.len(), 43);
        assert!(!token.contains('=') && !token.contains('+') && !token.contains('/'));
        assert_eq!(hash_refresh_token(&token).len(), 64);
        assert_ne!(hash_refresh_token(&token), token);
    }

    #[test]
    fn test_refresh_rotates() {
        let store = registered();
        let keys = keys();
        let limit = Mutex::new(LoginRateLimit::new());
        let first = login(&store, &keys, &limit, "ada", "correct horse").unwrap();

        let second = refresh(&store, &keys, &first.refresh_token).unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        let old = store.get_refresh(&hash_refresh_token(&first.refresh_token)).unwrap().unwrap();
        let new = store.get_refresh(&hash_refresh_token(&second.refresh_token)).unwrap().unwrap();
        assert!(old.revoked);
        assert!(!new.revoked);
        assert_eq!(old.family, new.family);
    }

    #[test]
    fn test_refresh_reuse_revokes_family() {
        let store = registered();
        let keys = keys();
        let limit = Mutex::new(LoginRateLimit::new());
        let first = login(&store, &keys, &limit, "ada", "correct horse").unwrap();
        let second = refresh(&store, &keys, &first.refresh_token).unwrap();

        assert!(matches!(
            refresh(&store, &keys, &first.refresh_token),
            Err(AppError::Unauthorized(_))
        ));
        // The legitimate successor is dead too.
        assert!(refresh(&store, &keys, &second.refresh_token).is_err());

        // Another login is a separate family and unaffected.
        let other = login(&store, &keys, &limit, "ada", "correct horse").unwrap();
        assert!(refresh(&store, &keys, &other.refresh_token).is_ok());
    }

    #[test]
    fn test_refresh_expired_and_unknown() {
        let store = registered();
        let keys = keys();
        assert!(refresh(&store, &keys, "nonsense").is_err());
        assert!(refresh(&store, &keys, "").is_err());

        let token = generate_refresh_token();
        store
            .put_refresh(
                &hash_refresh_token(&token),
                &RefreshRecord {
                    username: "ada".into(),
                    family: "f".into(),
                    expires: Utc::now() - Duration::minutes(1),
                    revoked: false,
                },
            )
            .unwrap();
        assert!(matches!(
            refresh(&store, &keys, &token),
            Err(AppError::Unauthorized(_))
        ));
        assert_eq!(purge_expired(&store).unwrap(), 1);
        assert!(store.get_refresh(&hash_refresh_token(&token)).unwrap().is_none());
    }

    #[test]
    fn test_issuing_tokens_purges_expired_records() {
        let store = registered();
        let keys = keys();
        let limit = Mutex::new(LoginRateLimit::new());
        let stale = generate_refresh_token();
        store
            .put_refresh(
                &hash_refresh_token(&stale),
                &RefreshRecord {
                    username: "ada".into(),
                    family: "old".into(),
                    expires: Utc::now() - Duration::days(1),
                    revoked: true,
                },
            )
            .unwrap();

        let pair = login(&store, &keys, &limit, "ada", "correct horse").unwrap();
        assert!(store.get_refresh(&hash_refresh_token(&stale)).unwrap().is_none());

        store
            .put_refresh(
                &hash_refresh_token(&stale),
                &RefreshRecord {
                    username: "ada".into(),
                    family: "old".into(),
                    expires: Utc::now() - Duration::days(1),
                    revoked: false,
                },
            )
            .unwrap();
        refresh(&store, &keys, &pair.refresh_token).unwrap();
        assert!(store.get_refresh(&hash_refresh_token(&stale)).unwrap().is_none());
        // The retired login token and its successor remain.
        assert_eq!(purge_expired(&store).unwrap(), 0);
        assert_eq!(store.refresh_records().unwrap().len(), 2);
    }

    #[test]
    fn test_logout_revokes() {
        let store = registered();
        let keys = keys();
        let limit = Mutex::new(LoginRateLimit::new());
        let pair = login(&store, &keys, &limit, "ada", "correct horse").unwrap();

        logout(&store, &pair.refresh_token).unwrap();
        assert!(refresh(&store, &keys, &pair.refresh_token).is_err());
        logout(&store, "unknown").unwrap();
    }

    #[test]
    fn test_refresh_cookie_attributes() {
        let cookie = refresh_cookie("tok".into(), true);
        assert_eq!(cookie.name(), REFRESH_COOKIE);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.path(), Some(REFRESH_COOKIE_PATH));
    }
}
