//! Runtime configuration from `PKM_*` environment variables.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_DATA_DIR: &str = ".pkm_db";
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_ISSUER: &str = "pkm";
pub const DEFAULT_ACCESS_TTL_MINUTES: i64 = 15;
pub const DEFAULT_REFRESH_TTL_DAYS: i64 = 14;

const ENV_DATA_DIR: &str = "PKM_DATA_DIR";
const ENV_BIND: &str = "PKM_BIND";
const ENV_JWT_SECRET: &str = "PKM_JWT_SECRET";
const ENV_JWT_ISSUER: &str = "PKM_JWT_ISSUER";
const ENV_ACCESS_TTL: &str = "PKM_ACCESS_TTL_MINUTES";
const ENV_REFRESH_TTL: &str = "PKM_REFRESH_TTL_DAYS";
const ENV_COOKIE_SECURE: &str = "PKM_COOKIE_SECURE";

#[derive(Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind: String,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
    pub cookie_secure: bool,
}

// Keeps the secret out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("bind", &self.bind)
            .field("jwt_issuer", &self.jwt_issuer)
            .field("access_ttl_minutes", &self.access_ttl_minutes)
            .field("refresh_ttl_days", &self.refresh_ttl_days)
            .field("cookie_secure", &self.cookie_secure)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Self {
        let jwt_secret = match read_non_empty_env(ENV_JWT_SECRET) {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "{} not set; using a random secret, sessions will not survive a restart",
                    ENV_JWT_SECRET
                );
                random_secret()
            }
        };

        Self {
            data_dir: read_non_empty_env(ENV_DATA_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            bind: read_non_empty_env(ENV_BIND).unwrap_or_else(|| DEFAULT_BIND.to_string()),
            jwt_secret,
            jwt_issuer: read_non_empty_env(ENV_JWT_ISSUER)
                .unwrap_or_else(|| DEFAULT_ISSUER.to_string()),
            access_ttl_minutes: positive_env(ENV_ACCESS_TTL, DEFAULT_ACCESS_TTL_MINUTES),
            refresh_ttl_days: positive_env(ENV_REFRESH_TTL, DEFAULT_REFRESH_TTL_DAYS),
            cookie_secure: parse_env(ENV_COOKIE_SECURE, true),
        }
    }

    /// Fixed configuration rooted at `path`, for tests.
    pub fn for_data_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: path.into(),
            bind: DEFAULT_BIND.to_string(),
            jwt_secret: "test-secret-do-not-use-in-production".to_string(),
            jwt_issuer: DEFAULT_ISSUER.to_string(),
            access_ttl_minutes: DEFAULT_ACCESS_TTL_MINUTES,
            refresh_ttl_days: DEFAULT_REFRESH_TTL_DAYS,
            cookie_secure: false,
        }
    }
}

fn read_non_empty_env(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_env<T: FromStr + std::fmt::Debug>(key: &str, default: T) -> T {
    match read_non_empty_env(key) {
        None => default,
        Some(raw) => parse_or_default(key, &raw, default),
    }
}

fn positive_env(key: &str, default: i64) -> i64 {
    let value = parse_env(key, default);
    if value > 0 {
        value
    } else {
        tracing::warn!(key, value, default, "non-positive value, using default");
        default
    }
}

fn parse_or_default<T: FromStr + std::fmt::Debug>(key: &str, raw: &str, default: T) -> T {
    raw.parse().unwrap_or_else(|_| {
        tracing::warn!(key, raw, ?default, "unparsable value, using default");
        default
    })
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
