//! Client-credential authentication and the bearer token cache.

use super::Token;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Lifetime assumed for a freshly issued token; the authenticate endpoint
/// does not report one.
pub const TOKEN_TTL_MINUTES: i64 = 60;

/// Tokens are refreshed this long before they expire.
pub const REFRESH_GRACE_MINUTES: i64 = 10;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Request body for `POST /api/v1/authenticate`.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TokenCache
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TokenCache {
    token: Option<Token>,
    ttl: Duration,
    grace: Duration,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self {
            token: None,
            ttl: Duration::minutes(TOKEN_TTL_MINUTES),
            grace: Duration::minutes(REFRESH_GRACE_MINUTES),
        }
    }
}

impl TokenCache {
    /// The cached bearer value, unless it is missing or inside the refresh
    /// window at `now`.
    pub fn valid_at(&self, now: DateTime<Utc>) -> Option<&str> {
        self.token
            .as_ref()
            .filter(|t| now + self.grace < t.expires_at)
            .map(|t| t.value.as_str())
    }

    /// Remember a token issued at `issued_at`.
    pub fn store(&mut self, value: String, issued_at: DateTime<Utc>) -> Token {
        let token = Token {
            value,
            expires_at: issued_at + self.ttl,
        };
        debug!(expires_at = %token.expires_at.format("%Y-%m-%d %H:%M:%S UTC"), "token cached");
        self.token = Some(token.clone());
        token
    }

    /// Drop the cached token so the next call re-authenticates.
    pub fn invalidate(&mut self) {
        self.token = None;
    }
}

/// The authenticate endpoint answers with a bare JSON string; tolerate a
/// plain-text body too.
pub fn parse_token_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    let value = serde_json::from_str::<String>(trimmed)
        .unwrap_or_else(|_| trimmed.trim_matches('"').to_string());
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_valid() {
        let mut cache = TokenCache::default();
        let now = Utc::now();
        cache.store("tok".into(), now);
        assert_eq!(cache.valid_at(now), Some("tok"));
        assert_eq!(cache.valid_at(now + Duration::minutes(49)), Some("tok"));
    }

    #[test]
    fn token_inside_refresh_window_is_stale() {
        let mut cache = TokenCache::default();
        let now = Utc::now();
        cache.store("tok".into(), now);
        assert_eq!(cache.valid_at(now + Duration::minutes(50)), None);
        assert_eq!(cache.valid_at(now + Duration::minutes(90)), None);
    }

    #[test]
    fn invalidate_forgets_token() {
        let mut cache = TokenCache::default();
        cache.store("tok".into(), Utc::now());
        cache.invalidate();
        assert!(cache.valid_at(Utc::now()).is_none());
    }

    #[test]
    fn token_body_forms() {
        assert_eq!(parse_token_body("\"abc.def\""), Some("abc.def".into()));
        assert_eq!(parse_token_body("abc.def\n"), Some("abc.def".into()));
        assert_eq!(parse_token_body("\"\""), None);
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let c = Credentials {
            client_id: "id".into(),
            client_secret: "hunter2".into(),
        };
        assert!(!format!("{c:?}").contains("hunter2"));
        let body = serde_json::to_string(&c).unwrap();
        assert!(body.contains("hunter2"));
    }
}
