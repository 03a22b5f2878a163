//! Authentication collaborator interfaces.
//!
//! The pipeline never mints credentials itself. It consumes an
//! [`AuthProvider`] that yields the current shared-access credential and can
//! produce a renewed one on demand; connection-string parsing and signing
//! live with the provider implementation, outside this crate's scope.

use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::RwLock;

/// A shared-access credential with a fixed expiry.
#[derive(Clone)]
pub struct SasToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl SasToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Credential string presented to the transport (password field for the
    /// pub/sub client, Authorization header for HTTP).
    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Remaining lifetime. Negative once expired.
    pub fn time_to_live(&self) -> ChronoDuration {
        self.expires_at - Utc::now()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

// The token string is credential material; keep it out of Debug output.
impl fmt::Debug for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasToken")
            .field("token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Yields the current credential and produces a renewed one on demand.
///
/// `renew_token` must refresh the provider's notion of "current" before
/// returning: the transport reads `current_token` at every connect, including
/// the reconnect forced after a renewal.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    fn current_token(&self) -> SasToken;

    async fn renew_token(&self) -> DeviceResult<SasToken>;
}

/// Provider wrapping a single long-lived token.
///
/// Renewal hands back the same token while it remains valid; once it has
/// expired there is nothing this provider can do but report it.
pub struct StaticAuthProvider {
    token: RwLock<SasToken>,
}

impl StaticAuthProvider {
    pub fn new(token: SasToken) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Replace the stored token, e.g. when the owning application obtained a
    /// fresh credential out of band.
    pub fn replace(&self, token: SasToken) {
        *self.token.write().expect("auth token lock poisoned") = token;
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    fn current_token(&self) -> SasToken {
        self.token.read().expect("auth token lock poisoned").clone()
    }

    async fn renew_token(&self) -> DeviceResult<SasToken> {
        let token = self.current_token();
        if token.is_expired() {
            return Err(DeviceError::unauthorized(
                "static credential expired and cannot be renewed",
            ));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_expiring_in(secs: i64) -> SasToken {
        SasToken::new("SharedAccessSignature sig=abc", Utc::now() + ChronoDuration::seconds(secs))
    }

    #[test]
    fn test_token_expiry() {
        assert!(!token_expiring_in(60).is_expired());
        assert!(token_expiring_in(-1).is_expired());
    }

    #[test]
    fn test_debug_redacts_token() {
        let formatted = format!("{:?}", token_expiring_in(60));
        assert!(!formatted.contains("sig=abc"));
        assert!(formatted.contains("***"));
    }

    #[tokio::test]
    async fn test_static_provider_renews_while_valid() {
        let provider = StaticAuthProvider::new(token_expiring_in(3600));
        let renewed = provider.renew_token().await.unwrap();
        assert_eq!(renewed.as_str(), provider.current_token().as_str());
    }

    #[tokio::test]
    async fn test_static_provider_fails_when_expired() {
        let provider = StaticAuthProvider::new(token_expiring_in(-10));
        let result = provider.renew_token().await;
        assert!(matches!(result, Err(DeviceError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_replace_updates_current() {
        let provider = StaticAuthProvider::new(token_expiring_in(10));
        let fresh = SasToken::new("newer", Utc::now() + ChronoDuration::seconds(7200));
        provider.replace(fresh);
        assert_eq!(provider.current_token().as_str(), "newer");
    }
}
