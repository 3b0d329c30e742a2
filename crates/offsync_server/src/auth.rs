//! Authentication support for the sync server.
//!
//! The sync core only needs to know *who* is calling. A `PrincipalProvider`
//! turns the request's bearer token into a `Principal`; the reconciler uses
//! it to stamp ownership fields on created entities.
//!
//! ## Token Format
//!
//! `TokenValidator` issues HMAC-SHA256 tokens of three dot-separated parts:
//! - hex-encoded user id
//! - issue time (Unix millis, decimal)
//! - hex-encoded signature over `user_id || issued_at (big-endian)`

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    /// User identifier.
    pub user_id: String,
}

impl Principal {
    /// Creates a principal.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Resolves the caller of a request.
pub trait PrincipalProvider: Send + Sync {
    /// Authenticates the bearer token of a request.
    fn authenticate(&self, bearer: Option<&str>) -> ServerResult<Principal>;
}

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60), // 24 hours
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates signed bearer tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `user_id`, issued now.
    pub fn create_token(&self, user_id: &str) -> ServerResult<String> {
        self.create_token_at(user_id, unix_millis())
    }

    fn create_token_at(&self, user_id: &str, issued_at: u64) -> ServerResult<String> {
        let signature = self.sign(user_id.as_bytes(), issued_at)?;
        Ok(format!(
            "{}.{}.{}",
            hex::encode(user_id),
            issued_at,
            hex::encode(signature)
        ))
    }

    /// Validates a token and returns its principal.
    pub fn validate_token(&self, token: &str) -> ServerResult<Principal> {
        let invalid = |reason: &str| ServerError::AuthenticationFailed(reason.to_string());

        let mut parts = token.trim().splitn(3, '.');
        let (Some(user), Some(issued), Some(signature)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("malformed token"));
        };

        let user_bytes = hex::decode(user).map_err(|_| invalid("malformed token"))?;
        let issued_at: u64 = issued.parse().map_err(|_| invalid("malformed token"))?;
        let signature = hex::decode(signature).map_err(|_| invalid("malformed token"))?;

        // Verify signature
        let mut mac = self.mac()?;
        mac.update(&user_bytes);
        mac.update(&issued_at.to_be_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| invalid("invalid signature"))?;

        // Check expiration
        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if unix_millis() > issued_at.saturating_add(expiry_millis) {
            return Err(invalid("token expired"));
        }

        let user_id = String::from_utf8(user_bytes).map_err(|_| invalid("malformed token"))?;
        Ok(Principal { user_id })
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))
    }

    /// Signs data with HMAC-SHA256.
    fn sign(&self, user_id: &[u8], issued_at: u64) -> ServerResult<[u8; 32]> {
        let mut mac = self.mac()?;
        mac.update(user_id);
        mac.update(&issued_at.to_be_bytes());
        Ok(mac.finalize().into_bytes().into())
    }
}

impl PrincipalProvider for TokenValidator {
    fn authenticate(&self, bearer: Option<&str>) -> ServerResult<Principal> {
        let token = bearer
            .ok_or_else(|| ServerError::AuthenticationFailed("missing bearer token".into()))?;
        self.validate_token(token)
    }
}

/// Provider that treats every request as one fixed principal.
///
/// Used when authentication is disabled and in tests.
#[derive(Debug, Clone)]
pub struct StaticPrincipal {
    principal: Principal,
}

impl StaticPrincipal {
    /// Creates a provider for `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            principal: Principal::new(user_id),
        }
    }
}

impl PrincipalProvider for StaticPrincipal {
    fn authenticate(&self, _bearer: Option<&str>) -> ServerResult<Principal> {
        Ok(self.principal.clone())
    }
}

/// Provider that rejects every request.
///
/// Installed when authentication is required but no secret is configured.
#[derive(Debug, Clone, Default)]
pub struct DenyAll;

impl PrincipalProvider for DenyAll {
    fn authenticate(&self, _bearer: Option<&str>) -> ServerResult<Principal> {
        Err(ServerError::AuthenticationFailed(
            "authentication required but no secret is configured".into(),
        ))
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token("user-1").unwrap();
        assert_eq!(token.split('.').count(), 3);

        let principal = validator.validate_token(&token).unwrap();
        assert_eq!(principal.user_id, "user-1");
        assert_eq!(
            validator.authenticate(Some(&token)).unwrap(),
            Principal::new("user-1")
        );
    }

    #[test]
    fn reject_missing_and_malformed() {
        let validator = validator();
        assert!(validator.authenticate(None).is_err());
        assert!(validator.validate_token("garbage").is_err());
        assert!(validator.validate_token("zz.1.00").is_err());
    }

    #[test]
    fn reject_other_secret() {
        let token = validator().create_token("user-1").unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token("user-1").unwrap();
        let forged = token.replacen(&hex::encode("user-1"), &hex::encode("admin"), 1);
        assert!(matches!(
            validator.validate_token(&forged),
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec())
                .with_expiry(Duration::from_secs(60)),
        );
        let token = validator
            .create_token_at("user-1", unix_millis() - 61_000)
            .unwrap();
        let err = validator.validate_token(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn deny_all_rejects_any_token() {
        let token = validator().create_token("user-1").unwrap();
        assert!(DenyAll.authenticate(None).is_err());
        assert!(matches!(
            DenyAll.authenticate(Some(&token)),
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn static_principal() {
        let provider = StaticPrincipal::new("tester");
        assert_eq!(provider.authenticate(None).unwrap().user_id, "tester");
    }
}
