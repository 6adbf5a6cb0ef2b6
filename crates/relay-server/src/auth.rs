//! Connection authentication.
//!
//! Tokens are HS256 JWTs signed with the shared secret from `auth.secret`.
//! A token may arrive as `?token=`, as `Authorization: Bearer`, or in the
//! first client frame.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use relay_core::RelayError;
use relay_settings::AuthSettings;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

/// Why a token was rejected.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented but one is required.
    #[error("missing token")]
    MissingToken,
    /// Signature, expiry or structure check failed.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// `iat` lies in the future.
    #[error("token issued in the future")]
    NotYetValid,
    /// The client did not authenticate in time.
    #[error("authentication timed out")]
    Timeout,
}

impl From<AuthError> for RelayError {
    fn from(err: AuthError) -> Self {
        RelayError::AuthenticationFailed(err.to_string())
    }
}

/// Who is on the other end of a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    /// Token subject, absent for anonymous connections.
    pub subject: Option<String>,
}

impl Identity {
    /// Identity for connections accepted without a token.
    pub fn anonymous() -> Self {
        Self { subject: None }
    }

    /// Whether no token backs this identity.
    pub fn is_anonymous(&self) -> bool {
        self.subject.is_none()
    }
}

/// Verifies opaque tokens.
pub trait TokenValidator: Send + Sync {
    /// Check `token` and return the identity it carries.
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iat: Option<u64>,
}

/// HS256 JWT validator.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Validator for tokens signed with `secret`, tolerating `leeway_secs`
    /// of clock skew.
    pub fn new(secret: &SecretString, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        if let Some(iat) = data.claims.iat {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if iat > now.saturating_add(self.validation.leeway) {
                return Err(AuthError::NotYetValid);
            }
        }
        Ok(Identity {
            subject: Some(data.claims.sub.unwrap_or_default()),
        })
    }
}

/// Connection-level authentication policy.
#[derive(Clone)]
pub struct Authenticator {
    validator: Option<Arc<dyn TokenValidator>>,
    required: bool,
}

impl Authenticator {
    /// Policy from explicit parts.
    pub fn new(validator: Option<Arc<dyn TokenValidator>>, required: bool) -> Self {
        Self { validator, required }
    }

    /// Accept everyone anonymously.
    pub fn disabled() -> Self {
        Self::new(None, false)
    }

    /// Policy from settings. A configured secret enables JWT validation.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        let validator = settings.secret.as_ref().map(|secret| {
            Arc::new(JwtValidator::new(secret, settings.leeway_secs)) as Arc<dyn TokenValidator>
        });
        Self::new(validator, settings.required)
    }

    /// Whether connections without a token are refused.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Decide on a connection given the token it presented, if any.
    ///
    /// Presented tokens are always checked when a validator is configured,
    /// even if authentication is optional.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match (token.filter(|t| !t.is_empty()), &self.validator) {
            (Some(token), Some(validator)) => validator.validate(token),
            (None, _) if self.required => Err(AuthError::MissingToken),
            _ => Ok(Identity::anonymous()),
        }
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::disabled()
    }
}
