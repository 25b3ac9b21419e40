//! Handshake authentication.
//!
//! Every connection must present a signed, unexpired HS256 token before the
//! WebSocket is admitted. The decoded claims become the connection's
//! [`Identity`].

use crate::config::AuthConfig;
use circle_relay_core::Identity;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Display name used when the token carries none.
pub const ANONYMOUS: &str = "Anonymous";

/// Authentication failures. All of them reject the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
}

impl AuthError {
    /// Short label used for metrics.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
        }
    }
}

/// Claims read from the token. Only `exp` is mandatory at decode time; the
/// user id may come from any of the common claim names.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default, rename = "userId")]
    user_id_camel: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl Claims {
    fn into_identity(self) -> Option<Identity> {
        let id = [self.sub, self.id, self.user_id, self.user_id_camel]
            .into_iter()
            .flatten()
            .find_map(claim_to_string)?;
        let name = [self.name, self.username, self.display_name]
            .into_iter()
            .flatten()
            .find(|n| !n.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string());
        Some(Identity::new(id, name))
    }
}

fn claim_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Verifies handshake tokens against the shared secret.
#[derive(Clone)]
pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway_secs;
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience.as_str()]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }

    /// Pick the token out of the handshake.
    ///
    /// An `Authorization: Bearer` header wins over the `token` query
    /// parameter.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingToken`] if neither carries a token.
    pub fn extract_token<'a>(
        authorization: Option<&'a str>,
        query_token: Option<&'a str>,
    ) -> Result<&'a str, AuthError> {
        let from_header = authorization
            .map(str::trim)
            .and_then(|raw| raw.strip_prefix("Bearer "))
            .map(str::trim);

        from_header
            .into_iter()
            .chain(query_token.map(str::trim))
            .find(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)
    }

    /// Verify a token and return the identity it asserts.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenExpired`] for expired tokens and
    /// [`AuthError::InvalidToken`] for anything else that fails verification
    /// or carries no user id.
    pub fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(decoded) => decoded.claims,
            Err(error) => match error.kind() {
                ErrorKind::ExpiredSignature => return Err(AuthError::TokenExpired),
                _ => return Err(AuthError::InvalidToken),
            },
        };

        claims.into_identity().ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "relay-test-secret";

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn make_token(claims: Value, key: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .expect("token should encode")
    }

    fn authenticator() -> Authenticator {
        Authenticator::from_config(&AuthConfig {
            secret: SECRET.to_string(),
            leeway_secs: 0,
            issuer: None,
            audience: None,
        })
    }

    #[test]
    fn valid_token_yields_identity() {
        let token = make_token(
            json!({"sub": "user-1", "name": "Alice", "exp": now() + 60}),
            SECRET,
        );
        assert_eq!(
            authenticator().authenticate(&token),
            Ok(Identity::new("user-1", "Alice"))
        );
    }

    #[test]
    fn alternate_claim_names() {
        let token = make_token(
            json!({"id": 17, "username": "bob", "exp": now() + 60}),
            SECRET,
        );
        assert_eq!(
            authenticator().authenticate(&token),
            Ok(Identity::new("17", "bob"))
        );

        let token = make_token(json!({"userId": "u-9", "exp": now() + 60}), SECRET);
        assert_eq!(
            authenticator().authenticate(&token),
            Ok(Identity::new("u-9", ANONYMOUS))
        );
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = make_token(json!({"sub": "user-1", "exp": now() + 60}), "other-secret");
        assert_eq!(
            authenticator().authenticate(&token),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = make_token(json!({"sub": "user-1", "exp": now() - 30}), SECRET);
        assert_eq!(
            authenticator().authenticate(&token),
            Err(AuthError::TokenExpired)
        );
    }

    #[test]
    fn token_without_expiry_or_subject_is_invalid() {
        let token = make_token(json!({"sub": "user-1"}), SECRET);
        assert_eq!(
            authenticator().authenticate(&token),
            Err(AuthError::InvalidToken)
        );

        let token = make_token(json!({"name": "Nobody", "exp": now() + 60}), SECRET);
        assert_eq!(
            authenticator().authenticate(&token),
            Err(AuthError::InvalidToken)
        );

        assert_eq!(
            authenticator().authenticate("not-a-jwt"),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn issuer_is_enforced_when_configured() {
        let authenticator = Authenticator::from_config(&AuthConfig {
            secret: SECRET.to_string(),
            leeway_secs: 0,
            issuer: Some("https://auth.example.com".to_string()),
            audience: None,
        });

        let good = make_token(
            json!({"sub": "u", "iss": "https://auth.example.com", "exp": now() + 60}),
            SECRET,
        );
        let bad = make_token(
            json!({"sub": "u", "iss": "https://evil.example.com", "exp": now() + 60}),
            SECRET,
        );
        assert!(authenticator.authenticate(&good).is_ok());
        assert_eq!(
            authenticator.authenticate(&bad),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn token_extraction() {
        assert_eq!(
            Authenticator::extract_token(None, None),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            Authenticator::extract_token(Some("Bearer abc"), Some("xyz")),
            Ok("abc")
        );
        assert_eq!(
            Authenticator::extract_token(Some("Basic abc"), Some("xyz")),
            Ok("xyz")
        );
        assert_eq!(
            Authenticator::extract_token(Some("Bearer   "), Some("  ")),
            Err(AuthError::MissingToken)
        );
    }
}
