// Copyright 2024. The Tari Project

//! Session verification for the stream endpoint
//!
//! Sign-in happens at the external identity provider. The provider hands the
//! browser a signed session token; this module only checks that token and
//! extracts the user id it was issued for.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LOG_TARGET: &str = "teamup::realtime::session";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session token supplied")]
    MissingToken,
    #[error("invalid session token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("session token has no subject")]
    MissingSubject,
}

/// Resolves a session token to the id of the user it belongs to
#[async_trait::async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, SessionError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Verifies HS256 tokens signed with the identity provider's shared secret
pub struct JwtSessionVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtSessionVerifier {
    pub fn new(secret: &[u8], audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait::async_trait]
impl SessionVerifier for JwtSessionVerifier {
    async fn verify(&self, token: &str) -> Result<String, SessionError> {
        if token.is_empty() {
            return Err(SessionError::MissingToken);
        }

        let data = decode::<SessionClaims>(token, &self.key, &self.validation).map_err(|e| {
            log::debug!(target: LOG_TARGET, "Rejected session token: {}", e);
            SessionError::InvalidToken(e)
        })?;

        if data.claims.sub.is_empty() {
            return Err(SessionError::MissingSubject);
        }
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret-with-enough-length-123";

    fn token(sub: &str, exp_offset: i64, aud: Option<&str>) -> String {
        let claims = SessionClaims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            aud: aud.map(str::to_string),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_yields_subject() {
        let verifier = JwtSessionVerifier::new(SECRET, None);
        assert_eq!(verifier.verify(&token("user-42", 3600, None)).await.unwrap(), "user-42");
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let verifier = JwtSessionVerifier::new(SECRET, None);
        let result = verifier.verify(&token("user-42", -3600, None)).await;
        assert!(matches!(result, Err(SessionError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let verifier = JwtSessionVerifier::new(b"some-other-secret-entirely-000000", None);
        assert!(verifier.verify(&token("user-42", 3600, None)).await.is_err());
    }

    #[tokio::test]
    async fn test_audience_checked_when_configured() {
        let verifier = JwtSessionVerifier::new(SECRET, Some("authenticated"));
        assert!(verifier.verify(&token("u", 3600, Some("authenticated"))).await.is_ok());
        assert!(verifier.verify(&token("u", 3600, Some("anon"))).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_token_and_subject() {
        let verifier = JwtSessionVerifier::new(SECRET, None);
        assert!(matches!(verifier.verify("").await, Err(SessionError::MissingToken)));
        assert!(matches!(
            verifier.verify(&token("", 3600, None)).await,
            Err(SessionError::MissingSubject)
        ));
        assert!(verifier.verify("not-a-jwt").await.is_err());
    }
}
