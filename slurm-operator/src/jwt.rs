//! Slurm `auth/jwt` tokens signed with the cluster's HS256 key.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::OperatorResult;

/// Default token lifetime.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// User the operator acts as.
pub const DEFAULT_USERNAME: &str = "slurm";

/// JWT payload understood by slurmctld and slurmrestd.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    /// Issued at, seconds since the epoch.
    pub iat: i64,
    /// Expiration, seconds since the epoch.
    pub exp: i64,
    /// Slurm user name.
    pub sun: String,
}

impl Claims {
    /// Expiration as a timestamp.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Builder for signed tokens.
pub struct Token<'a> {
    signing_key: &'a [u8],
    username: String,
    lifetime: Duration,
}

impl<'a> Token<'a> {
    /// Start a token signed with `signing_key`.
    pub fn new(signing_key: &'a [u8]) -> Self {
        Self {
            signing_key,
            username: DEFAULT_USERNAME.to_string(),
            lifetime: DEFAULT_LIFETIME,
        }
    }

    /// Set the Slurm user name.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the token lifetime.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sign a token issued now.
    pub fn sign(&self) -> OperatorResult<String> {
        self.sign_at(Utc::now())
    }

    /// Sign a token issued at `now`.
    pub fn sign_at(&self, now: DateTime<Utc>) -> OperatorResult<String> {
        let iat = now.timestamp();
        let claims = Claims {
            iat,
            exp: iat + self.lifetime.as_secs() as i64,
            sun: self.username.clone(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.signing_key),
        )?;
        Ok(token)
    }
}

/// Verify `token` against `signing_key` and return its claims.
pub fn parse_claims(token: &str, signing_key: &[u8]) -> OperatorResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = ["exp".to_string()].into();
    let data = decode::<Claims>(token, &DecodingKey::from_secret(signing_key), &validation)?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperatorError;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn sign_and_parse() {
        let token = Token::new(KEY)
            .with_lifetime(Duration::from_secs(900))
            .sign()
            .unwrap();
        let claims = parse_claims(&token, KEY).unwrap();

        assert_eq!(claims.sun, "slurm");
        assert_eq!(claims.exp - claims.iat, 900);
        assert!(claims.expiration().unwrap() > Utc::now());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = Token::new(KEY).with_username("alice").sign().unwrap();
        let err = parse_claims(&token, b"another-key").unwrap_err();
        assert!(matches!(err, OperatorError::TokenError(_)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let issued = Utc::now() - chrono::Duration::hours(2);
        let token = Token::new(KEY).sign_at(issued).unwrap();
        assert!(parse_claims(&token, KEY).is_err());
    }
}
