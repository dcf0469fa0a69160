//! Signed identity tokens and request attribution.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::VigilConfig;
use crate::errors::{VigilError, VigilResult};
use crate::models::{Identity, Plan};

/// JWT claims carried by an identity token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub plan: Plan,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    lifetime: Duration,
}

impl TokenManager {
    pub fn new(secret: &str, issuer: &str, lifetime_hours: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "iss"]);
        // expiry is checked against the caller-supplied clock in `verify_at`
        validation.validate_exp = false;
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: issuer.to_string(),
            lifetime: Duration::hours(lifetime_hours),
        }
    }

    pub fn from_config(config: &VigilConfig) -> Self {
        Self::new(
            &config.token_secret,
            &config.token_issuer,
            config.token_lifetime_hours,
        )
    }

    pub fn issue(&self, user_id: &str, plan: Plan) -> VigilResult<String> {
        self.issue_at(user_id, plan, Utc::now())
    }

    pub fn issue_at(&self, user_id: &str, plan: Plan, now: DateTime<Utc>) -> VigilResult<String> {
        if user_id.trim().is_empty() {
            return Err(VigilError::Validation("user id cannot be empty".into()));
        }
        let claims = Claims {
            sub: user_id.to_string(),
            plan,
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
            iss: self.issuer.clone(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    pub fn verify(&self, token: &str) -> VigilResult<Claims> {
        self.verify_at(token, Utc::now())
    }

    /// Check signature, issuer and expiry as of `now`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> VigilResult<Claims> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)?.claims;
        if claims.exp <= now.timestamp() {
            return Err(jsonwebtoken::errors::Error::from(
                jsonwebtoken::errors::ErrorKind::ExpiredSignature,
            )
            .into());
        }
        Ok(claims)
    }

    pub fn resolve(&self, token: Option<&str>, client_ip: &str) -> Identity {
        self.resolve_at(token, client_ip, Utc::now())
    }

    /// Attribute a request. Any token problem downgrades to anonymous.
    pub fn resolve_at(&self, token: Option<&str>, client_ip: &str, now: DateTime<Utc>) -> Identity {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return Identity::anonymous(client_ip);
        };
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        match self.verify_at(token, now) {
            Ok(claims) => Identity::User {
                user_id: claims.sub,
                plan: claims.plan,
                client_ip: client_ip.to_string(),
            },
            Err(e) => {
                warn!(
                    target: "vigil::security",
                    event = "TOKEN_REJECTED",
                    error = %e,
                    "Token verification failed, treating caller as anonymous"
                );
                Identity::anonymous(client_ip)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn manager() -> TokenManager {
        TokenManager::new("unit-test-secret", "vigil", 24)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let tokens = manager();
        let token = tokens.issue_at("alice", Plan::Pro, t0()).unwrap();
        let claims = tokens.verify_at(&token, t0() + Duration::hours(1)).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.plan, Plan::Pro);
        assert_eq!(claims.iss, "vigil");
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
    }

    #[test]
    fn test_expired_token_rejected() {
        let tokens = manager();
        let token = tokens.issue_at("alice", Plan::Free, t0()).unwrap();
        let err = tokens.verify_at(&token, t0() + Duration::hours(25)).unwrap_err();
        assert!(matches!(err, VigilError::Token(_)));
    }

    #[test]
    fn test_wrong_secret_or_issuer_rejected() {
        let token = manager().issue_at("bob", Plan::Free, t0()).unwrap();
        let other_secret = TokenManager::new("another-secret", "vigil", 24);
        assert!(other_secret.verify_at(&token, t0()).is_err());
        let other_issuer = TokenManager::new("unit-test-secret", "someone-else", 24);
        assert!(other_issuer.verify_at(&token, t0()).is_err());
    }

    #[test]
    fn test_resolve_downgrades_bad_tokens() {
        let tokens = manager();
        let good = tokens.issue_at("carol", Plan::Enterprise, t0()).unwrap();
        let identity = tokens.resolve_at(Some(&format!("Bearer {good}")), "10.0.0.1", t0());
        assert_eq!(identity.user_id(), Some("carol"));
        assert_eq!(identity.plan(), Plan::Enterprise);

        let garbage = tokens.resolve_at(Some("not.a.token"), "10.0.0.1", t0());
        assert_eq!(garbage, Identity::anonymous("10.0.0.1"));
        let expired = tokens.resolve_at(Some(&good), "10.0.0.1", t0() + Duration::days(2));
        assert_eq!(expired.plan(), Plan::Anonymous);
        assert_eq!(tokens.resolve_at(None, "10.0.0.1", t0()).plan(), Plan::Anonymous);
    }

    #[test]
    fn test_empty_user_rejected() {
        assert!(matches!(
            manager().issue_at("  ", Plan::Free, t0()),
            Err(VigilError::Validation(_))
        ));
    }
}
