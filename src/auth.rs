//! Bearer token verification.
//!
//! Tokens are HS256 JWTs issued by an external identity service. The verified claims must
//! carry a `userId` (a standard `sub` claim is accepted as a fallback).

use crate::config::AuthConfig;
use crate::error::{RelayError, Result};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Validates a bearer token. Implementations are pure: no side effects, no retries.
#[cfg_attr(test, mockall::automock)]
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity>;
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway_secs;
        if !config.require_exp {
            validation.required_spec_claims = HashSet::new();
        }
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired".to_string(),
                ErrorKind::InvalidSignature => "invalid signature".to_string(),
                ErrorKind::InvalidIssuer => "invalid issuer".to_string(),
                _ => e.to_string(),
            };
            RelayError::Authentication(reason)
        })?;

        let user_id = data
            .claims
            .user_id
            .or(data.claims.sub)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RelayError::Authentication("missing userId claim".to_string()))?;

        debug!(user_id = %user_id, "Token verified");
        Ok(Identity { user_id })
    }
}
