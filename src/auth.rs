//! Bearer credential verification for the administrative dispatch forms

use crate::config::AuthConfig;
use crate::error::DispatchError;
use crate::request::DispatchStrategy;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use hyper::header::{HeaderMap, AUTHORIZATION};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Outcome of credential verification. Lives for one request only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    Anonymous,
    Identity { subject: String, scopes: Vec<String> },
}

impl AuthContext {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthContext::Identity { .. })
    }

    pub fn subject(&self) -> Option<&str> {
        match self {
            AuthContext::Identity { subject, .. } => Some(subject),
            AuthContext::Anonymous => None,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        match self {
            AuthContext::Identity { scopes, .. } => scopes.iter().any(|s| s == scope),
            AuthContext::Anonymous => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum VerifyError {
    /// Malformed, expired, wrongly signed or otherwise rejected credential
    #[error("invalid credential: {0}")]
    Invalid(String),

    /// The verifier could not reach a decision
    #[error("identity verifier unavailable: {0}")]
    Unavailable(String),
}

/// Identity-verification collaborator
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<AuthContext, VerifyError>;
}

/// HS256 JWT verifier
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: Option<String>, audience: Option<String>, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        if let Some(iss) = &issuer {
            validation.set_issuer(&[iss]);
        }
        match &audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer,
            audience,
        }
    }

    pub fn from_config(config: &AuthConfig, secret: &str) -> Self {
        Self::new(secret, config.issuer.clone(), config.audience.clone(), config.leeway_secs)
    }

    /// Mint a token carrying this verifier's issuer and audience
    pub fn create_token(
        &self,
        subject: &str,
        scopes: &[&str],
        ttl: ChronoDuration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
    }

    pub fn verify_token(&self, token: &str) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<AuthContext, VerifyError> {
        let data = self
            .verify_token(credential)
            .map_err(|e| VerifyError::Invalid(e.to_string()))?;

        if data.claims.sub.is_empty() {
            return Err(VerifyError::Invalid("empty subject".to_string()));
        }

        Ok(AuthContext::Identity {
            subject: data.claims.sub,
            scopes: data.claims.scopes,
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Decides whether a request needs credentials and verifies them
pub struct AuthGate {
    verifier: Arc<dyn IdentityVerifier>,
    timeout: Duration,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, timeout: Duration) -> Self {
        Self { verifier, timeout }
    }

    /// Host-based strategies are forwarded as anonymous; the target owns its
    /// own auth surface. Path and query dispatch require a valid bearer token.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        strategy: DispatchStrategy,
    ) -> Result<AuthContext, DispatchError> {
        if !strategy.requires_credentials() {
            return Ok(AuthContext::Anonymous);
        }

        let token = extract_bearer(headers)
            .ok_or_else(|| DispatchError::Unauthorized("missing bearer credential".to_string()))?;

        match tokio::time::timeout(self.timeout, self.verifier.verify(token)).await {
            Ok(Ok(context @ AuthContext::Identity { .. })) => {
                debug!(subject = context.subject().unwrap_or_default(), %strategy, "Credential verified");
                Ok(context)
            }
            Ok(Ok(AuthContext::Anonymous)) => Err(DispatchError::Unauthorized(
                "credential did not identify a caller".to_string(),
            )),
            Ok(Err(VerifyError::Invalid(reason))) => Err(DispatchError::Unauthorized(reason)),
            Ok(Err(VerifyError::Unavailable(reason))) => Err(DispatchError::DependencyUnavailable(reason)),
            Err(_) => Err(DispatchError::DependencyUnavailable(format!(
                "identity verification timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
