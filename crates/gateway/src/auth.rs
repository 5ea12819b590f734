//! Authentication seam. Token validation itself happens outside the
//! gateway (an identity-aware proxy or a validator sidecar); these types
//! describe what the streaming core needs from it.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};

use tailgate_core::{Error, Result};

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    /// Stable subject used for rate limiting and audit logs.
    pub subject: String,
    pub groups: Vec<String>,
    /// Whether secret-bearing resources may be shown to this caller.
    pub secrets_allowed: bool,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal>;
}

/// Trusts identity headers stamped by an auth proxy in front of the
/// gateway. A bearer token must still be present, proving the request came
/// through the proxy.
pub struct HeaderAuth {
    pub subject_header: String,
    pub groups_header: String,
    pub secrets_group: String,
}

impl Default for HeaderAuth {
    fn default() -> Self {
        Self {
            subject_header: "x-auth-request-user".into(),
            groups_header: "x-auth-request-groups".into(),
            secrets_group: "secrets-admin".into(),
        }
    }
}

#[async_trait]
impl Authenticator for HeaderAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal> {
        let authz = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Unauthenticated("missing token".into()))?;
        if !authz.starts_with("Bearer ") {
            return Err(Error::Unauthenticated("invalid token".into()));
        }
        let subject = headers
            .get(self.subject_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Unauthenticated("invalid token".into()))?
            .to_string();
        let groups: Vec<String> = headers
            .get(self.groups_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').map(|g| g.trim().to_string()).collect())
            .unwrap_or_default();
        let secrets_allowed = groups.iter().any(|g| g == &self.secrets_group);
        Ok(Principal { subject, groups, secrets_allowed })
    }
}

/// Static bearer-token table, for tests and single-user deployments.
#[derive(Default)]
pub struct StaticTokenAuth {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal> {
        let authz = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Unauthenticated("missing token".into()))?;
        let token = authz
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Unauthenticated("invalid token".into()))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Error::Unauthenticated("invalid token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn alice() -> Principal {
        Principal { subject: "alice".into(), groups: vec!["dev".into()], secrets_allowed: false }
    }

    #[tokio::test]
    async fn static_auth_resolves_known_tokens() {
        let auth = StaticTokenAuth::new().with_token("t0ken", alice());
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t0ken"));
        assert_eq!(auth.authenticate(&headers).await.unwrap(), alice());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(matches!(
            auth.authenticate(&headers).await,
            Err(Error::Unauthenticated(_))
        ));
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()).await,
            Err(Error::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn header_auth_reads_proxy_identity() {
        let auth = HeaderAuth::default();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer opaque"));
        headers.insert("x-auth-request-user", HeaderValue::from_static("bob"));
        headers.insert(
            "x-auth-request-groups",
            HeaderValue::from_static("dev, secrets-admin"),
        );
        let p = auth.authenticate(&headers).await.unwrap();
        assert_eq!(p.subject, "bob");
        assert!(p.secrets_allowed);

        headers.remove("x-auth-request-user");
        assert!(auth.authenticate(&headers).await.is_err());
    }
}
