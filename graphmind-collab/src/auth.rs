//! Access Gate: connection-time authorization against an external authority.
//!
//! The gate is stateless. Every handshake results in one outbound
//! `verifyAccess` call secured by a service-level credential (distinct from
//! the end-user bearer token). Any transport error, timeout, or negative
//! answer rejects the connection — fail closed, no retry; the client must
//! reconnect.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access role granted for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    /// Whether this role may mutate the document.
    pub fn can_edit(&self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Owner => write!(f, "owner"),
            Role::Editor => write!(f, "editor"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// A positive authorization verdict for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub user_id: Uuid,
    pub role: Role,
}

/// Authorization errors. Both variants reject the handshake.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// The authority answered and denied access.
    AuthorizationFailed,
    /// The authority could not be reached or answered garbage.
    Unavailable(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthorizationFailed => write!(f, "Authorization failed"),
            Self::Unavailable(e) => write!(f, "Authorization service unavailable: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Seam for the external authorization authority.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Verify a user's access to a document from a bearer credential.
    async fn verify_access(&self, doc_id: Uuid, credential: &str)
        -> Result<AccessGrant, AuthError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    doc_id: Uuid,
    credential: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    granted: bool,
    user_id: Option<Uuid>,
    role: Option<Role>,
}

/// HTTP-backed gate calling the authorization service.
pub struct HttpAuthorizer {
    client: reqwest::Client,
    endpoint: String,
    service_token: String,
}

impl HttpAuthorizer {
    /// Create a gate for an authority endpoint, authenticated by a
    /// service-level bearer token.
    pub fn new(
        endpoint: impl Into<String>,
        service_token: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            service_token: service_token.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn verify_access(
        &self,
        doc_id: Uuid,
        credential: &str,
    ) -> Result<AccessGrant, AuthError> {
        let request = VerifyRequest { doc_id, credential };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.service_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            log::warn!(
                "Authorization service answered {} for doc {doc_id}",
                response.status()
            );
            return Err(AuthError::AuthorizationFailed);
        }

        let verdict: VerifyResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        match (verdict.granted, verdict.user_id, verdict.role) {
            (true, Some(user_id), Some(role)) => Ok(AccessGrant { user_id, role }),
            _ => Err(AuthError::AuthorizationFailed),
        }
    }
}

/// Fixed-map authorizer for tests: credential → (doc scope, grant).
#[derive(Default)]
pub struct StaticAuthorizer {
    grants: HashMap<String, (Option<Uuid>, AccessGrant)>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a credential for any document.
    pub fn allow(mut self, credential: impl Into<String>, user_id: Uuid, role: Role) -> Self {
        self.grants
            .insert(credential.into(), (None, AccessGrant { user_id, role }));
        self
    }

    /// Allow a credential for one specific document only.
    pub fn allow_doc(
        mut self,
        credential: impl Into<String>,
        doc_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Self {
        self.grants
            .insert(credential.into(), (Some(doc_id), AccessGrant { user_id, role }));
        self
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn verify_access(
        &self,
        doc_id: Uuid,
        credential: &str,
    ) -> Result<AccessGrant, AuthError> {
        match self.grants.get(credential) {
            Some((scope, grant)) if scope.is_none() || *scope == Some(doc_id) => Ok(grant.clone()),
            _ => Err(AuthError::AuthorizationFailed),
        }
    }
}
