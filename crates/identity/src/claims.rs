use serde::{Deserialize, Serialize};

/// The claims the proxy consumes from an Azure AD v2.0 access token.
///
/// The token signature, expiry and issuer have already been verified by the
/// OIDC layer before this type is handed to the pipeline; nothing here
/// performs verification.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AzureClaims {
    /// Token subject, stable per user/application pair.
    #[serde(default)]
    pub sub: Option<String>,

    /// Directory object id of the principal.
    #[serde(default)]
    pub oid: Option<String>,

    /// Human-readable username. Absent for service principals.
    #[serde(default)]
    pub preferred_username: Option<String>,

    /// Tenant id the token was issued for.
    #[serde(default)]
    pub tid: Option<String>,

    /// Group ids asserted by the provider. Informational only; authorization
    /// always goes through a live membership lookup.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Failures turning a verified claim set into an internal identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimsError {
    /// A claim the proxy cannot operate without was absent.
    #[error("required claim `{0}` is missing")]
    MissingClaim(&'static str),

    /// The token was issued for a different tenant than the proxy serves.
    #[error("token tenant does not match the configured tenant")]
    TenantMismatch,
}

/// The provider-independent identity extracted from a verified token.
///
/// `username` is left empty when the provider omitted a human-readable
/// username; the resolver turns that into a service-principal identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedIdentity {
    /// The raw subject claim; hashed to form the cache key.
    pub subject: String,
    /// Preferred username, or empty for service principals.
    pub username: String,
    /// Directory object id.
    pub object_id: String,
}

impl AzureClaims {
    /// Translates the claim set into the internal identity record.
    ///
    /// Deterministic and side-effect free: translating the same claims twice
    /// yields identical records.
    pub fn translate(&self, expected_tenant: Option<&str>) -> Result<TranslatedIdentity, ClaimsError> {
        let subject = self.sub.clone().ok_or(ClaimsError::MissingClaim("sub"))?;
        let object_id = self.oid.clone().ok_or(ClaimsError::MissingClaim("oid"))?;

        if let Some(expected) = expected_tenant {
            match self.tid.as_deref() {
                Some(tid) if tid == expected => {}
                _ => return Err(ClaimsError::TenantMismatch),
            }
        }

        Ok(TranslatedIdentity {
            subject,
            username: self.preferred_username.clone().unwrap_or_default(),
            object_id,
        })
    }
}
