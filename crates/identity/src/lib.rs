//! Identity model shared between the request pipeline, the group cache and
//! the Azure AD directory client.

#![deny(missing_docs)]

mod claims;

pub use claims::{AzureClaims, ClaimsError, TranslatedIdentity};

use serde::{Deserialize, Serialize};

/// Distinguishes human users from application identities.
///
/// The distinction drives which Microsoft Graph endpoint answers membership
/// queries and how the impersonated username is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// A human principal carrying a `preferred_username` claim.
    NormalUser,
    /// An application or automation credential without a human-readable
    /// username. Impersonated by its object id.
    ServicePrincipal,
}

/// A directory group. Populated exclusively by the group sync task; the
/// request path only ever reads these records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Display name as listed in the directory.
    pub name: String,
    /// Directory object id (UUID).
    pub object_id: String,
}

/// A fully resolved identity as cached between requests.
///
/// Immutable once constructed. Keyed in the cache by a stable hash of the
/// verified token subject claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// The name sent in the `Impersonate-User` header.
    pub username: String,
    /// Directory object id (UUID).
    pub object_id: String,
    /// Groups resolved at login time, in directory order.
    pub groups: Vec<Group>,
    /// Whether this is a human user or a service principal.
    pub user_type: UserType,
}
