//! Authenticated identity types

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Whether the principal is a human or a machine identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Human identity (directory, OIDC, SAML)
    User,
    /// Machine identity (API key)
    Service,
}

/// An authenticated identity, immutable per authentication event.
///
/// Role and team sets use `BTreeSet` so serialization order is stable; the
/// policy fingerprint depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Opaque stable identifier, prefixed by provider (`dir:`, `oidc:`, `saml:`, `key:`)
    pub principal_id: String,
    /// Human or service
    pub kind: PrincipalKind,
    /// Display name
    pub display_name: String,
    /// Email address, when the provider supplies one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Assigned roles
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Team / group memberships
    #[serde(default)]
    pub teams: BTreeSet<String>,
    /// Provider-specific attributes
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl Principal {
    /// Whether this principal carries the configured admin role.
    #[must_use]
    pub fn is_admin(&self, admin_role: &str) -> bool {
        self.roles.contains(admin_role)
    }
}
