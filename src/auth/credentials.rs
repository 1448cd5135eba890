//! Login credential variants
//!
//! One tagged sum type over every way to authenticate; dispatch is an
//! exhaustive match, never a runtime type test. `Debug` is hand-written so
//! secret material cannot leak into logs.

use std::fmt;

use serde::Deserialize;

/// A user-supplied credential
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Directory (LDAP) username + password
    Directory {
        /// Login name
        username: String,
        /// Password
        password: String,
    },
    /// OIDC authorization-code response
    Oidc {
        /// Authorization code
        code: String,
        /// State echoed from the authorization request
        state: String,
        /// Nonce bound into the ID token, when the flow used one
        #[serde(default)]
        nonce: Option<String>,
    },
    /// SAML response document
    Saml {
        /// The signed assertion XML
        assertion_xml: String,
        /// Relay state, opaque to the core
        #[serde(default)]
        relay_state: Option<String>,
    },
    /// API key plaintext
    ApiKey {
        /// The full `<prefix>_<env>_<body>` secret
        key: String,
    },
}

impl Credential {
    /// Label used in audit attributes and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Directory { .. } => "directory",
            Self::Oidc { .. } => "oidc",
            Self::Saml { .. } => "saml",
            Self::ApiKey { .. } => "api_key",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory { username, .. } => f
                .debug_struct("Directory")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Oidc { state, .. } => f
                .debug_struct("Oidc")
                .field("code", &"<redacted>")
                .field("state", state)
                .finish(),
            Self::Saml { relay_state, .. } => f
                .debug_struct("Saml")
                .field("assertion_xml", &"<redacted>")
                .field("relay_state", relay_state)
                .finish(),
            Self::ApiKey { .. } => f.debug_struct("ApiKey").field("key", &"<redacted>").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_variants() {
        let cred: Credential = serde_json::from_str(
            r#"{"type":"directory","username":"alice","password":"hunter2"}"#,
        )
        .expect("valid credential json");
        assert_eq!(cred.kind(), "directory");

        let cred: Credential =
            serde_json::from_str(r#"{"type":"api_key","key":"sark_live_abc"}"#).expect("valid");
        assert_eq!(cred.kind(), "api_key");
    }

    #[test]
    fn debug_never_prints_secrets() {
        let cred = Credential::Directory {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let dbg = format!("{cred:?}");
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("hunter2"));

        let cred = Credential::ApiKey {
            key: "sark_live_supersecret".to_string(),
        };
        let dbg = format!("{cred:?}");
        assert!(!dbg.contains("supersecret"));
    }
}
