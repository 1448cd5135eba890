//! Identity provider adapters
//!
//! Each provider turns one credential shape into principal attributes.
//! Providers are stateless beyond injected configuration and connection
//! pools; they are tried in configuration order, and all failures surface as
//! the uniform [`ProviderError`].

pub mod directory;
pub mod oidc;
pub mod saml;

pub use directory::DirectoryProvider;
pub use oidc::OidcProvider;
pub use saml::SamlProvider;

use crate::auth::credentials::Credential;
use crate::auth::principal::Principal;

/// Uniform provider failure
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Wrong password, unknown user, bad authorization code
    #[error("credential invalid")]
    CredentialInvalid,

    /// Assertion or token outside its validity window
    #[error("assertion expired")]
    AssertionExpired,

    /// Assertion structurally or cryptographically invalid
    #[error("assertion invalid: {0}")]
    AssertionInvalid(String),

    /// Directory / IdP not reachable within the timeout
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Provider misconfigured (bad cert, missing endpoint)
    #[error("provider configuration error: {0}")]
    ConfigurationError(String),
}

impl From<ProviderError> for crate::Error {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::CredentialInvalid
            | ProviderError::AssertionExpired
            | ProviderError::AssertionInvalid(_) => Self::InvalidCredential,
            ProviderError::UpstreamUnreachable(detail) => Self::UpstreamUnavailable(detail),
            ProviderError::ConfigurationError(detail) => Self::Config(detail),
        }
    }
}

/// A provider adapter: verify one credential shape.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Provider name used in logs, audit attributes, and `/auth/providers`.
    fn name(&self) -> &'static str;

    /// Whether this provider understands the given credential variant.
    fn handles(&self, credential: &Credential) -> bool;

    /// Verify the credential and produce the principal.
    async fn verify(&self, credential: &Credential) -> Result<Principal, ProviderError>;
}
