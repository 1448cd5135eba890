//! Access and refresh token primitives
//!
//! Access tokens are stateless HS256 JWTs carrying the principal snapshot;
//! nothing about them is stored server-side. Refresh tokens are opaque
//! 256-bit secrets that exist server-side only as SHA-256 digests.

use std::collections::BTreeSet;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};

use crate::auth::principal::{Principal, PrincipalKind};
use crate::crypto;
use crate::{Error, Result};

/// Prefix on refresh-token plaintexts; makes leaked tokens greppable by
/// secret scanners.
pub const REFRESH_TOKEN_PREFIX: &str = "srt_";

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Principal id
    pub sub: String,
    /// Session id the token was issued under
    pub sid: String,
    /// Unique token identifier
    pub jti: String,
    /// Principal kind
    pub kind: PrincipalKind,
    /// Display name snapshot
    pub name: String,
    /// Email snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Role snapshot at issuance
    pub roles: BTreeSet<String>,
    /// Team snapshot at issuance
    pub teams: BTreeSet<String>,
    /// Issued-at (Unix epoch seconds)
    pub iat: u64,
    /// Expires-at (Unix epoch seconds)
    pub exp: u64,
}

impl AccessClaims {
    /// Rebuild the principal from the token snapshot. No storage consulted.
    #[must_use]
    pub fn to_principal(&self) -> Principal {
        Principal {
            principal_id: self.sub.clone(),
            kind: self.kind,
            display_name: self.name.clone(),
            email: self.email.clone(),
            roles: self.roles.clone(),
            teams: self.teams.clone(),
            attributes: std::collections::HashMap::new(),
        }
    }
}

/// Mints and verifies access tokens.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenSigner {
    /// Create a signer over an HS256 secret.
    #[must_use]
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    /// Mint an access token for `principal` under `session_id`.
    pub fn mint(&self, principal: &Principal, session_id: &str) -> Result<(String, AccessClaims)> {
        let now = unix_now();
        let claims = AccessClaims {
            sub: principal.principal_id.clone(),
            sid: session_id.to_string(),
            jti: crypto::generate_id(),
            kind: principal.kind,
            name: principal.display_name.clone(),
            email: principal.email.clone(),
            roles: principal.roles.clone(),
            teams: principal.teams.clone(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign access token: {e}")))?;
        Ok((token, claims))
    }

    /// Verify signature and expiry, returning the claims.
    ///
    /// # Errors
    ///
    /// [`Error::TokenExpired`] past `exp`, [`Error::TokenInvalid`] for
    /// everything else.
    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        validation.set_required_spec_claims(&["exp"]);

        match jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => Err(Error::TokenExpired),
                _ => Err(Error::TokenInvalid),
            },
        }
    }
}

/// Generate a fresh refresh-token plaintext.
#[must_use]
pub fn generate_refresh_token() -> String {
    format!("{REFRESH_TOKEN_PREFIX}{}", crypto::generate_secret_body())
}

/// Digest a refresh-token plaintext for storage or lookup.
#[must_use]
pub fn hash_refresh_token(plaintext: &str) -> String {
    crypto::sha256_hex(plaintext)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
