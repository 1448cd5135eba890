//! OIDC identity provider — authorization-code exchange and ID-token
//! verification.
//!
//! # Verification flow
//!
//! 1. Exchange the authorization code at the provider's token endpoint.
//! 2. Decode the ID-token header (no verification) to extract `kid`/`alg`.
//! 3. Fetch the provider's JWKS (cached with a short TTL; refreshed once on
//!    unknown `kid` before failing).
//! 4. Verify signature plus `exp`, `iat`, `iss`, `aud`.
//! 5. Check the `nonce` claim against the value bound at the authorization
//!    request, when the flow used one.
//! 6. Map standard claims and the configured groups claim onto a principal.
//!
//! JWKS is fetched only over HTTPS. Clock leeway of 60 seconds tolerates
//! skew between the IdP and the gateway host.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use jsonwebtoken::{
    Algorithm, DecodingKey, Header, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::credentials::Credential;
use crate::auth::principal::{Principal, PrincipalKind};
use crate::auth::providers::{IdentityProvider, ProviderError};
use crate::config::OidcProviderConfig;

/// How long a fetched JWKS stays fresh.
const JWKS_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= JWKS_TTL
    }
}

/// One OIDC provider (one issuer).
pub struct OidcProvider {
    config: OidcProviderConfig,
    http: reqwest::Client,
    jwks: Mutex<Option<CachedJwks>>,
}

impl OidcProvider {
    /// Create from configuration.
    ///
    /// # Errors
    ///
    /// [`ProviderError::ConfigurationError`] when the HTTP client cannot be
    /// constructed.
    pub fn new(config: OidcProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .https_only(config.issuer.starts_with("https://"))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::ConfigurationError(e.to_string()))?;
        Ok(Self {
            config,
            http,
            jwks: Mutex::new(None),
        })
    }

    fn token_endpoint(&self) -> String {
        if self.config.token_endpoint.is_empty() {
            format!("{}/token", self.config.issuer.trim_end_matches('/'))
        } else {
            self.config.token_endpoint.clone()
        }
    }

    fn jwks_uri(&self) -> String {
        if self.config.jwks_uri.is_empty() {
            format!(
                "{}/.well-known/jwks.json",
                self.config.issuer.trim_end_matches('/')
            )
        } else {
            self.config.jwks_uri.clone()
        }
    }

    /// Exchange the authorization code for an ID token.
    async fn exchange_code(&self, code: &str) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(self.token_endpoint())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::UpstreamUnreachable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            // The IdP rejected the code; treat like a wrong password.
            debug!(status = %status, "Authorization code rejected by IdP");
            return Err(ProviderError::CredentialInvalid);
        }
        if !status.is_success() {
            return Err(ProviderError::UpstreamUnreachable(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::UpstreamUnreachable(e.to_string()))?;
        Ok(token.id_token)
    }

    /// Return the cached JWKS, fetching when stale or `force_refresh` is set.
    async fn jwks(&self, force_refresh: bool) -> Result<JwkSet, ProviderError> {
        let mut guard = self.jwks.lock().await;
        if !force_refresh {
            if let Some(cached) = guard.as_ref() {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let uri = self.jwks_uri();
        debug!(issuer = %self.config.issuer, uri = %uri, "Fetching JWKS");
        let keys: JwkSet = self
            .http
            .get(&uri)
            .send()
            .await
            .map_err(|e| ProviderError::UpstreamUnreachable(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::UpstreamUnreachable(e.to_string()))?;

        *guard = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }

    /// Find the decoding key for `kid`, refreshing the JWKS once on a miss.
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, ProviderError> {
        let jwks = self.jwks(false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not in cached JWKS, refreshing");
        let jwks = self.jwks(true).await?;
        find_key_in_jwks(&jwks, kid)
            .ok_or_else(|| ProviderError::AssertionInvalid(format!("unknown key id {kid}")))
    }

    fn validation(&self, header: &Header) -> Validation {
        let mut validation = Validation::new(signing_algorithm(header));
        validation.leeway = 60;
        validation.set_issuer(&[self.config.issuer.as_str()]);
        if self.config.audiences.is_empty() {
            validation.set_audience(&[self.config.client_id.as_str()]);
        } else {
            validation.set_audience(&self.config.audiences);
        }
        validation
    }
}

#[async_trait::async_trait]
impl IdentityProvider for OidcProvider {
    fn name(&self) -> &'static str {
        "oidc"
    }

    fn handles(&self, credential: &Credential) -> bool {
        matches!(credential, Credential::Oidc { .. })
    }

    async fn verify(&self, credential: &Credential) -> Result<Principal, ProviderError> {
        let Credential::Oidc { code, state: _, nonce } = credential else {
            return Err(ProviderError::CredentialInvalid);
        };

        let id_token = self.exchange_code(code).await?;

        let header = jsonwebtoken::decode_header(&id_token)
            .map_err(|e| ProviderError::AssertionInvalid(e.to_string()))?;
        let kid = header
            .kid
            .clone()
            .ok_or_else(|| ProviderError::AssertionInvalid("missing kid".to_string()))?;

        let key = self.decoding_key(&kid).await?;
        let validation = self.validation(&header);

        let data = jsonwebtoken::decode::<serde_json::Value>(&id_token, &key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    ProviderError::AssertionExpired
                }
                _ => ProviderError::AssertionInvalid(e.to_string()),
            })?;
        let claims = data.claims;

        // Nonce binding: when the authorization request carried a nonce, the
        // ID token must echo it.
        if let Some(expected) = nonce {
            let actual = claims.get("nonce").and_then(|v| v.as_str());
            if actual != Some(expected.as_str()) {
                warn!(issuer = %self.config.issuer, "ID token nonce mismatch");
                return Err(ProviderError::AssertionInvalid("nonce mismatch".to_string()));
            }
        }

        let sub = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::AssertionInvalid("missing sub".to_string()))?;

        let email = claims.get("email").and_then(|v| v.as_str()).map(String::from);
        let display_name = claims
            .get("name")
            .and_then(|v| v.as_str())
            .map_or_else(|| sub.to_string(), String::from);

        let teams: BTreeSet<String> = claims
            .get(&self.config.groups_claim)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|g| g.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Principal {
            principal_id: format!("oidc:{sub}"),
            kind: PrincipalKind::User,
            display_name,
            email,
            roles: BTreeSet::new(),
            teams,
            attributes: std::collections::HashMap::from([(
                "issuer".to_string(),
                self.config.issuer.clone(),
            )]),
        })
    }
}

/// Find a JWK by `kid` and convert it to a decoding key.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        if jwk.common.key_id.as_deref() != Some(kid) {
            continue;
        }
        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Restrict the accepted algorithm to the asymmetric family in the header.
fn signing_algorithm(header: &Header) -> Algorithm {
    match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported ID token algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    }
}
