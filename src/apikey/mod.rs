//! API key subsystem — issuance, validation, rotation, revocation.
//!
//! Keys have the shape `<prefix>_<env>_<body>` where the body is a base62
//! secret with more than 256 bits of entropy. The body is stored only as a
//! SHA-256 digest; the plaintext appears exactly once, in the mint or rotate
//! response. A non-secret 12-character prefix fragment is kept for display.
//!
//! Rotation is zero-downtime: the new key is linked to the old one, and the
//! old key keeps validating until [`ApiKeyService::finalize`] or the grace
//! period ends.

pub mod store;

pub use store::{ApiKeyRecord, ApiKeyStore, InMemoryApiKeyStore};

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::{AuditEmitter, AuditEvent, EventKind};
use crate::auth::principal::{Principal, PrincipalKind};
use crate::config::ApiKeyConfig;
use crate::crypto;
use crate::{Error, Result};

/// Characters of the plaintext kept for display (`sark_live_Ab12…`).
const KEY_PREFIX_DISPLAY_LEN: usize = 12;

/// Secret body length; 44 base62 characters exceed 256 bits of entropy.
const KEY_BODY_LEN: usize = 44;

/// Deployment environment a key is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEnvironment {
    /// Production traffic
    Live,
    /// Test traffic
    Test,
}

impl KeyEnvironment {
    /// Wire label (`live` / `test`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Test => "test",
        }
    }
}

impl FromStr for KeyEnvironment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "live" => Ok(Self::Live),
            "test" => Ok(Self::Test),
            other => Err(Error::InvalidInput(format!("unknown key environment '{other}'"))),
        }
    }
}

/// Closed scope vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Read MCP server registrations
    #[serde(rename = "server:read")]
    ServerRead,
    /// Register / mutate MCP servers
    #[serde(rename = "server:write")]
    ServerWrite,
    /// Read policies and evaluate decisions
    #[serde(rename = "policy:read")]
    PolicyRead,
    /// Mutate policies
    #[serde(rename = "policy:write")]
    PolicyWrite,
    /// List and inspect API keys
    #[serde(rename = "keys:read")]
    KeysRead,
    /// Mint, rotate, revoke API keys
    #[serde(rename = "keys:write")]
    KeysWrite,
    /// Read the audit trail
    #[serde(rename = "audit:read")]
    AuditRead,
}

impl Scope {
    /// Wire label, `resource:verb`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerRead => "server:read",
            Self::ServerWrite => "server:write",
            Self::PolicyRead => "policy:read",
            Self::PolicyWrite => "policy:write",
            Self::KeysRead => "keys:read",
            Self::KeysWrite => "keys:write",
            Self::AuditRead => "audit:read",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server:read" => Ok(Self::ServerRead),
            "server:write" => Ok(Self::ServerWrite),
            "policy:read" => Ok(Self::PolicyRead),
            "policy:write" => Ok(Self::PolicyWrite),
            "keys:read" => Ok(Self::KeysRead),
            "keys:write" => Ok(Self::KeysWrite),
            "audit:read" => Ok(Self::AuditRead),
            other => Err(Error::InvalidInput(format!("unknown scope '{other}'"))),
        }
    }
}

/// Non-secret API key metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyMeta {
    /// Key identifier
    pub key_id: String,
    /// Human-readable name
    pub name: String,
    /// Owning principal
    pub owner_principal_id: String,
    /// Granted scopes
    pub scopes: BTreeSet<Scope>,
    /// Per-key rate limit (requests per minute; 0 = unthrottled)
    pub rate_limit_per_min: u32,
    /// Bound environment
    pub environment: KeyEnvironment,
    /// First characters of the plaintext, for display only
    pub key_prefix: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Optional hard expiry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Set when revoked (terminal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Last successful validation (best-effort)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Key this one replaced, when created by rotation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_from: Option<String>,
    /// After rotation, the moment this (old) key stops validating
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_deadline: Option<DateTime<Utc>>,
}

impl ApiKeyMeta {
    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none()
            && self.expires_at.is_none_or(|t| now < t)
            && self.rotation_deadline.is_none_or(|t| now < t)
    }
}

/// Result of minting: metadata plus the plaintext, which exists only here.
#[derive(Debug, Serialize)]
pub struct MintedKey {
    /// Non-secret metadata
    pub meta: ApiKeyMeta,
    /// The full secret; shown once and never stored
    pub plaintext: String,
}

/// The principal a validated key acts as.
#[derive(Debug, Clone)]
pub struct ApiKeyPrincipal {
    /// The key itself
    pub key_id: String,
    /// Owning principal
    pub owner_principal_id: String,
    /// Granted scopes
    pub scopes: BTreeSet<Scope>,
    /// Per-key rate limit
    pub rate_limit_per_min: u32,
    /// Bound environment
    pub environment: KeyEnvironment,
}

impl ApiKeyPrincipal {
    /// Require every scope in `required`; missing scopes deny.
    pub fn require_scopes(&self, required: &[Scope]) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|s| !self.scopes.contains(s))
            .map(|s| s.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::InsufficientScope { missing })
        }
    }

    /// Project onto the shared principal type.
    #[must_use]
    pub fn to_principal(&self) -> Principal {
        Principal {
            principal_id: self.owner_principal_id.clone(),
            kind: PrincipalKind::Service,
            display_name: format!("api-key:{}", self.key_id),
            email: None,
            roles: BTreeSet::new(),
            teams: BTreeSet::new(),
            attributes: std::collections::HashMap::from([
                ("key_id".to_string(), self.key_id.clone()),
                ("environment".to_string(), self.environment.as_str().to_string()),
            ]),
        }
    }
}

/// Parameters for minting a key.
#[derive(Debug)]
pub struct MintRequest {
    /// Owning principal
    pub owner_principal_id: String,
    /// Human-readable name
    pub name: String,
    /// Granted scopes
    pub scopes: BTreeSet<Scope>,
    /// Bound environment
    pub environment: KeyEnvironment,
    /// Per-key rate limit; defaults from configuration when `None`
    pub rate_limit_per_min: Option<u32>,
    /// Optional hard expiry
    pub expires_at: Option<DateTime<Utc>>,
}

/// The API key subsystem.
pub struct ApiKeyService {
    config: ApiKeyConfig,
    store: Arc<dyn ApiKeyStore>,
    audit: Arc<AuditEmitter>,
}

impl ApiKeyService {
    /// Create over a store and the audit emitter.
    #[must_use]
    pub fn new(config: ApiKeyConfig, store: Arc<dyn ApiKeyStore>, audit: Arc<AuditEmitter>) -> Self {
        Self { config, store, audit }
    }

    /// Mint a new key. The returned plaintext is the only copy.
    pub async fn mint(&self, request: MintRequest) -> Result<MintedKey> {
        let minted = self.build_key(&request, None);
        self.store
            .insert(ApiKeyRecord {
                meta: minted.meta.clone(),
                key_hash: hash_body_of(&minted.plaintext)?,
            })
            .await;

        self.audit
            .emit(
                AuditEvent::new(EventKind::KeyIssued)
                    .principal(&*request.owner_principal_id)
                    .attribute("key_id", &*minted.meta.key_id)
                    .attribute("environment", minted.meta.environment.as_str()),
            )
            .await;

        Ok(minted)
    }

    /// Validate a plaintext key.
    ///
    /// Parse failures are [`Error::InvalidInput`]; a well-formed key that
    /// does not resolve, is revoked, expired, or past its rotation deadline
    /// fails with the opaque [`Error::InvalidCredential`].
    pub async fn validate(&self, plaintext: &str) -> Result<ApiKeyPrincipal> {
        let (env, body) = self.parse_plaintext(plaintext)?;

        let computed_hash = crypto::sha256_hex(body);
        let record = self
            .store
            .get_by_hash(&computed_hash)
            .await
            .ok_or(Error::InvalidCredential)?;

        // The lookup already matched on the digest; the constant-time compare
        // closes the remaining timing side channel on the stored value.
        if !crypto::constant_time_eq(&record.key_hash, &computed_hash) {
            return Err(Error::InvalidCredential);
        }

        if record.meta.environment != env {
            return Err(Error::InvalidCredential);
        }

        let now = Utc::now();
        if !record.meta.is_usable(now) {
            return Err(Error::InvalidCredential);
        }

        // Best-effort: a failed timestamp update must never fail validation.
        if !self.store.touch_last_used(&record.meta.key_id, now).await {
            debug!(key_id = %record.meta.key_id, "last_used_at update skipped");
        }

        Ok(ApiKeyPrincipal {
            key_id: record.meta.key_id,
            owner_principal_id: record.meta.owner_principal_id,
            scopes: record.meta.scopes,
            rate_limit_per_min: record.meta.rate_limit_per_min,
            environment: record.meta.environment,
        })
    }

    /// Rotate a key: mint a linked replacement, leaving the original valid
    /// until [`finalize`](Self::finalize) or the grace period ends.
    pub async fn rotate(&self, key_id: &str) -> Result<MintedKey> {
        let old = self.store.get(key_id).await.ok_or(Error::SessionNotFound)?;
        if old.meta.revoked_at.is_some() {
            return Err(Error::InvalidInput(format!(
                "key '{key_id}' is revoked and cannot be rotated"
            )));
        }

        let request = MintRequest {
            owner_principal_id: old.meta.owner_principal_id.clone(),
            name: old.meta.name.clone(),
            scopes: old.meta.scopes.clone(),
            environment: old.meta.environment,
            rate_limit_per_min: Some(old.meta.rate_limit_per_min),
            expires_at: old.meta.expires_at,
        };
        let minted = self.build_key(&request, Some(key_id.to_string()));

        self.store
            .insert(ApiKeyRecord {
                meta: minted.meta.clone(),
                key_hash: hash_body_of(&minted.plaintext)?,
            })
            .await;

        let grace = chrono::Duration::from_std(self.config.rotation_grace)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.store
            .set_rotation_deadline(key_id, Utc::now() + grace)
            .await;

        self.audit
            .emit(
                AuditEvent::new(EventKind::KeyRotated)
                    .principal(&*minted.meta.owner_principal_id)
                    .attribute("old_key_id", key_id)
                    .attribute("new_key_id", &*minted.meta.key_id),
            )
            .await;

        Ok(minted)
    }

    /// Confirm a rotation: the old key is revoked immediately.
    pub async fn finalize(&self, old_key_id: &str) -> Result<()> {
        self.revoke(old_key_id).await
    }

    /// Revoke a key. Idempotent.
    pub async fn revoke(&self, key_id: &str) -> Result<()> {
        if !self.store.set_revoked(key_id, Utc::now()).await {
            return Err(Error::SessionNotFound);
        }

        let owner = self
            .store
            .get(key_id)
            .await
            .map(|r| r.meta.owner_principal_id);
        self.audit
            .emit(
                AuditEvent::new(EventKind::KeyRevoked)
                    .principal(owner.unwrap_or_default())
                    .attribute("key_id", key_id),
            )
            .await;
        Ok(())
    }

    /// Keys owned by a principal (metadata only).
    pub async fn list_for_owner(&self, owner_principal_id: &str) -> Vec<ApiKeyMeta> {
        self.store
            .list_for_owner(owner_principal_id)
            .await
            .into_iter()
            .map(|r| r.meta)
            .collect()
    }

    /// One key by id (metadata only).
    pub async fn get(&self, key_id: &str) -> Option<ApiKeyMeta> {
        self.store.get(key_id).await.map(|r| r.meta)
    }

    fn build_key(&self, request: &MintRequest, rotated_from: Option<String>) -> MintedKey {
        let body = crypto::generate_base62(KEY_BODY_LEN);
        let plaintext = format!(
            "{}_{}_{body}",
            self.config.prefix,
            request.environment.as_str()
        );
        let key_prefix: String = plaintext.chars().take(KEY_PREFIX_DISPLAY_LEN).collect();

        let meta = ApiKeyMeta {
            key_id: crypto::generate_id(),
            name: request.name.clone(),
            owner_principal_id: request.owner_principal_id.clone(),
            scopes: request.scopes.clone(),
            rate_limit_per_min: request
                .rate_limit_per_min
                .unwrap_or(self.config.default_rate_limit_per_min),
            environment: request.environment,
            key_prefix,
            created_at: Utc::now(),
            expires_at: request.expires_at,
            revoked_at: None,
            last_used_at: None,
            rotated_from,
            rotation_deadline: None,
        };

        MintedKey { meta, plaintext }
    }

    /// Split `<prefix>_<env>_<body>`, checking the system prefix.
    fn parse_plaintext<'a>(&self, plaintext: &'a str) -> Result<(KeyEnvironment, &'a str)> {
        let mut parts = plaintext.splitn(3, '_');
        let (prefix, env, body) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(e), Some(b)) if !b.is_empty() => (p, e, b),
            _ => {
                return Err(Error::InvalidInput("malformed API key".to_string()));
            }
        };
        if prefix != self.config.prefix {
            return Err(Error::InvalidInput("malformed API key".to_string()));
        }
        let env = env.parse::<KeyEnvironment>().map_err(|_| {
            Error::InvalidInput("malformed API key".to_string())
        })?;
        Ok((env, body))
    }
}

/// Digest the body portion of a plaintext key.
fn hash_body_of(plaintext: &str) -> Result<String> {
    let body = plaintext
        .rsplit('_')
        .next()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| Error::Internal("minted key without body".to_string()))?;
    Ok(crypto::sha256_hex(body))
}
