//! API key persistence
//!
//! Records are indexed by the SHA-256 digest of the secret body (the
//! validation path) and by `key_id` (the administration path). The plaintext
//! body is never stored; it exists only in the mint/rotate response.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::ApiKeyMeta;

/// A stored API key: metadata plus the body digest.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    /// Non-secret metadata
    pub meta: ApiKeyMeta,
    /// SHA-256 hex digest of the secret body
    pub key_hash: String,
}

/// Trait abstracting the API key storage backend.
#[async_trait::async_trait]
pub trait ApiKeyStore: Send + Sync + 'static {
    /// Insert a new record.
    async fn insert(&self, record: ApiKeyRecord);

    /// Look up by body digest (validation path).
    async fn get_by_hash(&self, hash: &str) -> Option<ApiKeyRecord>;

    /// Look up by key id (administration path).
    async fn get(&self, key_id: &str) -> Option<ApiKeyRecord>;

    /// All keys owned by a principal.
    async fn list_for_owner(&self, owner_principal_id: &str) -> Vec<ApiKeyRecord>;

    /// Mark a key revoked. Idempotent; returns `true` if the key exists.
    async fn set_revoked(&self, key_id: &str, at: DateTime<Utc>) -> bool;

    /// Set the rotation deadline after which the key stops validating.
    async fn set_rotation_deadline(&self, key_id: &str, at: DateTime<Utc>) -> bool;

    /// Best-effort `last_used_at` update; returns `false` when the key is gone.
    async fn touch_last_used(&self, key_id: &str, at: DateTime<Utc>) -> bool;
}

/// In-memory store backed by two `DashMap` indices.
///
/// - `by_hash`: body digest → record (O(1) validation)
/// - `by_id`:   key id → body digest (O(1) administration)
pub struct InMemoryApiKeyStore {
    by_hash: DashMap<String, ApiKeyRecord>,
    by_id: DashMap<String, String>,
}

impl InMemoryApiKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_hash: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    fn with_record<R>(&self, key_id: &str, f: impl FnOnce(&mut ApiKeyRecord) -> R) -> Option<R> {
        let hash = self.by_id.get(key_id)?.clone();
        let mut entry = self.by_hash.get_mut(&hash)?;
        Some(f(&mut entry))
    }
}

impl Default for InMemoryApiKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn insert(&self, record: ApiKeyRecord) {
        self.by_id
            .insert(record.meta.key_id.clone(), record.key_hash.clone());
        self.by_hash.insert(record.key_hash.clone(), record);
    }

    async fn get_by_hash(&self, hash: &str) -> Option<ApiKeyRecord> {
        self.by_hash.get(hash).map(|e| e.clone())
    }

    async fn get(&self, key_id: &str) -> Option<ApiKeyRecord> {
        let hash = self.by_id.get(key_id)?.clone();
        self.by_hash.get(&hash).map(|e| e.clone())
    }

    async fn list_for_owner(&self, owner_principal_id: &str) -> Vec<ApiKeyRecord> {
        self.by_hash
            .iter()
            .filter(|e| e.meta.owner_principal_id == owner_principal_id)
            .map(|e| e.clone())
            .collect()
    }

    async fn set_revoked(&self, key_id: &str, at: DateTime<Utc>) -> bool {
        self.with_record(key_id, |record| {
            if record.meta.revoked_at.is_none() {
                record.meta.revoked_at = Some(at);
            }
        })
        .is_some()
    }

    async fn set_rotation_deadline(&self, key_id: &str, at: DateTime<Utc>) -> bool {
        self.with_record(key_id, |record| {
            record.meta.rotation_deadline = Some(at);
        })
        .is_some()
    }

    async fn touch_last_used(&self, key_id: &str, at: DateTime<Utc>) -> bool {
        self.with_record(key_id, |record| {
            record.meta.last_used_at = Some(at);
        })
        .is_some()
    }
}
