//! Session store — persistence layer for refresh-token-anchored sessions.
//!
//! The [`SessionStore`] trait abstracts over storage backends. The only
//! current implementation is [`InMemorySessionStore`], backed by two `DashMap`
//! indices with a background reaper that evicts expired sessions.
//!
//! # Design
//!
//! Sessions are indexed by `session_id`, *and* every refresh-token hash the
//! session has ever carried is indexed separately with an active/used flag.
//! A used hash that comes back is the reuse-detection signal: the caller must
//! revoke the whole session.
//!
//! Rotation is a compare-and-swap on the stored hash; of two concurrent
//! refreshes at most one can win the CAS, which serializes refreshes without
//! a lock held across await points.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::principal::Principal;

/// A refresh-token-anchored session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub session_id: String,
    /// Owning principal
    pub principal_id: String,
    /// SHA-256 digest of the currently valid refresh token
    pub refresh_token_hash: String,
    /// Creation time
    pub issued_at: DateTime<Utc>,
    /// Hard expiry; restarted by each refresh
    pub expires_at: DateTime<Utc>,
    /// Last refresh or use
    pub last_seen_at: DateTime<Utc>,
    /// Client IP at creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<IpAddr>,
    /// Client user agent at creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Set when the session reaches its terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Principal snapshot used to mint access tokens on refresh
    pub principal: Principal,
}

impl Session {
    /// Past the hard expiry?
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Neither revoked nor expired?
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none() && !self.is_expired()
    }
}

/// Result of a refresh-token lookup.
#[derive(Debug)]
pub enum RefreshLookup {
    /// The hash matches the session's current refresh token
    Active(Box<Session>),
    /// The hash belonged to this session but was already rotated away —
    /// reuse detected
    Used {
        /// Session the replayed token belonged to
        session_id: String,
    },
    /// No session has ever carried this hash
    Unknown,
}

/// Result of a rotation attempt.
#[derive(Debug)]
pub enum RotateResult {
    /// CAS succeeded; the updated session is returned
    Rotated(Box<Session>),
    /// The stored hash no longer matches (concurrent rotation or replay)
    Mismatch,
    /// Session does not exist
    NotFound,
}

/// Trait abstracting the session storage backend.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a newly created session.
    async fn create(&self, session: Session);

    /// Look up a session by id.
    async fn get(&self, session_id: &str) -> Option<Session>;

    /// Look up by refresh-token hash, distinguishing replayed hashes.
    async fn lookup_refresh(&self, hash: &str) -> RefreshLookup;

    /// Compare-and-swap the refresh hash, restarting the expiry window.
    async fn rotate(
        &self,
        session_id: &str,
        expected_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> RotateResult;

    /// Revoke a session. Idempotent; returns `true` if the session existed.
    async fn revoke(&self, session_id: &str) -> bool;

    /// Active (non-revoked, non-expired) sessions for a principal.
    async fn active_for_principal(&self, principal_id: &str) -> Vec<Session>;

    /// Drop expired sessions and their hash indices. Called by the reaper.
    async fn reap_expired(&self) -> usize;
}

struct StoredSession {
    session: Session,
    /// Every hash this session has carried, for index cleanup on reap
    hash_history: Vec<String>,
}

struct RefreshIndexEntry {
    session_id: String,
    used: bool,
}

/// In-memory session store backed by two `DashMap` indices.
pub struct InMemorySessionStore {
    sessions: DashMap<String, StoredSession>,
    by_refresh: DashMap<String, RefreshIndexEntry>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            by_refresh: DashMap::new(),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) {
        let hash = session.refresh_token_hash.clone();
        let session_id = session.session_id.clone();
        self.sessions.insert(
            session_id.clone(),
            StoredSession {
                hash_history: vec![hash.clone()],
                session,
            },
        );
        self.by_refresh.insert(
            hash,
            RefreshIndexEntry {
                session_id,
                used: false,
            },
        );
    }

    async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|e| e.session.clone())
    }

    async fn lookup_refresh(&self, hash: &str) -> RefreshLookup {
        // Clone out of the index guard before touching the session map; the
        // two maps are never locked at the same time.
        let (session_id, used) = match self.by_refresh.get(hash) {
            Some(entry) => (entry.session_id.clone(), entry.used),
            None => return RefreshLookup::Unknown,
        };

        if used {
            return RefreshLookup::Used { session_id };
        }

        match self.sessions.get(&session_id) {
            Some(entry) => RefreshLookup::Active(Box::new(entry.session.clone())),
            None => RefreshLookup::Unknown,
        }
    }

    async fn rotate(
        &self,
        session_id: &str,
        expected_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> RotateResult {
        let (old_hash, rotated) = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return RotateResult::NotFound;
            };
            if entry.session.refresh_token_hash != expected_hash {
                return RotateResult::Mismatch;
            }
            let old_hash = entry.session.refresh_token_hash.clone();
            entry.session.refresh_token_hash = new_hash.to_string();
            entry.session.expires_at = expires_at;
            entry.session.last_seen_at = Utc::now();
            entry.hash_history.push(new_hash.to_string());
            (old_hash, entry.session.clone())
        };

        // Index updates happen after the session guard is released. A replay
        // racing through this window fails the CAS above, which the caller
        // treats as reuse — the same outcome the used flag produces.
        if let Some(mut idx) = self.by_refresh.get_mut(&old_hash) {
            idx.used = true;
        }
        self.by_refresh.insert(
            new_hash.to_string(),
            RefreshIndexEntry {
                session_id: session_id.to_string(),
                used: false,
            },
        );

        RotateResult::Rotated(Box::new(rotated))
    }

    async fn revoke(&self, session_id: &str) -> bool {
        let hashes = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return false;
            };
            if entry.session.revoked_at.is_none() {
                entry.session.revoked_at = Some(Utc::now());
            }
            entry.hash_history.clone()
        };

        // Every hash the session ever carried becomes a reuse tripwire.
        for hash in hashes {
            if let Some(mut idx) = self.by_refresh.get_mut(&hash) {
                idx.used = true;
            }
        }
        true
    }

    async fn active_for_principal(&self, principal_id: &str) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|e| e.session.principal_id == principal_id && e.session.is_active())
            .map(|e| e.session.clone())
            .collect()
    }

    async fn reap_expired(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.session.is_expired())
            .map(|e| e.key().clone())
            .collect();

        let count = expired.len();
        for session_id in expired {
            if let Some((_, stored)) = self.sessions.remove(&session_id) {
                for hash in stored.hash_history {
                    self.by_refresh.remove(&hash);
                }
                debug!(session_id = %stored.session.session_id, "Reaped expired session");
            }
        }
        count
    }
}

/// Spawn a background task that reaps expired sessions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired sessions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use chrono::TimeDelta;

    use super::*;
    use crate::auth::principal::PrincipalKind;

    fn make_principal(id: &str) -> Principal {
        Principal {
            principal_id: id.to_string(),
            kind: PrincipalKind::User,
            display_name: id.to_string(),
            email: None,
            roles: BTreeSet::new(),
            teams: BTreeSet::new(),
            attributes: HashMap::new(),
        }
    }

    fn make_session(id: &str, principal_id: &str, hash: &str, ttl_secs: i64) -> Session {
        let now = Utc::now();
        Session {
            session_id: id.to_string(),
            principal_id: principal_id.to_string(),
            refresh_token_hash: hash.to_string(),
            issued_at: now,
            expires_at: now + TimeDelta::seconds(ttl_secs),
            last_seen_at: now,
            source_ip: None,
            user_agent: None,
            revoked_at: None,
            principal: make_principal(principal_id),
        }
    }

    #[tokio::test]
    async fn create_then_lookup_by_refresh_hash() {
        let store = InMemorySessionStore::new();
        store.create(make_session("s1", "u1", "hash-a", 3600)).await;

        match store.lookup_refresh("hash-a").await {
            RefreshLookup::Active(s) => assert_eq!(s.session_id, "s1"),
            other => panic!("expected Active, got {other:?}"),
        }
        assert!(matches!(store.lookup_refresh("no-such").await, RefreshLookup::Unknown));
    }

    #[tokio::test]
    async fn rotate_swaps_hash_and_flags_old_as_used() {
        // GIVEN: a session on hash-a
        let store = InMemorySessionStore::new();
        store.create(make_session("s1", "u1", "hash-a", 3600)).await;

        // WHEN: rotated to hash-b
        let expires = Utc::now() + TimeDelta::days(7);
        let result = store.rotate("s1", "hash-a", "hash-b", expires).await;
        assert!(matches!(result, RotateResult::Rotated(_)));

        // THEN: the new hash resolves, the old hash is a reuse signal
        assert!(matches!(store.lookup_refresh("hash-b").await, RefreshLookup::Active(_)));
        match store.lookup_refresh("hash-a").await {
            RefreshLookup::Used { session_id } => assert_eq!(session_id, "s1"),
            other => panic!("expected Used, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rotate_cas_rejects_stale_hash() {
        let store = InMemorySessionStore::new();
        store.create(make_session("s1", "u1", "hash-a", 3600)).await;

        let expires = Utc::now() + TimeDelta::days(7);
        assert!(matches!(
            store.rotate("s1", "hash-a", "hash-b", expires).await,
            RotateResult::Rotated(_)
        ));
        // Second rotation against the already-replaced hash loses the CAS.
        assert!(matches!(
            store.rotate("s1", "hash-a", "hash-c", expires).await,
            RotateResult::Mismatch
        ));
        assert!(matches!(
            store.rotate("missing", "x", "y", expires).await,
            RotateResult::NotFound
        ));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_poisons_all_hashes() {
        let store = InMemorySessionStore::new();
        store.create(make_session("s1", "u1", "hash-a", 3600)).await;
        let expires = Utc::now() + TimeDelta::days(7);
        store.rotate("s1", "hash-a", "hash-b", expires).await;

        assert!(store.revoke("s1").await);
        assert!(store.revoke("s1").await, "second revoke must also succeed");

        // Both the rotated-away and the current hash now read as used.
        assert!(matches!(store.lookup_refresh("hash-a").await, RefreshLookup::Used { .. }));
        assert!(matches!(store.lookup_refresh("hash-b").await, RefreshLookup::Used { .. }));
        assert!(!store.get("s1").await.expect("tombstone kept").is_active());
    }

    #[tokio::test]
    async fn active_for_principal_excludes_revoked_and_expired() {
        let store = InMemorySessionStore::new();
        store.create(make_session("s1", "u1", "h1", 3600)).await;
        store.create(make_session("s2", "u1", "h2", 3600)).await;
        store.create(make_session("s3", "u1", "h3", -1)).await; // expired
        store.create(make_session("s4", "u2", "h4", 3600)).await;
        store.revoke("s2").await;

        let active = store.active_for_principal("u1").await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "s1");
    }

    #[tokio::test]
    async fn reap_removes_expired_sessions_and_their_indices() {
        let store = InMemorySessionStore::new();
        store.create(make_session("s1", "u1", "h1", -1)).await;
        store.create(make_session("s2", "u1", "h2", 3600)).await;

        let reaped = store.reap_expired().await;
        assert_eq!(reaped, 1);
        assert!(store.get("s1").await.is_none());
        assert!(matches!(store.lookup_refresh("h1").await, RefreshLookup::Unknown));
        assert!(store.get("s2").await.is_some());
    }
}
