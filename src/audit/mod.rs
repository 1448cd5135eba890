//! Canonical audit events and the emitter that publishes them
//!
//! Every subsystem (authn, policy, API keys, sessions) reports through the
//! [`AuditEmitter`]. Events are frozen once constructed; downstream stages
//! only annotate delivery metadata. The emitter never blocks its caller on
//! SIEM slowness: past a short grace it diverts events straight to the
//! fallback queue and counts the diversion.
//!
//! # Event kinds
//!
//! | Kind | When |
//! |------|------|
//! | `authn_success` / `authn_failure` | Every authentication attempt |
//! | `policy_allow` / `policy_deny` | Every policy decision |
//! | `policy_error` | Rule engine returned garbage |
//! | `key_issued` / `key_rotated` / `key_revoked` | API key lifecycle |
//! | `session_revoked` | Session ended by revoke, expiry, eviction, or reuse detection |

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::siem::fallback::FallbackQueue;

/// Audit event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Successful authentication
    AuthnSuccess,
    /// Failed authentication attempt
    AuthnFailure,
    /// Policy decision: allow
    PolicyAllow,
    /// Policy decision: deny
    PolicyDeny,
    /// Rule engine returned a malformed response
    PolicyError,
    /// API key minted
    KeyIssued,
    /// API key rotated
    KeyRotated,
    /// API key revoked
    KeyRevoked,
    /// Session ended
    SessionRevoked,
}

/// A canonical audit event. Content is frozen once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event id (deduplication key for at-least-once delivery)
    pub event_id: String,
    /// When the event occurred
    pub occurred_at: DateTime<Utc>,
    /// Event kind
    pub event_kind: EventKind,
    /// Principal involved, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    /// Action attempted, for policy events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Resource acted on, for policy events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Outcome label (`allow`, `deny`, `success`, `failure`, `cancelled`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Free-form attributes
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl AuditEvent {
    /// Construct an event of `kind` with a fresh id and timestamp.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            event_kind: kind,
            principal_id: None,
            action: None,
            resource: None,
            outcome: None,
            attributes: HashMap::new(),
        }
    }

    /// Attach the principal.
    #[must_use]
    pub fn principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    /// Attach the action.
    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Attach the resource.
    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Attach the outcome label.
    #[must_use]
    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Attach one attribute.
    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Pseudo-destination recorded on fallback entries written by the emitter
/// itself (queue saturation), as opposed to a real SIEM destination.
pub const EMITTER_FALLBACK_DESTINATION: &str = "audit_queue";

/// Publishes audit events into the SIEM forwarder's bounded queue.
pub struct AuditEmitter {
    tx: mpsc::Sender<AuditEvent>,
    fallback: Arc<FallbackQueue>,
    /// How long `emit` may wait on a saturated queue before diverting
    block_grace: Duration,
    diverted: AtomicU64,
}

impl AuditEmitter {
    /// Create an emitter feeding `tx` (the forwarder ingress) with `fallback`
    /// as the overflow path.
    #[must_use]
    pub fn new(tx: mpsc::Sender<AuditEvent>, fallback: Arc<FallbackQueue>) -> Self {
        Self {
            tx,
            fallback,
            block_grace: Duration::from_millis(100),
            diverted: AtomicU64::new(0),
        }
    }

    /// Publish one event.
    ///
    /// Fast path is a lock-free `try_send`. On a saturated queue the emitter
    /// waits at most `block_grace`, then diverts to the fallback queue so the
    /// calling subsystem is never held hostage by SIEM slowness. Diversion is
    /// counted; nothing is silently lost.
    pub async fn emit(&self, event: AuditEvent) {
        let event = match self.tx.try_send(event) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(ev)) => {
                self.divert(ev).await;
                return;
            }
            Err(mpsc::error::TrySendError::Full(ev)) => ev,
        };

        // Brief backpressure window before giving up on the queue. The timed
        // send operates on a clone; on timeout the in-flight send is dropped
        // and the original event goes to the fallback queue instead.
        let queued = event.clone();
        match tokio::time::timeout(self.block_grace, self.tx.send(queued)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => self.divert(event).await,
        }
    }

    async fn divert(&self, event: AuditEvent) {
        self.diverted.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self
            .fallback
            .append(EMITTER_FALLBACK_DESTINATION, &[event], "forwarder queue saturated")
            .await
        {
            warn!(error = %e, "Failed to divert audit event to fallback queue");
        }
    }

    /// Number of events diverted to the fallback queue.
    pub fn diverted_count(&self) -> u64 {
        self.diverted.load(Ordering::Relaxed)
    }
}
