//! Decision-input canonicalization and fingerprinting
//!
//! Two semantically equal inputs must produce the same fingerprint
//! regardless of map ordering or volatile per-request noise. The canonical
//! form sorts every map (serde_json's default map is a `BTreeMap`, so
//! serialization order is already key order), trims strings, strips fields
//! that must not influence decisions, and buckets the timestamp to the
//! minute.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto;
use crate::{Error, Result};

/// Context keys stripped before fingerprinting: request-scoped noise that
/// must never influence a decision.
const VOLATILE_CONTEXT_KEYS: &[&str] = &["request_id", "trace_id", "span_id"];

/// The principal subset that participates in decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalSnapshot {
    /// Principal id
    pub id: String,
    /// Role snapshot
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Team snapshot
    #[serde(default)]
    pub teams: BTreeSet<String>,
}

/// One policy decision input. Semantically immutable per decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionInput {
    /// Who is asking
    pub principal: PrincipalSnapshot,
    /// What they want to do
    pub action: String,
    /// What they want to do it to
    pub resource: String,
    /// Request context (timestamp, source IP, MFA state, ...)
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl DecisionInput {
    /// Reject inputs missing the fields a decision requires.
    pub fn validate(&self) -> Result<()> {
        if self.principal.id.trim().is_empty() {
            return Err(Error::InvalidInput("principal.id is required".to_string()));
        }
        if self.action.trim().is_empty() {
            return Err(Error::InvalidInput("action is required".to_string()));
        }
        if self.resource.trim().is_empty() {
            return Err(Error::InvalidInput("resource is required".to_string()));
        }
        Ok(())
    }
}

/// Produce the canonical JSON form of an input.
///
/// Idempotent: canonicalizing an already-canonical value is a no-op.
#[must_use]
pub fn canonicalize(input: &DecisionInput) -> Value {
    let mut context = serde_json::Map::new();
    for (key, value) in &input.context {
        if VOLATILE_CONTEXT_KEYS.contains(&key.as_str()) {
            continue;
        }
        let value = if key == "timestamp" {
            bucket_timestamp(value)
        } else {
            value.clone()
        };
        context.insert(key.trim().to_string(), value);
    }

    serde_json::json!({
        "principal": {
            "id": input.principal.id.trim(),
            "roles": input.principal.roles,
            "teams": input.principal.teams,
        },
        "action": input.action.trim(),
        "resource": input.resource.trim(),
        "context": Value::Object(context),
    })
}

/// Fingerprint = SHA-256 over the canonical serialization.
#[must_use]
pub fn fingerprint(canonical: &Value) -> String {
    crypto::sha256_hex(&canonical.to_string())
}

/// Truncate an RFC 3339 timestamp to the minute; exact seconds must not
/// produce distinct fingerprints. Unparseable values pass through.
fn bucket_timestamp(value: &Value) -> Value {
    let Some(raw) = value.as_str() else {
        return value.clone();
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => {
            let bucketed = dt
                .with_timezone(&Utc)
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or_else(|| dt.with_timezone(&Utc));
            Value::String(bucketed.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        }
        Err(_) => value.clone(),
    }
}
