//! Rule engine client
//!
//! The external rule engine is queried over HTTP: `POST /v1/data/<package>`
//! with `{"input": <canonical_input>}`. A response without a `result` member
//! is a malformed response, and every call is bounded by a strict timeout.
//! The [`RuleEngine`] trait is the seam the decision point depends on, which
//! keeps the engine mockable.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::PolicyConfig;

/// Engine-side failure classes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The call exceeded the configured timeout
    #[error("rule engine timed out")]
    Timeout,

    /// Connection-level failure or non-2xx status
    #[error("rule engine unreachable: {0}")]
    Unreachable(String),

    /// 2xx response that does not parse into a verdict
    #[error("rule engine returned a malformed response: {0}")]
    Malformed(String),
}

/// The allow/deny verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Permit the action
    Allow,
    /// Refuse the action
    Deny,
}

impl Decision {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// What the engine said, before obligation merging.
#[derive(Debug, Clone)]
pub struct EngineVerdict {
    /// Allow or deny
    pub decision: Decision,
    /// Engine-provided reason
    pub reason: String,
    /// Obligation sets, merged downstream
    pub obligations: Vec<BTreeMap<String, Value>>,
    /// Version of the rule set that produced this verdict
    pub policy_version: String,
}

/// Seam over the engine transport.
#[async_trait::async_trait]
pub trait RuleEngine: Send + Sync + 'static {
    /// Evaluate one canonical input.
    async fn evaluate(&self, canonical_input: &Value) -> Result<EngineVerdict, EngineError>;
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    input: &'a Value,
}

#[derive(Debug, Deserialize)]
struct EngineResponse {
    result: Option<EngineResult>,
}

/// Obligations arrive either as one map or as an array of maps.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ObligationsField {
    Single(BTreeMap<String, Value>),
    Many(Vec<BTreeMap<String, Value>>),
}

#[derive(Debug, Deserialize)]
struct EngineResult {
    decision: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    obligations: Option<ObligationsField>,
    #[serde(default)]
    policy_version: Option<String>,
}

/// HTTP rule engine client.
pub struct HttpRuleEngine {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpRuleEngine {
    /// Build from policy configuration.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Config`] when the HTTP client cannot be constructed.
    pub fn new(config: &PolicyConfig) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.engine_timeout)
            .build()
            .map_err(|e| crate::Error::Config(format!("rule engine client: {e}")))?;
        Ok(Self {
            http,
            url: format!(
                "{}/v1/data/{}",
                config.engine_url.trim_end_matches('/'),
                config.package
            ),
            timeout: config.engine_timeout,
        })
    }
}

#[async_trait::async_trait]
impl RuleEngine for HttpRuleEngine {
    async fn evaluate(&self, canonical_input: &Value) -> Result<EngineVerdict, EngineError> {
        // The reqwest client carries the same timeout; the outer bound also
        // covers time spent reading the body.
        let send = self
            .http
            .post(&self.url)
            .json(&EngineRequest { input: canonical_input })
            .send();

        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Unreachable(format!("engine returned {status}")));
        }

        let body: EngineResponse = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|e| EngineError::Malformed(e.to_string()))?;

        parse_result(body)
    }
}

/// Interpret the engine response; a missing `result` is malformed.
fn parse_result(body: EngineResponse) -> Result<EngineVerdict, EngineError> {
    let result = body
        .result
        .ok_or_else(|| EngineError::Malformed("missing result".to_string()))?;

    let decision = match result.decision.as_str() {
        "allow" => Decision::Allow,
        "deny" => Decision::Deny,
        other => {
            warn!(decision = other, "Rule engine returned unknown decision");
            return Err(EngineError::Malformed(format!("unknown decision '{other}'")));
        }
    };

    let obligations = match result.obligations {
        None => Vec::new(),
        Some(ObligationsField::Single(map)) => vec![map],
        Some(ObligationsField::Many(maps)) => maps,
    };

    Ok(EngineVerdict {
        decision,
        reason: result.reason.unwrap_or_default(),
        obligations,
        policy_version: result.policy_version.unwrap_or_else(|| "unversioned".to_string()),
    })
}
