//! Policy Decision Engine
//!
//! Answers "may this principal perform this action on this resource" with
//! strong caching and total auditability:
//!
//! 1. Canonicalize the input and compute its fingerprint.
//! 2. Consult the decision cache (unless bypassed) under the loaded policy
//!    version.
//! 3. On a miss, call the rule engine — concurrent misses on the same
//!    fingerprint coalesce to one engine call.
//! 4. Cache allow outcomes with a sensitivity-tiered TTL, deny outcomes with
//!    the short deny TTL. Engine failures are never cached.
//! 5. Hand the audit event to the forwarder before returning.
//!
//! Engine timeouts, unreachability, and malformed responses all fail closed.

pub mod cache;
pub mod canonical;
pub mod engine;

pub use cache::{CacheStatsSnapshot, DecisionCache};
pub use canonical::{DecisionInput, PrincipalSnapshot, canonicalize, fingerprint};
pub use engine::{Decision, EngineError, EngineVerdict, HttpRuleEngine, RuleEngine};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::audit::{AuditEmitter, AuditEvent, EventKind};
use crate::config::{PolicyConfig, is_high_sensitivity};
use crate::Result;

/// Where the returned outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    /// Served from the decision cache
    Hit,
    /// Computed by the rule engine
    Miss,
    /// Cache consultation was skipped by request
    Bypass,
}

impl CacheStatus {
    /// Header value for `X-Cache-Status`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }
}

/// A policy decision outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    /// Allow or deny
    pub decision: Decision,
    /// Why
    pub reason: String,
    /// Merged obligations riding on an allow
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub obligations: BTreeMap<String, Value>,
    /// Rule-set version that produced the decision
    pub policy_version: String,
    /// Engine evaluation time (0 on cache hits)
    pub evaluation_ms: u64,
    /// Cache disposition for this call
    pub cache: CacheStatus,
}

impl Outcome {
    fn denied(reason: &str, policy_version: String, evaluation_ms: u64) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.to_string(),
            obligations: BTreeMap::new(),
            policy_version,
            evaluation_ms,
            cache: CacheStatus::Miss,
        }
    }
}

/// The policy decision point.
pub struct DecisionPoint {
    config: PolicyConfig,
    engine: Arc<dyn RuleEngine>,
    cache: DecisionCache,
    /// Single-flight cells, keyed by fingerprint
    inflight: DashMap<String, Arc<OnceCell<Outcome>>>,
    /// Currently loaded policy version; entries cached under another
    /// version read as misses
    policy_version: RwLock<String>,
    audit: Arc<AuditEmitter>,
}

impl DecisionPoint {
    /// Construct over an engine and the audit emitter.
    #[must_use]
    pub fn new(config: PolicyConfig, engine: Arc<dyn RuleEngine>, audit: Arc<AuditEmitter>) -> Self {
        let cache = DecisionCache::new(config.cache.max_entries);
        Self {
            config,
            engine,
            cache,
            inflight: DashMap::new(),
            policy_version: RwLock::new("unversioned".to_string()),
            audit,
        }
    }

    /// Decide one input.
    ///
    /// `bypass_cache` skips the cache consultation (never the engine call);
    /// the fresh outcome still replaces whatever was cached. Invalid inputs
    /// fail closed before the engine is contacted.
    pub async fn decide(&self, input: &DecisionInput, bypass_cache: bool) -> Result<Outcome> {
        if let Err(e) = input.validate() {
            let outcome = Outcome::denied("invalid_input", self.current_version(), 0);
            self.emit_decision(input, "-", &outcome).await;
            debug!(error = %e, "Policy input rejected before engine call");
            return Ok(outcome);
        }

        let canonical = canonicalize(input);
        let fp = fingerprint(&canonical);
        let version = self.current_version();

        if !bypass_cache {
            if let Some(mut outcome) = self.cache.get(&fp, &version) {
                outcome.cache = CacheStatus::Hit;
                self.emit_decision(input, &fp, &outcome).await;
                return Ok(outcome);
            }
        }

        let outcome = if bypass_cache {
            // Bypass callers want a fresh evaluation; they do not join the
            // in-flight computation.
            let mut outcome = self.evaluate(input, &canonical, &fp).await;
            outcome.cache = CacheStatus::Bypass;
            outcome
        } else {
            self.coalesced_evaluate(input, &canonical, &fp).await
        };

        self.emit_decision(input, &fp, &outcome).await;
        Ok(outcome)
    }

    /// Coalesce concurrent misses on one fingerprint into a single engine
    /// call; every waiter observes the same outcome, failures included.
    async fn coalesced_evaluate(
        &self,
        input: &DecisionInput,
        canonical: &Value,
        fp: &str,
    ) -> Outcome {
        let cell = self
            .inflight
            .entry(fp.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let outcome = cell
            .get_or_init(|| self.evaluate(input, canonical, fp))
            .await
            .clone();

        // Retire the cell once resolved; late arrivals go through the cache.
        self.inflight
            .remove_if(fp, |_, existing| Arc::ptr_eq(existing, &cell));

        outcome
    }

    /// One real engine evaluation, including cache insertion.
    async fn evaluate(&self, input: &DecisionInput, canonical: &Value, fp: &str) -> Outcome {
        let started = Instant::now();
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = |s: Instant| s.elapsed().as_millis() as u64;

        match self.engine.evaluate(canonical).await {
            Ok(verdict) => {
                let evaluation_ms = elapsed_ms(started);
                self.adopt_version(&verdict.policy_version);

                let outcome = match merge_obligations(verdict.obligations) {
                    Ok(obligations) => Outcome {
                        decision: verdict.decision,
                        reason: verdict.reason,
                        obligations,
                        policy_version: verdict.policy_version.clone(),
                        evaluation_ms,
                        cache: CacheStatus::Miss,
                    },
                    Err(key) => {
                        warn!(key = %key, "Conflicting obligations, degrading to deny");
                        Outcome::denied(
                            "conflicting_obligations",
                            verdict.policy_version.clone(),
                            evaluation_ms,
                        )
                    }
                };

                let ttl = match outcome.decision {
                    Decision::Allow if is_high_sensitivity(&self.config, &input.resource) => {
                        self.config.cache.ttl_high
                    }
                    Decision::Allow => self.config.cache.ttl_low,
                    Decision::Deny => self.config.cache.ttl_deny,
                };
                self.cache.insert(fp, outcome.clone(), &verdict.policy_version, ttl);
                outcome
            }
            Err(EngineError::Timeout) => {
                warn!(fingerprint = fp, "Rule engine timed out, failing closed");
                Outcome::denied("policy_engine_timeout", self.current_version(), elapsed_ms(started))
            }
            Err(EngineError::Unreachable(detail)) => {
                warn!(fingerprint = fp, detail = %detail, "Rule engine unreachable, failing closed");
                Outcome::denied(
                    "policy_engine_unavailable",
                    self.current_version(),
                    elapsed_ms(started),
                )
            }
            Err(EngineError::Malformed(detail)) => {
                warn!(fingerprint = fp, detail = %detail, "Rule engine response malformed, failing closed");
                self.audit
                    .emit(
                        AuditEvent::new(EventKind::PolicyError)
                            .principal(&*input.principal.id)
                            .action(&*input.action)
                            .resource(&*input.resource)
                            .attribute("fingerprint", fp)
                            .attribute("detail", &*detail),
                    )
                    .await;
                Outcome::denied("policy_engine_error", self.current_version(), elapsed_ms(started))
            }
        }
    }

    /// Record a policy reload: bump the loaded version. Entries cached under
    /// older versions become misses and are purged lazily.
    pub fn set_policy_version(&self, version: impl Into<String>) {
        let version = version.into();
        let mut current = self.policy_version.write();
        if *current != version {
            debug!(old = %current, new = %version, "Policy version bumped");
            *current = version;
        }
    }

    /// The currently loaded policy version.
    #[must_use]
    pub fn current_version(&self) -> String {
        self.policy_version.read().clone()
    }

    /// Cache statistics for the health surface.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    fn adopt_version(&self, version: &str) {
        // The engine's reported version is authoritative; adopting it keeps
        // subsequent cache reads consistent without an explicit reload signal.
        let current = self.policy_version.read();
        if *current != version {
            drop(current);
            self.set_policy_version(version);
        }
    }

    async fn emit_decision(&self, input: &DecisionInput, fp: &str, outcome: &Outcome) {
        let kind = match outcome.decision {
            Decision::Allow => EventKind::PolicyAllow,
            Decision::Deny => EventKind::PolicyDeny,
        };
        self.audit
            .emit(
                AuditEvent::new(kind)
                    .principal(&*input.principal.id)
                    .action(&*input.action)
                    .resource(&*input.resource)
                    .outcome(outcome.decision.as_str())
                    .attribute("fingerprint", fp)
                    .attribute("reason", &*outcome.reason)
                    .attribute("cache", outcome.cache.as_str())
                    .attribute("evaluation_ms", outcome.evaluation_ms.to_string()),
            )
            .await;
    }
}

/// Merge obligation sets last-writer-wins on identical key/value pairs;
/// the same key with different values is a conflict.
fn merge_obligations(
    sets: Vec<BTreeMap<String, Value>>,
) -> std::result::Result<BTreeMap<String, Value>, String> {
    let mut merged = BTreeMap::new();
    for set in sets {
        for (key, value) in set {
            match merged.get(&key) {
                Some(existing) if *existing != value => return Err(key),
                _ => {
                    merged.insert(key, value);
                }
            }
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::siem::fallback::FallbackQueue;

    /// Scriptable engine for tests: counts calls, returns a canned response.
    struct ScriptedEngine {
        calls: AtomicU32,
        response: Box<dyn Fn() -> std::result::Result<EngineVerdict, EngineError> + Send + Sync>,
    }

    impl ScriptedEngine {
        fn allow() -> Self {
            Self::with(|| {
                Ok(EngineVerdict {
                    decision: Decision::Allow,
                    reason: "role_matches".to_string(),
                    obligations: Vec::new(),
                    policy_version: "v1".to_string(),
                })
            })
        }

        fn with(
            f: impl Fn() -> std::result::Result<EngineVerdict, EngineError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                calls: AtomicU32::new(0),
                response: Box::new(f),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl RuleEngine for ScriptedEngine {
        async fn evaluate(&self, _input: &Value) -> std::result::Result<EngineVerdict, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.response)()
        }
    }

    fn harness(engine: Arc<ScriptedEngine>) -> (DecisionPoint, mpsc::Receiver<AuditEvent>) {
        let tmp = std::env::temp_dir().join(format!("sark-policy-test-{}", uuid::Uuid::new_v4()));
        let (tx, rx) = mpsc::channel(256);
        let audit = Arc::new(AuditEmitter::new(
            tx,
            Arc::new(FallbackQueue::new(tmp, 1024 * 1024)),
        ));
        let point = DecisionPoint::new(PolicyConfig::default(), engine, audit);
        (point, rx)
    }

    fn input() -> DecisionInput {
        DecisionInput {
            principal: PrincipalSnapshot {
                id: "u1".to_string(),
                roles: BTreeSet::from(["dev".to_string()]),
                teams: BTreeSet::new(),
            },
            action: "tool:invoke".to_string(),
            resource: "ro_query".to_string(),
            context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn first_call_misses_second_hits_without_engine_call() {
        let engine = Arc::new(ScriptedEngine::allow());
        let (point, mut rx) = harness(Arc::clone(&engine));

        let first = point.decide(&input(), false).await.expect("decide");
        assert_eq!(first.decision, Decision::Allow);
        assert_eq!(first.cache, CacheStatus::Miss);
        assert_eq!(engine.call_count(), 1);

        let second = point.decide(&input(), false).await.expect("decide");
        assert_eq!(second.cache, CacheStatus::Hit);
        assert_eq!(second.decision, first.decision);
        assert_eq!(engine.call_count(), 1, "hit must not call the engine");

        // Both calls audited.
        let a = rx.recv().await.expect("first audit");
        let b = rx.recv().await.expect("second audit");
        assert_eq!(a.event_kind, EventKind::PolicyAllow);
        assert_eq!(b.attributes.get("cache").map(String::as_str), Some("HIT"));
    }

    #[tokio::test]
    async fn bypass_skips_cache_read_but_still_calls_engine() {
        let engine = Arc::new(ScriptedEngine::allow());
        let (point, _rx) = harness(Arc::clone(&engine));

        point.decide(&input(), false).await.expect("prime cache");
        let bypassed = point.decide(&input(), true).await.expect("bypass");
        assert_eq!(bypassed.cache, CacheStatus::Bypass);
        assert_eq!(engine.call_count(), 2, "bypass must reach the engine");
    }

    #[tokio::test]
    async fn timeout_fails_closed_and_is_not_cached() {
        let engine = Arc::new(ScriptedEngine::with(|| Err(EngineError::Timeout)));
        let (point, _rx) = harness(Arc::clone(&engine));

        let outcome = point.decide(&input(), false).await.expect("decide");
        assert_eq!(outcome.decision, Decision::Deny);
        assert_eq!(outcome.reason, "policy_engine_timeout");

        // The failure was not cached: the next call reaches the engine again.
        point.decide(&input(), false).await.expect("decide");
        assert_eq!(engine.call_count(), 2);
    }

    #[tokio::test]
    async fn malformed_response_fails_closed_and_audits_policy_error() {
        let engine = Arc::new(ScriptedEngine::with(|| {
            Err(EngineError::Malformed("gibberish".to_string()))
        }));
        let (point, mut rx) = harness(engine);

        let outcome = point.decide(&input(), false).await.expect("decide");
        assert_eq!(outcome.decision, Decision::Deny);
        assert_eq!(outcome.reason, "policy_engine_error");

        let first = rx.recv().await.expect("audit");
        assert_eq!(first.event_kind, EventKind::PolicyError);
        let second = rx.recv().await.expect("audit");
        assert_eq!(second.event_kind, EventKind::PolicyDeny);
    }

    #[tokio::test]
    async fn invalid_input_fails_closed_before_engine() {
        let engine = Arc::new(ScriptedEngine::allow());
        let (point, _rx) = harness(Arc::clone(&engine));

        let mut bad = input();
        bad.action = String::new();
        let outcome = point.decide(&bad, false).await.expect("decide");
        assert_eq!(outcome.decision, Decision::Deny);
        assert_eq!(outcome.reason, "invalid_input");
        assert_eq!(engine.call_count(), 0, "engine must not be contacted");
    }

    #[tokio::test]
    async fn version_bump_invalidates_cached_entries() {
        let engine = Arc::new(ScriptedEngine::allow());
        let (point, _rx) = harness(Arc::clone(&engine));

        point.decide(&input(), false).await.expect("prime");
        assert_eq!(engine.call_count(), 1);

        point.set_policy_version("v2");
        let outcome = point.decide(&input(), false).await.expect("decide");
        assert_eq!(outcome.cache, CacheStatus::Miss, "stale version is a miss");
        assert_eq!(engine.call_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_identical_decides_coalesce_to_one_engine_call() {
        let engine = Arc::new(ScriptedEngine::with(|| {
            // The barrier is the single-flight cell itself; a tiny sleep
            // widens the window in which waiters pile up.
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(EngineVerdict {
                decision: Decision::Allow,
                reason: "role_matches".to_string(),
                obligations: Vec::new(),
                policy_version: "v1".to_string(),
            })
        }));
        let (point, _rx) = harness(Arc::clone(&engine));
        let point = Arc::new(point);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let point = Arc::clone(&point);
            handles.push(tokio::spawn(async move {
                point.decide(&input(), false).await.expect("decide")
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.expect("join"));
        }

        assert_eq!(engine.call_count(), 1, "exactly one engine call");
        assert!(outcomes.iter().all(|o| o.decision == Decision::Allow));
        assert!(
            outcomes.iter().all(|o| o.reason == "role_matches"),
            "all callers observe the same outcome"
        );
    }

    #[tokio::test]
    async fn conflicting_obligations_degrade_to_deny() {
        let engine = Arc::new(ScriptedEngine::with(|| {
            Ok(EngineVerdict {
                decision: Decision::Allow,
                reason: "ok".to_string(),
                obligations: vec![
                    BTreeMap::from([("redact".to_string(), serde_json::json!(["ssn"]))]),
                    BTreeMap::from([("redact".to_string(), serde_json::json!(["dob"]))]),
                ],
                policy_version: "v1".to_string(),
            })
        }));
        let (point, _rx) = harness(engine);

        let outcome = point.decide(&input(), false).await.expect("decide");
        assert_eq!(outcome.decision, Decision::Deny);
        assert_eq!(outcome.reason, "conflicting_obligations");
    }

    #[test]
    fn obligation_merge_rules() {
        // Identical key/value pairs merge cleanly.
        let merged = merge_obligations(vec![
            BTreeMap::from([("a".to_string(), serde_json::json!(1))]),
            BTreeMap::from([("a".to_string(), serde_json::json!(1)), ("b".to_string(), serde_json::json!(2))]),
        ])
        .expect("merges");
        assert_eq!(merged.len(), 2);

        // Same key, different value: conflict.
        let conflict = merge_obligations(vec![
            BTreeMap::from([("a".to_string(), serde_json::json!(1))]),
            BTreeMap::from([("a".to_string(), serde_json::json!(2))]),
        ]);
        assert_eq!(conflict.expect_err("conflicts"), "a");
    }
}
