//! API key rate limiting end to end: a key carrying its own per-minute
//! limit is throttled by the keyed bucket exactly at that limit.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use sark_gateway::Error;
use sark_gateway::apikey::{
    ApiKeyService, InMemoryApiKeyStore, KeyEnvironment, MintRequest, Scope,
};
use sark_gateway::audit::AuditEmitter;
use sark_gateway::config::{ApiKeyConfig, RateLimitConfig};
use sark_gateway::ratelimit::{LimitScope, RateLimitGate};
use sark_gateway::siem::FallbackQueue;

fn service() -> Arc<ApiKeyService> {
    let tmp = std::env::temp_dir().join(format!("sark-it-apikey-{}", uuid::Uuid::new_v4()));
    let (tx, _rx) = mpsc::channel(64);
    let audit = Arc::new(AuditEmitter::new(
        tx,
        Arc::new(FallbackQueue::new(tmp, 1024 * 1024)),
    ));
    Arc::new(ApiKeyService::new(
        ApiKeyConfig::default(),
        Arc::new(InMemoryApiKeyStore::new()),
        audit,
    ))
}

#[tokio::test]
async fn eleventh_request_within_a_minute_is_rate_limited() {
    let keys = service();
    let gate = RateLimitGate::new(RateLimitConfig::default());

    let minted = keys
        .mint(MintRequest {
            owner_principal_id: "dir:alice".to_string(),
            name: "limited".to_string(),
            scopes: BTreeSet::from([Scope::ServerRead]),
            environment: KeyEnvironment::Live,
            rate_limit_per_min: Some(10),
            expires_at: None,
        })
        .await
        .expect("mint");

    // Requests 1-10 validate and pass the bucket.
    for i in 1..=10 {
        let principal = keys.validate(&minted.plaintext).await.expect("key valid");
        let decision = gate
            .check(
                LimitScope::ApiKey,
                &principal.key_id,
                Some(principal.rate_limit_per_min),
                false,
            )
            .unwrap_or_else(|_| panic!("request {i} should pass"));
        assert_eq!(decision.limit, 10);
    }

    // Request 11 is rejected with Retry-After and the limit headers.
    let principal = keys.validate(&minted.plaintext).await.expect("key still valid");
    match gate.check(
        LimitScope::ApiKey,
        &principal.key_id,
        Some(principal.rate_limit_per_min),
        false,
    ) {
        Err(Error::RateLimited { retry_after_secs, limit, .. }) => {
            assert!(retry_after_secs > 0, "Retry-After must be positive");
            assert_eq!(limit, 10);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn plaintext_appears_only_in_the_creation_response() {
    let keys = service();
    let minted = keys
        .mint(MintRequest {
            owner_principal_id: "dir:alice".to_string(),
            name: "secret handling".to_string(),
            scopes: BTreeSet::new(),
            environment: KeyEnvironment::Test,
            rate_limit_per_min: None,
            expires_at: None,
        })
        .await
        .expect("mint");

    let body = minted.plaintext.rsplit('_').next().expect("body");

    // Nothing the service exposes afterwards contains the secret body.
    let listed = keys.list_for_owner("dir:alice").await;
    let listed_json = serde_json::to_string(&listed).expect("serializes");
    assert!(!listed_json.contains(body), "stored metadata must not leak the secret");
    assert!(listed_json.contains(&minted.meta.key_prefix), "display prefix is kept");

    let fetched = keys.get(&minted.meta.key_id).await.expect("meta");
    assert!(!serde_json::to_string(&fetched).expect("serializes").contains(body));
}

#[tokio::test]
async fn rotation_chain_leaves_only_the_latest_key_valid_after_finalization() {
    let keys = service();
    let first = keys
        .mint(MintRequest {
            owner_principal_id: "dir:alice".to_string(),
            name: "rotating".to_string(),
            scopes: BTreeSet::from([Scope::ServerWrite]),
            environment: KeyEnvironment::Live,
            rate_limit_per_min: Some(100),
            expires_at: None,
        })
        .await
        .expect("mint");

    let second = keys.rotate(&first.meta.key_id).await.expect("rotate once");
    let third = keys.rotate(&second.meta.key_id).await.expect("rotate twice");

    // Three keys exist in total for the owner.
    assert_eq!(keys.list_for_owner("dir:alice").await.len(), 3);

    keys.finalize(&first.meta.key_id).await.expect("finalize first");
    keys.finalize(&second.meta.key_id).await.expect("finalize second");

    assert!(keys.validate(&first.plaintext).await.is_err());
    assert!(keys.validate(&second.plaintext).await.is_err());
    let principal = keys.validate(&third.plaintext).await.expect("latest valid");
    assert!(principal.scopes.contains(&Scope::ServerWrite), "scopes carry over");
    assert_eq!(principal.rate_limit_per_min, 100, "rate limit carries over");
}
