//! Session lifecycle scenarios through the public auth surface
//!
//! The API key credential path drives session creation so the flows run
//! against real issued tokens end to end.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use sark_gateway::Error;
use sark_gateway::apikey::{
    ApiKeyService, InMemoryApiKeyStore, KeyEnvironment, MintRequest, Scope,
};
use sark_gateway::audit::{AuditEmitter, AuditEvent, EventKind};
use sark_gateway::auth::{AuthCore, Credential, InMemorySessionStore, RequestContext};
use sark_gateway::config::{ApiKeyConfig, AuthConfig};
use sark_gateway::siem::FallbackQueue;

struct Harness {
    core: AuthCore,
    keys: Arc<ApiKeyService>,
    audit_rx: mpsc::Receiver<AuditEvent>,
}

fn harness(max_sessions: usize) -> Harness {
    let tmp = std::env::temp_dir().join(format!("sark-it-session-{}", uuid::Uuid::new_v4()));
    let (tx, audit_rx) = mpsc::channel(1024);
    let audit = Arc::new(AuditEmitter::new(
        tx,
        Arc::new(FallbackQueue::new(tmp, 1024 * 1024)),
    ));
    let keys = Arc::new(ApiKeyService::new(
        ApiKeyConfig::default(),
        Arc::new(InMemoryApiKeyStore::new()),
        Arc::clone(&audit),
    ));
    let core = AuthCore::new(
        AuthConfig {
            signing_secret: "it-signing-secret-0123456789abcdef".to_string(),
            max_sessions_per_principal: max_sessions,
            ..AuthConfig::default()
        },
        Arc::new(InMemorySessionStore::new()),
        Arc::clone(&keys),
        audit,
    )
    .expect("auth core");
    Harness { core, keys, audit_rx }
}

async fn mint_credential(keys: &ApiKeyService) -> Credential {
    let minted = keys
        .mint(MintRequest {
            owner_principal_id: "dir:alice".to_string(),
            name: "session test".to_string(),
            scopes: BTreeSet::from([Scope::ServerRead]),
            environment: KeyEnvironment::Live,
            rate_limit_per_min: None,
            expires_at: None,
        })
        .await
        .expect("mint");
    Credential::ApiKey {
        key: minted.plaintext,
    }
}

#[tokio::test]
async fn refresh_token_reuse_revokes_the_whole_session() {
    let h = harness(5);
    let credential = mint_credential(&h.keys).await;

    // Authenticate → refresh token R1.
    let issued = h
        .core
        .authenticate(&credential, &RequestContext::default())
        .await
        .expect("login");
    let r1 = issued.refresh_token;

    // refresh(R1) → R2 (success).
    let (_access, r2) = h.core.refresh(&r1).await.expect("first refresh");

    // refresh(R1) again → SessionCompromised.
    match h.core.refresh(&r1).await {
        Err(Error::SessionCompromised) => {}
        other => panic!("expected SessionCompromised, got {other:?}"),
    }

    // Subsequently refresh(R2) also fails: the session is revoked.
    assert!(h.core.refresh(&r2).await.is_err(), "revoked session must reject R2");
}

#[tokio::test]
async fn at_most_one_refresh_of_a_token_ever_succeeds() {
    let h = harness(5);
    let credential = mint_credential(&h.keys).await;
    let issued = h
        .core
        .authenticate(&credential, &RequestContext::default())
        .await
        .expect("login");

    let (_a, _r2) = h.core.refresh(&issued.refresh_token).await.expect("first");
    assert!(h.core.refresh(&issued.refresh_token).await.is_err(), "second must fail");
}

#[tokio::test]
async fn session_cap_keeps_only_the_newest_sessions_active() {
    let mut h = harness(2);
    let credential = mint_credential(&h.keys).await;

    let s1 = h
        .core
        .authenticate(&credential, &RequestContext::default())
        .await
        .expect("login 1");
    let s2 = h
        .core
        .authenticate(&credential, &RequestContext::default())
        .await
        .expect("login 2");
    let s3 = h
        .core
        .authenticate(&credential, &RequestContext::default())
        .await
        .expect("login 3");

    // Cap is 2: the first session was evicted, the newer two survive.
    assert!(h.core.refresh(&s1.refresh_token).await.is_err(), "oldest evicted");
    assert!(h.core.refresh(&s2.refresh_token).await.is_ok());
    assert!(h.core.refresh(&s3.refresh_token).await.is_ok());

    // An eviction audit event was emitted among the stream.
    let mut saw_eviction = false;
    while let Ok(event) = h.audit_rx.try_recv() {
        if event.event_kind == EventKind::SessionRevoked
            && event.attributes.get("reason").map(String::as_str) == Some("evicted")
        {
            saw_eviction = true;
        }
    }
    assert!(saw_eviction, "eviction must be audited");
}

#[tokio::test]
async fn introspection_is_stateless_and_survives_session_revocation() {
    let h = harness(5);
    let credential = mint_credential(&h.keys).await;
    let issued = h
        .core
        .authenticate(&credential, &RequestContext::default())
        .await
        .expect("login");

    let principal = h.core.introspect(&issued.access_token).expect("valid");
    assert_eq!(principal.principal_id, "dir:alice");

    // Access tokens are stateless by design: revoking the session does not
    // invalidate an outstanding access token before its expiry.
    h.core.revoke(&issued.session_id).await;
    assert!(h.core.introspect(&issued.access_token).is_ok());
}

#[tokio::test]
async fn every_authentication_attempt_is_audited() {
    let mut h = harness(5);
    let credential = mint_credential(&h.keys).await;

    h.core
        .authenticate(&credential, &RequestContext::default())
        .await
        .expect("success");
    let _ = h
        .core
        .authenticate(
            &Credential::ApiKey { key: "sark_live_wrongwrongwrong".to_string() },
            &RequestContext::default(),
        )
        .await
        .expect_err("failure");

    let mut kinds = Vec::new();
    while let Ok(event) = h.audit_rx.try_recv() {
        kinds.push(event.event_kind);
    }
    assert!(kinds.contains(&EventKind::AuthnSuccess));
    assert!(kinds.contains(&EventKind::AuthnFailure));
}
