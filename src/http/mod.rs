//! HTTP façade
//!
//! The thin axum surface over the core: authentication, API key
//! administration, policy evaluation, and a health snapshot. Exactly one of
//! `Authorization: Bearer <jwt>` or `X-API-Key: <plaintext>` authenticates a
//! request; presenting both is an error. Rate-limit headers ride on every
//! rate-limited response, and policy responses carry `X-Cache-Status`.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::apikey::{ApiKeyMeta, ApiKeyPrincipal, ApiKeyService, KeyEnvironment, MintRequest, Scope};
use crate::audit::AuditEmitter;
use crate::auth::{AuthCore, Credential, Principal, RequestContext};
use crate::policy::{DecisionInput, DecisionPoint, Outcome};
use crate::ratelimit::{LimitScope, RateLimitDecision, RateLimitGate};
use crate::siem::SiemForwarder;
use crate::{Error, Result};

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header requesting a decision-cache bypass (admin principals only).
pub const SKIP_CACHE_HEADER: &str = "x-skip-cache";
/// Cache disposition response header.
pub const CACHE_STATUS_HEADER: &str = "x-cache-status";

/// Shared handler state.
pub struct AppState {
    /// Authentication core
    pub auth: Arc<AuthCore>,
    /// API key subsystem
    pub api_keys: Arc<ApiKeyService>,
    /// Policy decision point
    pub policy: Arc<DecisionPoint>,
    /// Ingress rate limiter
    pub rate_limits: Arc<RateLimitGate>,
    /// SIEM forwarder (health snapshots)
    pub forwarder: Arc<SiemForwarder>,
    /// Audit emitter (health snapshots)
    pub emitter: Arc<AuditEmitter>,
    /// Role that unlocks admin-only surfaces
    pub admin_role: String,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/login/{provider}", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/revoke", post(revoke))
        .route("/auth/me", get(me))
        .route("/auth/providers", get(providers))
        .route("/auth/api-keys", post(create_api_key).get(list_api_keys))
        .route("/auth/api-keys/{id}", delete(delete_api_key))
        .route("/auth/api-keys/{id}/rotate", post(rotate_api_key))
        .route("/policy/evaluate", post(evaluate))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A request's authenticated identity plus its rate-limit disposition.
struct Authed {
    principal: Principal,
    session_id: Option<String>,
    api_key: Option<ApiKeyPrincipal>,
    limit: Option<RateLimitDecision>,
}

impl Authed {
    fn is_admin(&self, admin_role: &str) -> bool {
        self.principal.is_admin(admin_role)
    }

    /// API-key callers need the listed scopes; user tokens pass.
    fn require_scopes(&self, required: &[Scope]) -> Result<()> {
        match &self.api_key {
            Some(key) => key.require_scopes(required),
            None => Ok(()),
        }
    }
}

/// Wrapper turning core errors into HTTP responses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        }));

        let mut response = (status, body).into_response();
        if let Error::RateLimited { retry_after_secs, limit, reset_at } = &self.0 {
            let headers = response.headers_mut();
            insert_header(headers, "retry-after", retry_after_secs.to_string());
            insert_header(headers, "x-ratelimit-limit", limit.to_string());
            insert_header(headers, "x-ratelimit-remaining", "0".to_string());
            insert_header(headers, "x-ratelimit-reset", reset_at.to_string());
        }
        response
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

fn limit_headers(decision: &RateLimitDecision) -> [(&'static str, String); 3] {
    [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.to_string()),
    ]
}

/// Resolve the caller's identity from the credentials on the request.
///
/// Exactly one of `Authorization: Bearer` and `X-API-Key` must be present.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Authed> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    match (bearer, api_key) {
        (Some(_), Some(_)) => {
            debug!("Request presented both a bearer token and an API key");
            Err(Error::InvalidCredential)
        }
        (Some(token), None) => {
            let claims = state.auth.verify_claims(token)?;
            let principal = claims.to_principal();
            let limit = state.rate_limits.check(
                LimitScope::User,
                &principal.principal_id,
                None,
                principal.is_admin(&state.admin_role),
            )?;
            Ok(Authed {
                principal,
                session_id: Some(claims.sid),
                api_key: None,
                limit: Some(limit),
            })
        }
        (None, Some(key)) => {
            let key_principal = state.api_keys.validate(key).await?;
            let limit = state.rate_limits.check(
                LimitScope::ApiKey,
                &key_principal.key_id,
                Some(key_principal.rate_limit_per_min),
                false,
            )?;
            Ok(Authed {
                principal: key_principal.to_principal(),
                session_id: None,
                api_key: Some(key_principal),
                limit: Some(limit),
            })
        }
        (None, None) => Err(Error::InvalidCredential),
    }
}

/// Rate-limit unauthenticated traffic by source IP.
fn check_public_limit(state: &AppState, addr: SocketAddr) -> Result<RateLimitDecision> {
    state
        .rate_limits
        .check(LimitScope::Ip, &addr.ip().to_string(), None, false)
}

// ── authentication ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    principal: Principal,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let limit = check_public_limit(&state, addr)?;

    // The path segment names the credential variant; the body carries its
    // fields.
    let kind = match provider.as_str() {
        "directory" | "oidc" | "saml" | "api_key" => provider.as_str(),
        _ => {
            return Err(ApiError(Error::InvalidInput(format!(
                "unknown provider '{provider}'"
            ))));
        }
    };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("type".to_string(), json!(kind));
    }
    let credential: Credential = serde_json::from_value(body)
        .map_err(|e| ApiError(Error::InvalidInput(format!("bad credential body: {e}"))))?;

    let ctx = RequestContext {
        source_ip: Some(addr.ip()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    };

    let issued = state.auth.authenticate(&credential, &ctx).await?;
    let response = (
        limit_headers(&limit),
        Json(LoginResponse {
            access_token: issued.access_token,
            refresh_token: issued.refresh_token,
            token_type: "Bearer",
            principal: issued.principal,
        }),
    )
        .into_response();
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<RefreshResponse>> {
    check_public_limit(&state, addr)?;
    let (access_token, refresh_token) = state.auth.refresh(&body.refresh_token).await?;
    Ok(Json(RefreshResponse {
        access_token,
        refresh_token,
        token_type: "Bearer",
    }))
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    session_id: String,
}

async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RevokeRequest>,
) -> ApiResult<StatusCode> {
    let authed = authenticate(&state, &headers).await?;

    // A caller may revoke their own session; admins may revoke any.
    let own = authed.session_id.as_deref() == Some(body.session_id.as_str());
    if !own && !authed.is_admin(&state.admin_role) {
        return Err(ApiError(Error::Forbidden(
            "cannot revoke another principal's session".to_string(),
        )));
    }

    state.auth.revoke(&body.session_id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Principal>> {
    let authed = authenticate(&state, &headers).await?;
    Ok(Json(authed.principal))
}

async fn providers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "providers": state.auth.provider_names() }))
}

// ── API keys ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    scopes: Vec<String>,
    #[serde(default)]
    env: Option<String>,
    #[serde(default)]
    rate_limit: Option<u32>,
    #[serde(default)]
    expires_in_days: Option<i64>,
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyRequest>,
) -> ApiResult<Response> {
    let authed = authenticate(&state, &headers).await?;
    authed.require_scopes(&[Scope::KeysWrite])?;

    let mut scopes = BTreeSet::new();
    for raw in &body.scopes {
        scopes.insert(raw.parse::<Scope>()?);
    }
    let environment = match body.env.as_deref() {
        None => KeyEnvironment::Live,
        Some(raw) => raw.parse::<KeyEnvironment>()?,
    };

    let minted = state
        .api_keys
        .mint(MintRequest {
            owner_principal_id: authed.principal.principal_id.clone(),
            name: body.name,
            scopes,
            environment,
            rate_limit_per_min: body.rate_limit,
            expires_at: body
                .expires_in_days
                .map(|days| Utc::now() + chrono::Duration::days(days)),
        })
        .await?;

    // The only response that ever carries the plaintext.
    Ok((StatusCode::CREATED, Json(minted)).into_response())
}

async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ApiKeyMeta>>> {
    let authed = authenticate(&state, &headers).await?;
    authed.require_scopes(&[Scope::KeysRead])?;
    let keys = state
        .api_keys
        .list_for_owner(&authed.principal.principal_id)
        .await;
    Ok(Json(keys))
}

async fn owner_or_admin(state: &AppState, authed: &Authed, key_id: &str) -> Result<()> {
    let Some(meta) = state.api_keys.get(key_id).await else {
        return Err(Error::SessionNotFound);
    };
    if meta.owner_principal_id != authed.principal.principal_id
        && !authed.is_admin(&state.admin_role)
    {
        return Err(Error::Forbidden("not the key owner".to_string()));
    }
    Ok(())
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<StatusCode> {
    let authed = authenticate(&state, &headers).await?;
    authed.require_scopes(&[Scope::KeysWrite])?;
    owner_or_admin(&state, &authed, &key_id).await?;
    state.api_keys.revoke(&key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<Response> {
    let authed = authenticate(&state, &headers).await?;
    authed.require_scopes(&[Scope::KeysWrite])?;
    owner_or_admin(&state, &authed, &key_id).await?;
    let minted = state.api_keys.rotate(&key_id).await?;
    Ok((StatusCode::CREATED, Json(minted)).into_response())
}

// ── policy ──────────────────────────────────────────────────────────────

async fn evaluate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<DecisionInput>,
) -> ApiResult<Response> {
    let authed = authenticate(&state, &headers).await?;
    authed.require_scopes(&[Scope::PolicyRead])?;

    // The bypass header skips the cache, never the engine; it is honoured
    // only for admin principals.
    let bypass = headers.contains_key(SKIP_CACHE_HEADER) && authed.is_admin(&state.admin_role);

    let outcome: Outcome = state.policy.decide(&input, bypass).await?;

    let mut response = Json(&outcome).into_response();
    insert_header(
        response.headers_mut(),
        CACHE_STATUS_HEADER,
        outcome.cache.as_str().to_string(),
    );
    if let Some(limit) = &authed.limit {
        for (name, value) in limit_headers(limit) {
            insert_header(response.headers_mut(), name, value);
        }
    }
    Ok(response)
}

// ── health ──────────────────────────────────────────────────────────────

async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "siem_destinations": state.forwarder.destination_snapshots(),
        "policy_cache": state.policy.cache_stats(),
        "policy_version": state.policy.current_version(),
        "audit_diverted": state.emitter.diverted_count(),
        "rate_limit_buckets": state.rate_limits.bucket_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_error_response_carries_headers() {
        let response = ApiError(Error::RateLimited {
            retry_after_secs: 7,
            limit: 10,
            reset_at: 1_700_000_000,
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("retry-after").unwrap(), "7");
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "1700000000");
    }

    #[test]
    fn error_bodies_expose_code_and_safe_message_only() {
        let response = ApiError(Error::InvalidCredential).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
