//! Configuration management
//!
//! Configuration is layered: YAML file first, then `SARK_`-prefixed
//! environment variables (nested keys separated by `__`, e.g.
//! `SARK_POLICY__ENGINE_URL`). Every option has a default; the only values
//! without one are the secrets that `validate` insists on before serving.

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication configuration (tokens, sessions, providers)
    pub auth: AuthConfig,
    /// API key subsystem configuration
    pub api_keys: ApiKeyConfig,
    /// Policy decision engine configuration
    pub policy: PolicyConfig,
    /// Ingress rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// SIEM forwarding configuration
    pub siem: SiemConfig,
    /// Failsafe configuration (circuit breaker + retry) for SIEM dispatch
    pub failsafe: FailsafeConfig,
    /// Fallback queue configuration
    pub fallback: FallbackConfig,
}

impl Config {
    /// Load configuration from an optional YAML file plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file or environment cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("SARK_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(format!("failed to load configuration: {e}")))
    }

    /// Validate the configuration before serving.
    ///
    /// Misconfiguration is fatal at startup: a gateway with no signing secret
    /// or no rule-engine URL must refuse to serve rather than fail open.
    pub fn validate(&self) -> Result<()> {
        if self.auth.signing_secret.len() < 32 {
            return Err(Error::Config(
                "auth.signing_secret must be at least 32 bytes".to_string(),
            ));
        }
        if self.policy.engine_url.is_empty() {
            return Err(Error::Config("policy.engine_url is required".to_string()));
        }
        if self.siem.batch_size == 0 {
            return Err(Error::Config("siem.batch_size must be > 0".to_string()));
        }
        for dest in &self.siem.destinations {
            dest.validate()?;
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Log level when RUST_LOG is unset
    pub log_level: String,
    /// Log format: "pretty" or "json"
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for access-token signing. Required, >= 32 bytes.
    pub signing_secret: String,
    /// Access token TTL (absolute from issuance)
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Refresh token TTL (restarts on each refresh)
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
    /// Maximum concurrent sessions per principal
    pub max_sessions_per_principal: usize,
    /// Optional idle timeout: sessions idle longer are revoked on next refresh
    #[serde(default, with = "humantime_serde::option")]
    pub idle_timeout: Option<Duration>,
    /// Identity provider configurations, tried in declaration order
    pub providers: ProvidersConfig,
    /// Role that unlocks admin-only surfaces (cache bypass, key administration)
    pub admin_role: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            access_token_ttl: Duration::from_secs(60 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_sessions_per_principal: 5,
            idle_timeout: None,
            providers: ProvidersConfig::default(),
            admin_role: "admin".to_string(),
        }
    }
}

/// Identity provider configurations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Directory (LDAP) provider
    pub directory: Option<DirectoryProviderConfig>,
    /// OIDC providers (one per issuer)
    pub oidc: Vec<OidcProviderConfig>,
    /// SAML provider
    pub saml: Option<SamlProviderConfig>,
}

/// Directory (LDAP) provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryProviderConfig {
    /// LDAP URL, e.g. `ldaps://directory.example.com:636`
    pub url: String,
    /// DN used for the initial search bind
    pub bind_dn: String,
    /// Password for the search bind
    pub bind_password: String,
    /// Search base for user entries
    pub user_base_dn: String,
    /// Attribute holding the login name (matched with an equality filter,
    /// never string-interpolated into a DN)
    pub user_attribute: String,
    /// Attribute holding group memberships, extracted into `teams`
    pub group_attribute: String,
    /// Connection timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Number of pooled connections
    pub pool_size: usize,
}

impl Default for DirectoryProviderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            bind_dn: String::new(),
            bind_password: String::new(),
            user_base_dn: String::new(),
            user_attribute: "uid".to_string(),
            group_attribute: "memberOf".to_string(),
            timeout: Duration::from_secs(5),
            pool_size: 4,
        }
    }
}

/// OIDC provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcProviderConfig {
    /// Issuer URL (must match the `iss` claim exactly)
    pub issuer: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Token endpoint for the authorization-code exchange.
    /// Defaults to `<issuer>/token` when empty.
    pub token_endpoint: String,
    /// JWKS URI. Defaults to `<issuer>/.well-known/jwks.json` when empty.
    pub jwks_uri: String,
    /// Accepted audiences (empty = client_id only)
    pub audiences: Vec<String>,
    /// Redirect URI sent during the code exchange
    pub redirect_uri: String,
    /// Claim holding group memberships
    pub groups_claim: String,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for OidcProviderConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            token_endpoint: String::new(),
            jwks_uri: String::new(),
            audiences: Vec::new(),
            redirect_uri: String::new(),
            groups_claim: "groups".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// SAML provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamlProviderConfig {
    /// PEM-encoded trusted IdP signing certificate
    pub idp_certificate_pem: String,
    /// Expected audience restriction (our SP entity id)
    pub audience: String,
    /// Clock skew tolerance for NotBefore / NotOnOrAfter
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// How long an outstanding AuthnRequest id stays valid for InReplyTo binding
    #[serde(with = "humantime_serde")]
    pub request_ttl: Duration,
}

impl Default for SamlProviderConfig {
    fn default() -> Self {
        Self {
            idp_certificate_pem: String::new(),
            audience: String::new(),
            clock_skew: Duration::from_secs(60),
            request_ttl: Duration::from_secs(300),
        }
    }
}

/// API key subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    /// System prefix on every key (`<prefix>_<env>_<body>`)
    pub prefix: String,
    /// Grace period during which a rotated-out key stays valid
    #[serde(with = "humantime_serde")]
    pub rotation_grace: Duration,
    /// Default per-key rate limit (requests per minute) when the mint
    /// request does not specify one
    pub default_rate_limit_per_min: u32,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            prefix: "sark".to_string(),
            rotation_grace: Duration::from_secs(24 * 60 * 60),
            default_rate_limit_per_min: 1000,
        }
    }
}

/// Policy decision engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Rule engine base URL
    pub engine_url: String,
    /// Rule package evaluated at `POST /v1/data/<package>`
    pub package: String,
    /// Strict timeout on each engine call
    #[serde(with = "humantime_serde")]
    pub engine_timeout: Duration,
    /// Decision cache configuration
    pub cache: PolicyCacheConfig,
    /// Resource prefixes treated as high-sensitivity (short cache TTL)
    pub high_sensitivity_prefixes: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            engine_url: String::new(),
            package: "sark/authz".to_string(),
            engine_timeout: Duration::from_millis(2000),
            cache: PolicyCacheConfig::default(),
            high_sensitivity_prefixes: Vec::new(),
        }
    }
}

/// Decision cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyCacheConfig {
    /// TTL for allow decisions on high-sensitivity resources
    #[serde(with = "humantime_serde")]
    pub ttl_high: Duration,
    /// TTL for allow decisions on low-sensitivity resources
    #[serde(with = "humantime_serde")]
    pub ttl_low: Duration,
    /// TTL for deny decisions (kept short so remediations take effect)
    #[serde(with = "humantime_serde")]
    pub ttl_deny: Duration,
    /// Maximum number of cached decisions before LRU eviction
    pub max_entries: usize,
}

impl Default for PolicyCacheConfig {
    fn default() -> Self {
        Self {
            ttl_high: Duration::from_secs(60),
            ttl_low: Duration::from_secs(600),
            ttl_deny: Duration::from_secs(30),
            max_entries: 100_000,
        }
    }
}

/// Ingress rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-user limit (requests per minute)
    pub user_per_min: u32,
    /// Per-API-key default limit (requests per minute); individual keys may
    /// carry their own limit which takes precedence
    pub api_key_per_min: u32,
    /// Per-IP limit for unauthenticated traffic (requests per minute)
    pub public_per_min: u32,
    /// Principals whose roles include the admin role bypass rate limiting
    pub exempt_admins: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            user_per_min: 5000,
            api_key_per_min: 1000,
            public_per_min: 100,
            exempt_admins: false,
        }
    }
}

/// SIEM forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiemConfig {
    /// Events per batch
    pub batch_size: usize,
    /// Maximum time a partial batch waits before dispatch
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,
    /// Serialized batches larger than this are gzip-compressed
    pub compression_threshold_bytes: usize,
    /// Bounded ingress queue capacity (events)
    pub queue_capacity: usize,
    /// Per-destination request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Destinations, each dispatched independently
    pub destinations: Vec<SiemDestinationConfig>,
}

impl Default for SiemConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval: Duration::from_millis(5000),
            compression_threshold_bytes: 1024,
            queue_capacity: 1000,
            request_timeout: Duration::from_secs(10),
            destinations: Vec::new(),
        }
    }
}

/// A single SIEM destination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SiemDestinationConfig {
    /// Splunk HTTP Event Collector
    Splunk {
        /// Destination id (used in logs, breaker names, fallback entries)
        id: String,
        /// HEC base URL (without `/services/collector`)
        url: String,
        /// HEC token
        token: String,
        /// Target index
        #[serde(default)]
        index: String,
        /// Event source field
        #[serde(default = "default_splunk_source")]
        source: String,
        /// Event sourcetype field
        #[serde(default = "default_splunk_sourcetype")]
        sourcetype: String,
    },
    /// Datadog Logs intake
    Datadog {
        /// Destination id
        id: String,
        /// Datadog site, e.g. `datadoghq.com`
        site: String,
        /// API key
        api_key: String,
        /// Service tag
        #[serde(default = "default_datadog_service")]
        service: String,
        /// Extra tags, joined comma-separated into `ddtags`
        #[serde(default)]
        tags: Vec<String>,
    },
    /// Local rolling NDJSON file
    File {
        /// Destination id
        id: String,
        /// Target file path
        path: PathBuf,
    },
}

fn default_splunk_source() -> String {
    "sark".to_string()
}

fn default_splunk_sourcetype() -> String {
    "sark:audit".to_string()
}

fn default_datadog_service() -> String {
    "sark-gateway".to_string()
}

impl SiemDestinationConfig {
    /// Destination identifier
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Splunk { id, .. } | Self::Datadog { id, .. } | Self::File { id, .. } => id,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Splunk { id, url, token, .. } => {
                if url.is_empty() || token.is_empty() {
                    return Err(Error::Config(format!(
                        "splunk destination '{id}' requires url and token"
                    )));
                }
            }
            Self::Datadog { id, site, api_key, .. } => {
                if site.is_empty() || api_key.is_empty() {
                    return Err(Error::Config(format!(
                        "datadog destination '{id}' requires site and api_key"
                    )));
                }
            }
            Self::File { id, path } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::Config(format!(
                        "file destination '{id}' requires a path"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Failsafe configuration for SIEM dispatch
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FailsafeConfig {
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    pub retry: RetryConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Time in open before allowing a half-open probe
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts (first try included)
    pub max_attempts: u32,
    /// Base backoff; attempt `n` waits `base * 2^n` plus jitter in `[0, base]`
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    /// Backoff cap
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Fallback queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Base directory. When unset, a process-owned subdirectory of the system
    /// temp area is used (`<tmp>/sark-<pid>/siem_fallback`), never the shared
    /// temp root itself.
    pub dir: Option<PathBuf>,
    /// Rotate the active file once it reaches this size
    pub rotate_bytes: u64,
    /// Interval between replay sweeps
    #[serde(with = "humantime_serde")]
    pub replay_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            dir: None,
            rotate_bytes: 100 * 1024 * 1024,
            replay_interval: Duration::from_secs(60),
        }
    }
}

/// Resources whose name starts with any configured high-sensitivity prefix
/// get the short cache TTL.
#[must_use]
pub fn is_high_sensitivity(policy: &PolicyConfig, resource: &str) -> bool {
    policy
        .high_sensitivity_prefixes
        .iter()
        .any(|p| resource.starts_with(p.as_str()))
}
