//! Per-principal rate limiting
//!
//! Token buckets keyed by `(scope, identity)` where scope is user, API key,
//! or source IP. Buckets are `governor` limiters created lazily per key;
//! API keys may carry their own per-key limit which overrides the scope
//! default. Every decision carries the header values the façade exposes
//! (`X-RateLimit-Limit`, `X-RateLimit-Remaining`, `X-RateLimit-Reset`).

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    middleware::StateInformationMiddleware,
    state::{InMemoryState, NotKeyed},
};

use crate::config::RateLimitConfig;
use crate::{Error, Result};

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock, StateInformationMiddleware>;

/// Which identity class a bucket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitScope {
    /// Authenticated human principal
    User,
    /// API key principal
    ApiKey,
    /// Unauthenticated caller, keyed by source IP
    Ip,
}

impl LimitScope {
    /// Lowercase label used in bucket keys and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::ApiKey => "api_key",
            Self::Ip => "ip",
        }
    }
}

/// Outcome of a granted rate-limit check, carrying header values.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// Bucket capacity per minute
    pub limit: u32,
    /// Tokens remaining after this request
    pub remaining: u32,
    /// Unix timestamp at which the window resets
    pub reset_at: u64,
}

struct BucketEntry {
    limiter: Arc<Bucket>,
    limit: u32,
}

/// Rate limiter over all scopes.
pub struct RateLimitGate {
    config: RateLimitConfig,
    buckets: DashMap<String, BucketEntry>,
    clock: DefaultClock,
}

impl RateLimitGate {
    /// Create from configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            clock: DefaultClock::default(),
        }
    }

    /// Consume one token from the bucket for `(scope, identity)`.
    ///
    /// `custom_limit` overrides the scope default (used for per-API-key
    /// limits); zero means unlimited. Admin principals are exempted when
    /// configured.
    ///
    /// # Errors
    ///
    /// [`Error::RateLimited`] when the bucket is empty, carrying the
    /// retry-after and reset values for the response headers.
    pub fn check(
        &self,
        scope: LimitScope,
        identity: &str,
        custom_limit: Option<u32>,
        is_admin: bool,
    ) -> Result<RateLimitDecision> {
        if is_admin && self.config.exempt_admins {
            return Ok(RateLimitDecision {
                limit: 0,
                remaining: 0,
                reset_at: unix_now() + 60,
            });
        }

        let limit = custom_limit.unwrap_or_else(|| self.default_limit(scope));
        if limit == 0 {
            // Zero per-key limit means the key is unthrottled.
            return Ok(RateLimitDecision {
                limit: 0,
                remaining: 0,
                reset_at: unix_now() + 60,
            });
        }

        let key = format!("{}:{identity}", scope.as_str());
        let limiter = self.bucket_for(&key, limit);

        match limiter.check() {
            Ok(snapshot) => Ok(RateLimitDecision {
                limit,
                remaining: snapshot.remaining_burst_capacity(),
                reset_at: unix_now() + 60,
            }),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                let retry_after_secs = wait.as_secs().max(1);
                Err(Error::RateLimited {
                    retry_after_secs,
                    limit,
                    reset_at: unix_now() + retry_after_secs,
                })
            }
        }
    }

    /// Configured default limit for a scope (requests per minute).
    #[must_use]
    pub fn default_limit(&self, scope: LimitScope) -> u32 {
        match scope {
            LimitScope::User => self.config.user_per_min,
            LimitScope::ApiKey => self.config.api_key_per_min,
            LimitScope::Ip => self.config.public_per_min,
        }
    }

    /// Number of live buckets (for health snapshots).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_for(&self, key: &str, limit: u32) -> Arc<Bucket> {
        if let Some(entry) = self.buckets.get(key) {
            // A rotated key may arrive with a different per-key limit; the
            // stale bucket is replaced below.
            if entry.limit == limit {
                return Arc::clone(&entry.limiter);
            }
        }

        let quota = Quota::per_minute(NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN));
        let limiter: Arc<Bucket> =
            Arc::new(RateLimiter::direct(quota).with_middleware::<StateInformationMiddleware>());
        self.buckets.insert(
            key.to_string(),
            BucketEntry {
                limiter: Arc::clone(&limiter),
                limit,
            },
        );
        limiter
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(user: u32, api_key: u32, ip: u32) -> RateLimitGate {
        RateLimitGate::new(RateLimitConfig {
            user_per_min: user,
            api_key_per_min: api_key,
            public_per_min: ip,
            exempt_admins: false,
        })
    }

    #[test]
    fn allows_up_to_limit_then_denies_with_retry_after() {
        // GIVEN: a per-key limit of 10
        let gate = gate(5000, 1000, 100);

        // WHEN: 10 requests pass
        for i in 0..10 {
            let d = gate
                .check(LimitScope::ApiKey, "key-1", Some(10), false)
                .unwrap_or_else(|_| panic!("request {i} should pass"));
            assert_eq!(d.limit, 10);
        }

        // THEN: the 11th is denied with a positive retry-after and the
        // header values the façade needs
        match gate.check(LimitScope::ApiKey, "key-1", Some(10), false) {
            Err(Error::RateLimited { retry_after_secs, limit, reset_at }) => {
                assert!(retry_after_secs > 0);
                assert_eq!(limit, 10);
                assert!(reset_at > unix_now());
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn remaining_decreases_per_request() {
        let gate = gate(5000, 1000, 100);
        let first = gate.check(LimitScope::User, "u1", Some(5), false).unwrap();
        let second = gate.check(LimitScope::User, "u1", Some(5), false).unwrap();
        assert!(second.remaining < first.remaining);
    }

    #[test]
    fn buckets_are_isolated_per_identity_and_scope() {
        let gate = gate(5000, 1000, 100);
        for _ in 0..3 {
            gate.check(LimitScope::ApiKey, "key-a", Some(3), false).unwrap();
        }
        assert!(gate.check(LimitScope::ApiKey, "key-a", Some(3), false).is_err());
        // Different identity, same scope: fresh bucket.
        assert!(gate.check(LimitScope::ApiKey, "key-b", Some(3), false).is_ok());
        // Same identity string, different scope: also fresh.
        assert!(gate.check(LimitScope::User, "key-a", Some(3), false).is_ok());
    }

    #[test]
    fn scope_defaults_apply_when_no_custom_limit() {
        let gate = gate(5000, 1000, 2);
        assert!(gate.check(LimitScope::Ip, "10.0.0.9", None, false).is_ok());
        assert!(gate.check(LimitScope::Ip, "10.0.0.9", None, false).is_ok());
        assert!(gate.check(LimitScope::Ip, "10.0.0.9", None, false).is_err());
    }

    #[test]
    fn admin_exemption_honours_config() {
        let mut cfg = RateLimitConfig {
            user_per_min: 1,
            api_key_per_min: 1,
            public_per_min: 1,
            exempt_admins: true,
        };
        let gate = RateLimitGate::new(cfg.clone());
        // Admin sails through a limit of 1.
        for _ in 0..5 {
            assert!(gate.check(LimitScope::User, "root", None, true).is_ok());
        }

        // Without the exemption flag, admin is limited like anyone else.
        cfg.exempt_admins = false;
        let gate = RateLimitGate::new(cfg);
        assert!(gate.check(LimitScope::User, "root", None, true).is_ok());
        assert!(gate.check(LimitScope::User, "root", None, true).is_err());
    }

    #[test]
    fn zero_custom_limit_means_unthrottled() {
        let gate = gate(1, 1, 1);
        for _ in 0..20 {
            assert!(gate.check(LimitScope::ApiKey, "vip", Some(0), false).is_ok());
        }
    }
}
