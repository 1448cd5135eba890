//! Directory (LDAP) identity provider
//!
//! Search-then-bind: the login name is matched with an escaped equality
//! filter under a service bind, and the password is verified by binding as
//! the entry's DN. The login name is never interpolated into a DN, which is
//! what makes DN injection a non-issue here.
//!
//! A small pool of service-bound connections serves searches; password binds
//! always use a fresh connection that is discarded afterwards so a pooled
//! handle can never linger with user credentials.

use std::collections::{BTreeSet, HashMap};

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry, ldap_escape};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::auth::credentials::Credential;
use crate::auth::principal::{Principal, PrincipalKind};
use crate::auth::providers::{IdentityProvider, ProviderError};
use crate::config::DirectoryProviderConfig;

/// LDAP resultCode 49: invalidCredentials
const RC_INVALID_CREDENTIALS: u32 = 49;

/// Directory provider with pooled service connections.
pub struct DirectoryProvider {
    config: DirectoryProviderConfig,
    pool: Mutex<Vec<Ldap>>,
}

impl DirectoryProvider {
    /// Create from configuration. Connections are established lazily.
    #[must_use]
    pub fn new(config: DirectoryProviderConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(Vec::new()),
        }
    }

    async fn connect(&self) -> Result<Ldap, ProviderError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.config.timeout);
        let (conn, ldap) = timeout(
            self.config.timeout,
            LdapConnAsync::with_settings(settings, &self.config.url),
        )
        .await
        .map_err(|_| ProviderError::UpstreamUnreachable("directory connect timeout".to_string()))?
        .map_err(|e| ProviderError::UpstreamUnreachable(e.to_string()))?;
        ldap3::drive!(conn);
        Ok(ldap)
    }

    /// Take a service-bound connection from the pool, or establish one.
    async fn acquire(&self) -> Result<Ldap, ProviderError> {
        if let Some(ldap) = self.pool.lock().await.pop() {
            return Ok(ldap);
        }

        let mut ldap = self.connect().await?;
        let bind = timeout(
            self.config.timeout,
            ldap.simple_bind(&self.config.bind_dn, &self.config.bind_password),
        )
        .await
        .map_err(|_| ProviderError::UpstreamUnreachable("directory bind timeout".to_string()))?
        .map_err(|e| ProviderError::UpstreamUnreachable(e.to_string()))?;
        bind.success()
            .map_err(|e| ProviderError::ConfigurationError(format!("service bind rejected: {e}")))?;
        Ok(ldap)
    }

    async fn release(&self, ldap: Ldap) {
        let mut pool = self.pool.lock().await;
        if pool.len() < self.config.pool_size {
            pool.push(ldap);
        }
    }

    /// Find the user entry for `username`.
    async fn find_user(&self, username: &str) -> Result<SearchEntry, ProviderError> {
        let filter = equality_filter(&self.config.user_attribute, username);
        let mut ldap = self.acquire().await?;

        let search = timeout(
            self.config.timeout,
            ldap.search(
                &self.config.user_base_dn,
                Scope::Subtree,
                &filter,
                vec!["cn", "displayName", "mail", self.config.group_attribute.as_str()],
            ),
        )
        .await
        .map_err(|_| ProviderError::UpstreamUnreachable("directory search timeout".to_string()))?
        .map_err(|e| ProviderError::UpstreamUnreachable(e.to_string()))?;

        let (entries, _res) = search
            .success()
            .map_err(|e| ProviderError::UpstreamUnreachable(e.to_string()))?;

        self.release(ldap).await;

        // A missing entry is the same failure as a wrong password.
        entries
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .ok_or(ProviderError::CredentialInvalid)
    }

    /// Verify the password by binding as the user's DN on a fresh connection.
    async fn bind_as_user(&self, user_dn: &str, password: &str) -> Result<(), ProviderError> {
        // Empty passwords would turn a simple bind into an anonymous bind,
        // which some servers accept. Reject outright.
        if password.is_empty() {
            return Err(ProviderError::CredentialInvalid);
        }

        let mut ldap = self.connect().await?;
        let bind = timeout(self.config.timeout, ldap.simple_bind(user_dn, password))
            .await
            .map_err(|_| {
                ProviderError::UpstreamUnreachable("directory bind timeout".to_string())
            })?
            .map_err(classify_ldap_error)?;

        let outcome = bind.success().map_err(classify_ldap_error).map(|_| ());
        if let Err(e) = ldap.unbind().await {
            debug!(error = %e, "Directory unbind failed after user bind");
        }
        outcome
    }
}

#[async_trait::async_trait]
impl IdentityProvider for DirectoryProvider {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn handles(&self, credential: &Credential) -> bool {
        matches!(credential, Credential::Directory { .. })
    }

    async fn verify(&self, credential: &Credential) -> Result<Principal, ProviderError> {
        let Credential::Directory { username, password } = credential else {
            return Err(ProviderError::CredentialInvalid);
        };

        let entry = self.find_user(username).await?;
        self.bind_as_user(&entry.dn, password).await?;

        let teams: BTreeSet<String> = entry
            .attrs
            .get(&self.config.group_attribute)
            .map(|values| values.iter().map(|v| group_name(v)).collect())
            .unwrap_or_default();

        let display_name = first_attr(&entry, "displayName")
            .or_else(|| first_attr(&entry, "cn"))
            .unwrap_or_else(|| username.clone());

        debug!(user = %username, teams = teams.len(), "Directory authentication succeeded");

        Ok(Principal {
            principal_id: format!("dir:{username}"),
            kind: PrincipalKind::User,
            display_name,
            email: first_attr(&entry, "mail"),
            roles: BTreeSet::new(),
            teams,
            attributes: HashMap::from([("dn".to_string(), entry.dn.clone())]),
        })
    }
}

fn first_attr(entry: &SearchEntry, name: &str) -> Option<String> {
    entry.attrs.get(name).and_then(|v| v.first()).cloned()
}

/// Build an escaped equality filter for the login attribute.
fn equality_filter(attribute: &str, value: &str) -> String {
    format!("({attribute}={})", ldap_escape(value))
}

/// Extract a group name from a membership value.
///
/// `memberOf` values are usually DNs (`cn=platform,ou=groups,...`); plain
/// names pass through unchanged.
fn group_name(value: &str) -> String {
    value
        .split(',')
        .next()
        .and_then(|rdn| rdn.split_once('='))
        .map_or_else(|| value.to_string(), |(_, name)| name.to_string())
}

fn classify_ldap_error(e: LdapError) -> ProviderError {
    match &e {
        LdapError::LdapResult { result } if result.rc == RC_INVALID_CREDENTIALS => {
            ProviderError::CredentialInvalid
        }
        _ => {
            warn!(error = %e, "Directory operation failed");
            ProviderError::UpstreamUnreachable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_escapes_injection_attempts() {
        // GIVEN: a username that tries to smuggle filter syntax
        let filter = equality_filter("uid", "alice)(uid=*");

        // THEN: the metacharacters are escaped, the filter stays an equality
        assert_eq!(filter, "(uid=alice\\29\\28uid=\\2a)");
    }

    #[test]
    fn group_name_strips_dn_syntax() {
        assert_eq!(group_name("cn=platform,ou=groups,dc=example,dc=com"), "platform");
        assert_eq!(group_name("CN=Admins,OU=x"), "Admins");
        assert_eq!(group_name("plain-group"), "plain-group");
    }

    #[tokio::test]
    async fn empty_password_is_rejected_before_any_bind() {
        // Anonymous-bind prevention must not depend on a reachable server.
        let provider = DirectoryProvider::new(DirectoryProviderConfig::default());
        let result = provider.bind_as_user("cn=alice,dc=example", "").await;
        assert!(matches!(result, Err(ProviderError::CredentialInvalid)));
    }

    #[test]
    fn handles_only_directory_credentials() {
        let provider = DirectoryProvider::new(DirectoryProviderConfig::default());
        assert!(provider.handles(&Credential::Directory {
            username: "a".into(),
            password: "b".into()
        }));
        assert!(!provider.handles(&Credential::ApiKey { key: "k".into() }));
    }
}
