//! Username/password to uid/gid resolution.

mod ldap;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use nfsvol_common::DriverResult;
use tokio_util::sync::CancellationToken;

pub use ldap::{
    DialError, DirectoryConnection, DirectoryDialer, DirectoryEntry, Ldap3Dialer, LdapIdResolver,
    LDAP_UNREACHABLE,
};

/// Default bound on a whole resolution round trip.
pub const DEFAULT_LDAP_TIMEOUT: Duration = Duration::from_secs(120);

/// A resolved numeric identity, as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id.
    pub uid: String,
    /// Group id; falls back to `uid` when the directory has none.
    pub gid: String,
}

/// Resolves credentials to a numeric identity.
#[async_trait]
pub trait IdResolver: Send + Sync {
    /// Verify `password` for `username` and return its uid/gid.
    ///
    /// # Errors
    ///
    /// Returns a safe error for unreachable servers, unknown or ambiguous
    /// users and rejected passwords. Service account and search failures are
    /// opaque.
    async fn resolve(
        &self,
        ctx: &CancellationToken,
        username: &str,
        password: &str,
    ) -> DriverResult<Identity>;
}

/// Directory service connection settings.
#[derive(Clone)]
pub struct LdapConfig {
    /// Directory host name; also the TLS server name.
    pub host: String,
    /// Directory port.
    pub port: u16,
    /// Service account used for the search bind.
    pub svc_user: String,
    /// Service account password.
    pub svc_password: String,
    /// Base DN searched for users, e.g. `cn=Users,dc=corp,dc=example,dc=com`.
    pub user_fqdn: String,
    /// PEM encoded CA certificate; enables TLS when set.
    pub ca_cert: Option<String>,
    /// Bound on the whole resolution, connection included.
    pub timeout: Duration,
}

impl LdapConfig {
    /// Create a configuration with the default timeout and no TLS.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        svc_user: impl Into<String>,
        svc_password: impl Into<String>,
        user_fqdn: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            svc_user: svc_user.into(),
            svc_password: svc_password.into(),
            user_fqdn: user_fqdn.into(),
            ca_cert: None,
            timeout: DEFAULT_LDAP_TIMEOUT,
        }
    }

    /// Connect over TLS, trusting `pem`.
    #[must_use]
    pub fn with_ca_cert(mut self, pem: impl Into<String>) -> Self {
        self.ca_cert = Some(pem.into());
        self
    }

    /// Set the resolution timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The URL to dial.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.ca_cert.is_some() { "ldaps" } else { "ldap" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("svc_user", &self.svc_user)
            .field("svc_password", &"<redacted>")
            .field("user_fqdn", &self.user_fqdn)
            .field("ca_cert", &self.ca_cert.as_ref().map(|_| "<pem>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}
