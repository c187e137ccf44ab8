//! LDAP backed [`IdResolver`].

use std::collections::HashMap;

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry, ldap_escape};
use nfsvol_common::{DriverError, DriverResult};
use tokio_util::sync::CancellationToken;

use super::{IdResolver, Identity, LdapConfig};

/// Safe message returned when the directory cannot be dialed.
pub const LDAP_UNREACHABLE: &str =
    "LDAP server could not be reached, please contact your system administrator";

const SEARCH_ATTRS: [&str; 3] = ["dn", "uidNumber", "gidNumber"];

/// A search result entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name.
    pub dn: String,
    /// Attribute values by name.
    pub attrs: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// First value of `name`, or empty.
    #[must_use]
    pub fn attr(&self, name: &str) -> &str {
        self.attrs
            .get(name)
            .and_then(|values| values.first())
            .map_or("", String::as_str)
    }
}

/// Failure to open a directory connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    /// The configured CA certificate could not be used.
    Certificate(String),
    /// The server could not be reached.
    Unreachable(String),
}

/// An open directory connection.
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Simple bind.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), String>;

    /// Subtree search under `base`.
    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, String>;

    /// Close the connection.
    async fn close(&mut self);
}

/// Opens directory connections.
#[async_trait]
pub trait DirectoryDialer: Send + Sync {
    /// Connect to the configured server.
    async fn dial(&self, config: &LdapConfig) -> Result<Box<dyn DirectoryConnection>, DialError>;
}

/// [`IdResolver`] doing a bind, search, bind sequence against LDAP.
pub struct LdapIdResolver {
    config: LdapConfig,
    dialer: Box<dyn DirectoryDialer>,
}

impl LdapIdResolver {
    /// Resolver using the `ldap3` client.
    #[must_use]
    pub fn new(config: LdapConfig) -> Self {
        Self::with_dialer(config, Ldap3Dialer)
    }

    /// Resolver using a custom dialer.
    #[must_use]
    pub fn with_dialer(config: LdapConfig, dialer: impl DirectoryDialer + 'static) -> Self {
        Self {
            config,
            dialer: Box::new(dialer),
        }
    }

    async fn resolve_inner(&self, username: &str, password: &str) -> DriverResult<Identity> {
        let mut conn = match self.dialer.dial(&self.config).await {
            Ok(conn) => conn,
            Err(DialError::Certificate(message)) => {
                tracing::error!(error = %message, "Failed to load LDAP CA certificate");
                return Err(DriverError::Directory {
                    message: "failed to load CA certificate".to_string(),
                });
            }
            Err(DialError::Unreachable(message)) => {
                tracing::error!(host = %self.config.host, error = %message, "LDAP dial failed");
                return Err(DriverError::safe(LDAP_UNREACHABLE));
            }
        };

        let result = self.lookup(conn.as_mut(), username, password).await;
        conn.close().await;
        result
    }

    async fn lookup(
        &self,
        conn: &mut dyn DirectoryConnection,
        username: &str,
        password: &str,
    ) -> DriverResult<Identity> {
        conn.bind(&self.config.svc_user, &self.config.svc_password)
            .await
            .map_err(|message| DriverError::Directory { message })?;

        let filter = user_filter(username);
        let entries = conn
            .search(&self.config.user_fqdn, &filter, &SEARCH_ATTRS)
            .await
            .map_err(|message| DriverError::Directory { message })?;

        let entry = match entries.as_slice() {
            [] => return Err(DriverError::safe("User does not exist")),
            [entry] => entry,
            _ => return Err(DriverError::safe("Ambiguous search--too many results")),
        };

        let uid = entry.attr("uidNumber").to_string();
        let gid = match entry.attr("gidNumber") {
            "" => uid.clone(),
            gid => gid.to_string(),
        };

        conn.bind(&entry.dn, password)
            .await
            .map_err(DriverError::safe)?;

        Ok(Identity { uid, gid })
    }
}

#[async_trait]
impl IdResolver for LdapIdResolver {
    async fn resolve(
        &self,
        ctx: &CancellationToken,
        username: &str,
        password: &str,
    ) -> DriverResult<Identity> {
        tracing::info!(username, host = %self.config.host, "Resolving LDAP identity");

        tokio::select! {
            () = ctx.cancelled() => Err(DriverError::Directory {
                message: "LDAP lookup cancelled".to_string(),
            }),
            outcome = tokio::time::timeout(
                self.config.timeout,
                self.resolve_inner(username, password),
            ) => outcome.unwrap_or_else(|_| {
                tracing::error!(timeout = ?self.config.timeout, "LDAP lookup timed out");
                Err(DriverError::Directory {
                    message: format!(
                        "LDAP lookup timed out after {}s",
                        self.config.timeout.as_secs()
                    ),
                })
            }),
        }
    }
}

/// The search filter for a user's common name.
#[must_use]
pub fn user_filter(username: &str) -> String {
    format!("(&(objectClass=User)(cn={}))", ldap_escape(username))
}

/// [`DirectoryDialer`] over `ldap3`, with TLS from `native-tls`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Dialer;

#[async_trait]
impl DirectoryDialer for Ldap3Dialer {
    async fn dial(&self, config: &LdapConfig) -> Result<Box<dyn DirectoryConnection>, DialError> {
        let mut settings = LdapConnSettings::new().set_conn_timeout(config.timeout);

        if let Some(pem) = &config.ca_cert {
            let cert = native_tls::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| DialError::Certificate(e.to_string()))?;
            let connector = native_tls::TlsConnector::builder()
                .add_root_certificate(cert)
                .build()
                .map_err(|e| DialError::Certificate(e.to_string()))?;
            settings = settings.set_connector(connector);
        }

        let (conn, ldap) = LdapConnAsync::with_settings(settings, &config.url())
            .await
            .map_err(|e| DialError::Unreachable(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::debug!(error = %e, "LDAP connection closed");
            }
        });

        Ok(Box::new(Ldap3Connection { ldap }))
    }
}

struct Ldap3Connection {
    ldap: ldap3::Ldap,
}

#[async_trait]
impl DirectoryConnection for Ldap3Connection {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), String> {
        self.ldap
            .simple_bind(dn, password)
            .await
            .and_then(ldap3::LdapResult::success)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, String> {
        let (entries, _) = self
            .ldap
            .search(base, Scope::Subtree, filter, attrs.to_vec())
            .await
            .and_then(ldap3::SearchResult::success)
            .map_err(|e| e.to_string())?;

        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(|entry| DirectoryEntry {
                dn: entry.dn,
                attrs: entry.attrs,
            })
            .collect())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            tracing::debug!(error = %e, "LDAP unbind failed");
        }
    }
}
