//! Directory service settings read from the environment.

use std::time::Duration;

use nfsvol::resolver::{DEFAULT_LDAP_TIMEOUT, LdapConfig};
use nfsvol_common::{DriverError, DriverResult};

/// Read the LDAP settings from the process environment.
///
/// Returns `None` when `LDAP_HOST` is unset.
pub fn ldap_from_env() -> DriverResult<Option<LdapConfig>> {
    ldap_from_lookup(|key| std::env::var(key).ok())
}

/// Build LDAP settings from an arbitrary key lookup.
///
/// Unparsable numbers count as unset. A zero timeout means the default.
pub fn ldap_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DriverResult<Option<LdapConfig>> {
    let var = |key: &str| lookup(key).unwrap_or_default();

    let host = var("LDAP_HOST");
    let svc_user = var("LDAP_SVC_USER");
    let svc_password = var("LDAP_SVC_PASS");
    let user_fqdn = var("LDAP_USER_FQDN");
    let ca_cert = var("LDAP_CA_CERT");
    let port: u16 = var("LDAP_PORT").trim().parse().unwrap_or(0);
    let timeout: i64 = var("LDAP_TIMEOUT").trim().parse().unwrap_or(0);

    if !host.is_empty()
        && (svc_user.is_empty() || svc_password.is_empty() || user_fqdn.is_empty() || port == 0)
    {
        return Err(DriverError::Config {
            message: "LDAP is enabled but required LDAP parameters are not set".to_string(),
        });
    }

    if timeout < 0 {
        return Err(DriverError::Config {
            message: "LDAP_TIMEOUT is set to a negative value".to_string(),
        });
    }

    if host.is_empty() {
        return Ok(None);
    }

    let timeout = u64::try_from(timeout)
        .ok()
        .filter(|secs| *secs > 0)
        .map_or(DEFAULT_LDAP_TIMEOUT, Duration::from_secs);

    let mut config =
        LdapConfig::new(host, port, svc_user, svc_password, user_fqdn).with_timeout(timeout);
    if !ca_cert.is_empty() {
        config = config.with_ca_cert(ca_cert);
    }

    tracing::info!(url = %config.url(), timeout_secs = timeout.as_secs(), "LDAP identity resolution enabled");
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const COMPLETE: [(&str, &str); 5] = [
        ("LDAP_HOST", "ldap.example.com"),
        ("LDAP_PORT", "389"),
        ("LDAP_SVC_USER", "svc"),
        ("LDAP_SVC_PASS", "secret"),
        ("LDAP_USER_FQDN", "cn=Users,dc=example,dc=com"),
    ];

    #[test]
    fn test_disabled_without_host() {
        assert!(ldap_from_lookup(lookup(&[])).unwrap().is_none());
    }

    #[test]
    fn test_complete_settings() {
        let config = ldap_from_lookup(lookup(&COMPLETE)).unwrap().unwrap();
        assert_eq!(config.url(), "ldap://ldap.example.com:389");
        assert_eq!(config.timeout, DEFAULT_LDAP_TIMEOUT);
        assert!(config.ca_cert.is_none());
    }

    #[test]
    fn test_ca_and_timeout() {
        let mut pairs = COMPLETE.to_vec();
        pairs.push(("LDAP_CA_CERT", "-----BEGIN CERTIFICATE-----"));
        pairs.push(("LDAP_TIMEOUT", "30"));

        let config = ldap_from_lookup(lookup(&pairs)).unwrap().unwrap();
        assert_eq!(config.url(), "ldaps://ldap.example.com:389");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_required_field() {
        let pairs: Vec<_> = COMPLETE
            .iter()
            .copied()
            .filter(|(k, _)| *k != "LDAP_SVC_PASS")
            .collect();
        let err = ldap_from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("required LDAP parameters"));
    }

    #[test]
    fn test_unparsable_port_is_missing() {
        let mut pairs = COMPLETE.to_vec();
        pairs.retain(|(k, _)| *k != "LDAP_PORT");
        pairs.push(("LDAP_PORT", "ldap"));
        assert!(ldap_from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let mut pairs = COMPLETE.to_vec();
        pairs.push(("LDAP_TIMEOUT", "-1"));
        let err = ldap_from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("negative"));
    }
}
