//! Pure helpers turning canonical mount options into command arguments.

use nfsvol_common::mask::{MountOpts, RawOptions, parse_bool};
use nfsvol_common::{DriverError, DriverResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::os::FileStat;

/// Owner id the server reports for squashed users.
pub const NOBODY_ID: u32 = 65534;

/// Owner id reported when the client cannot map the server's id.
pub const UNKNOWN_ID: u32 = 4_294_967_294;

/// Safe message for an unusable `uid`.
pub const INVALID_UID: &str = "Invalid 'uid' option (0, negative, or non-integer)";

/// Safe message for an unusable `gid`.
pub const INVALID_GID: &str = "Invalid 'gid' option (0, negative, or non-integer)";

const NO_ATTRIBUTE_CACHE: &str = ",actimeo=0";

static LEGACY_SHARE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new("^nfs://([^/]+)(/.*)?$").ok());

/// Rewrite `nfs://host/path` to `host:/path`; other shares pass through.
///
/// # Errors
///
/// Returns a safe error when the legacy form has a blank host.
pub fn normalize_share(share: &str) -> DriverResult<String> {
    let Some(caps) = LEGACY_SHARE.as_ref().and_then(|re| re.captures(share)) else {
        return Ok(share.to_string());
    };

    let host = caps.get(1).map_or("", |m| m.as_str());
    if host.trim().is_empty() {
        return Err(DriverError::safe("Invalid 'share' option"));
    }

    let path = caps.get(2).map_or("", |m| m.as_str());
    if path.is_empty() {
        Ok(format!("{host}:/"))
    } else {
        Ok(format!("{host}:{path}"))
    }
}

/// Kernel mount options for `opts`, starting from `base`.
///
/// # Errors
///
/// Returns a safe error for a non-boolean `cache` or an unusable `version`.
pub fn kernel_options(base: &str, opts: &MountOpts) -> DriverResult<String> {
    let mut cache = opts
        .get("readonly")
        .and_then(|v| parse_bool(v))
        .unwrap_or(false);

    if let Some(value) = opts.get("cache") {
        cache = parse_bool(value).ok_or_else(|| {
            tracing::error!(cache = %value, "Invalid cache option");
            DriverError::safe("Invalid 'cache' option")
        })?;
    }

    let mut options = if cache {
        base.replace(NO_ATTRIBUTE_CACHE, "")
    } else {
        base.to_string()
    };

    if let Some(version) = opts.get("version") {
        options.push_str(",vers=");
        options.push_str(&nfs_version(version)?);
    }

    Ok(options)
}

/// Normalize an NFS protocol version.
///
/// # Errors
///
/// Returns a safe error unless `version` is a positive number outside the
/// open interval (3, 4).
pub fn nfs_version(version: &str) -> DriverResult<String> {
    let version = version.trim();
    let parsed: f64 = version
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite() && *v > 0.0)
        .ok_or_else(|| DriverError::safe("\"version\" must be a positive numeric value"))?;

    if (parsed - 3.0).abs() < f64::EPSILON {
        if version != "3" {
            tracing::info!(
                version,
                "NFSv3 does not have a minor version available, correcting to 3"
            );
        }
        return Ok("3".to_string());
    }

    if parsed > 3.0 && parsed < 4.0 {
        return Err(DriverError::safe(format!(
            "NFSv3 does not use minor versions. NFSv {parsed} does not exist"
        )));
    }

    Ok(version.to_string())
}

/// Parse a remapped id; zero, negative and non-numeric values are rejected.
///
/// # Errors
///
/// Returns `message` as a safe error.
pub fn positive_id(value: &str, message: &str) -> DriverResult<u32> {
    value
        .parse::<u32>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| DriverError::safe(message))
}

/// Whether `uid`/`gid` would be unable to read a directory with `stat`.
///
/// Squashed or unmapped owners count as a match, since the server may
/// anonymize ownership.
#[must_use]
pub const fn lacks_read_access(stat: &FileStat, uid: u32, gid: u32) -> bool {
    let world = stat.mode & 0o004 != 0;
    let group = stat.mode & 0o040 != 0 && (gid == stat.gid || is_anonymous(stat.gid));
    let owner = stat.mode & 0o400 != 0 && (uid == stat.uid || is_anonymous(stat.uid));
    !(world || group || owner)
}

const fn is_anonymous(id: u32) -> bool {
    id == NOBODY_ID || id == UNKNOWN_ID
}

/// Helper flags for the remapping process.
#[must_use]
pub fn helper_args(uid: u32, gid: u32, opts: &MountOpts) -> Vec<String> {
    let mut args = vec![
        "-uid".to_string(),
        uid.to_string(),
        "-gid".to_string(),
        gid.to_string(),
    ];
    if opts
        .get("auto_cache")
        .and_then(|v| parse_bool(v))
        .unwrap_or(false)
    {
        args.push("-auto_cache".to_string());
    }
    args
}

/// Copy of `opts` safe to log.
#[must_use]
pub fn redacted(opts: &RawOptions) -> RawOptions {
    opts.iter()
        .map(|(k, v)| {
            if k == "password" {
                (k.clone(), Value::String("<redacted>".to_string()))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}
