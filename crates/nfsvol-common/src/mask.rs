//! Declarative mount option masking.
//!
//! A [`MountOptionMask`] turns a raw, untrusted option set (as received from
//! the container runtime) into a canonical option set: defaults are applied
//! first, user keys are mapped through aliases, ignored keys are dropped,
//! allowed keys are stringified uniformly, and every pair is run through the
//! configured validators. All failures are collected and reported together.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::error::{DriverError, DriverResult};

/// Raw options as supplied by a caller.
pub type RawOptions = serde_json::Map<String, Value>;

/// Canonical options: every value rendered as a string.
pub type MountOpts = BTreeMap<String, String>;

/// Default key that switches a mask into sloppy mode.
pub const SLOPPY_MOUNT_KEY: &str = "sloppy_mount";

/// A predicate over a single canonical `(key, value)` pair.
pub trait OptionValidator: Send + Sync {
    /// Return a description of the problem if the pair is rejected.
    ///
    /// # Errors
    ///
    /// Returns the human readable reason the pair was rejected.
    fn validate(&self, key: &str, value: &str) -> Result<(), String>;
}

impl<F> OptionValidator for F
where
    F: Fn(&str, &str) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, key: &str, value: &str) -> Result<(), String> {
        self(key, value)
    }
}

/// Aggregated failure from [`MountOptionMask::apply`].
#[derive(Error, Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskError {
    /// Messages returned by validators.
    pub validation: Vec<String>,
    /// User keys that are neither allowed nor ignored.
    pub not_allowed: Vec<String>,
    /// Mandatory keys missing after merging.
    pub missing: Vec<String>,
}

impl MaskError {
    fn is_empty(&self) -> bool {
        self.validation.is_empty() && self.not_allowed.is_empty() && self.missing.is_empty()
    }
}

impl fmt::Display for MaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = [
            ("validation mount options failed", &self.validation),
            ("Not allowed options", &self.not_allowed),
            ("Missing mandatory options", &self.missing),
        ];

        let rendered = lines
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(desc, list)| format!("- {desc}: {}", list.join(", ")))
            .collect::<Vec<_>>()
            .join("\n");
        f.write_str(&rendered)
    }
}

/// Immutable policy governing which options a caller may set.
#[derive(Clone, Default)]
pub struct MountOptionMask {
    allowed: BTreeSet<String>,
    defaults: MountOpts,
    key_aliases: BTreeMap<String, String>,
    ignored: BTreeSet<String>,
    mandatory: Vec<String>,
    bool_as_int: BTreeSet<String>,
    sloppy: bool,
    validators: Vec<Arc<dyn OptionValidator>>,
}

impl fmt::Debug for MountOptionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptionMask")
            .field("allowed", &self.allowed)
            .field("defaults", &self.defaults)
            .field("key_aliases", &self.key_aliases)
            .field("ignored", &self.ignored)
            .field("mandatory", &self.mandatory)
            .field("bool_as_int", &self.bool_as_int)
            .field("sloppy", &self.sloppy)
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl MountOptionMask {
    /// Build a mask.
    ///
    /// A `sloppy_mount` entry in `defaults` turns on sloppy mode, in which
    /// unknown keys are dropped instead of rejected.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `sloppy_mount` is not a boolean.
    pub fn new<S: Into<String>>(
        allowed: impl IntoIterator<Item = S>,
        defaults: &RawOptions,
        key_aliases: impl IntoIterator<Item = (S, S)>,
        ignored: impl IntoIterator<Item = S>,
        mandatory: impl IntoIterator<Item = S>,
    ) -> DriverResult<Self> {
        let mut mask = Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            key_aliases: key_aliases
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ignored: ignored.into_iter().map(Into::into).collect(),
            mandatory: mandatory.into_iter().map(Into::into).collect(),
            ..Self::default()
        };

        mask.defaults = defaults
            .iter()
            .map(|(k, v)| (k.clone(), mask.uniform_value(k, v)))
            .collect();

        if let Some(value) = mask.defaults.get(SLOPPY_MOUNT_KEY) {
            mask.sloppy = parse_bool(value).ok_or_else(|| DriverError::Config {
                message: format!("Invalid sloppy_mount option: {value:?} is not a boolean"),
            })?;
        }

        Ok(mask)
    }

    /// Render booleans for these keys as `1`/`0` instead of `true`/`false`.
    #[must_use]
    pub fn with_bool_as_int<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.bool_as_int.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Append a validator run against every merged pair.
    #[must_use]
    pub fn with_validator(mut self, validator: impl OptionValidator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Whether unknown keys are silently dropped.
    #[must_use]
    pub const fn is_sloppy(&self) -> bool {
        self.sloppy
    }

    /// The canonical key for a user-supplied key.
    #[must_use]
    pub fn canonical_key<'a>(&'a self, key: &'a str) -> &'a str {
        self.key_aliases.get(key).map_or(key, String::as_str)
    }

    /// Convert raw options into a canonical, validated option set.
    ///
    /// # Errors
    ///
    /// Returns a [`MaskError`] listing every validation failure, disallowed
    /// key and missing mandatory key.
    pub fn apply(&self, user: &RawOptions) -> Result<MountOpts, MaskError> {
        let mut merged = self.defaults.clone();
        let mut errors = MaskError::default();

        for (key, value) in user {
            let canonical = self.canonical_key(key);

            if self.ignored.contains(canonical) {
                continue;
            }

            if self.allowed.contains(canonical) {
                merged.insert(canonical.to_string(), self.uniform_value(canonical, value));
            } else if !self.sloppy {
                errors.not_allowed.push(key.clone());
            }
        }

        for (key, value) in &merged {
            for validator in &self.validators {
                if let Err(reason) = validator.validate(key, value) {
                    errors.validation.push(reason);
                }
            }
        }

        errors.missing = self
            .mandatory
            .iter()
            .filter(|key| !merged.contains_key(key.as_str()))
            .cloned()
            .collect();

        if errors.is_empty() {
            Ok(merged)
        } else {
            errors.not_allowed.sort();
            tracing::debug!(%errors, "Mount options rejected");
            Err(errors)
        }
    }

    fn uniform_value(&self, key: &str, value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Number(n) if n.is_f64() => {
                n.as_f64().map(canonical_float).unwrap_or_default()
            }
            Value::Number(n) => n.to_string(),
            Value::Bool(b) if self.bool_as_int.contains(key) => {
                (if *b { "1" } else { "0" }).to_string()
            }
            Value::Bool(b) => b.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
        }
    }
}

/// Shortest decimal that round-trips, without a trailing `.0` or exponent.
fn canonical_float(value: f64) -> String {
    format!("{value}")
}

/// Parse a boolean the way mount option values spell them.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Convert canonical options back into raw form.
#[must_use]
pub fn to_raw(opts: &MountOpts) -> RawOptions {
    opts.iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}
