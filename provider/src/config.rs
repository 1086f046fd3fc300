// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validated environment configuration.
//!
//! An environment configuration is a free-form attribute map; this module
//! checks the attributes common to all providers and keeps the rest
//! untouched for the provider to interpret.  Configurations are immutable:
//! [`EnvironConfig::apply`] produces a new validated configuration rather
//! than mutating in place.

use serde_yaml::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Raw configuration attributes.
pub type Attrs = BTreeMap<String, Value>;

/// The series new machines run when the configuration does not name one.
pub const DEFAULT_SERIES: &str = "noble";

/// Attributes every environment must carry, whatever its provider.
const COMMON_ATTRS: &[&str] = &["type", "name", "default-series", "authorized-keys"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("empty {0} in environment configuration")]
    Empty(String),

    #[error("{attr}: expected string, got {found}")]
    NotAString { attr: String, found: String },
}

/// An immutable, validated environment configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironConfig {
    common: Attrs,
    unknown: Attrs,
}

fn kind_of(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("bool {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(_) => "string".to_string(),
        Value::Sequence(_) => "list".to_string(),
        Value::Mapping(_) => "mapping".to_string(),
        Value::Tagged(_) => "tagged value".to_string(),
    }
}

impl EnvironConfig {
    /// Validate `attrs` as an environment configuration.
    ///
    /// The common attributes must be non-empty strings; `default-series`
    /// falls back to [`DEFAULT_SERIES`] if absent.  Attributes this module
    /// does not know about are preserved verbatim and exposed through
    /// [`EnvironConfig::unknown_attrs`] — they could also simply be wrong,
    /// but only the specific provider can tell.
    pub fn new(attrs: Attrs) -> Result<EnvironConfig, ConfigError> {
        let mut common = Attrs::new();
        let mut unknown = Attrs::new();
        for (key, value) in attrs {
            if COMMON_ATTRS.contains(&key.as_str()) {
                common.insert(key, value);
            } else {
                unknown.insert(key, value);
            }
        }

        common
            .entry("default-series".to_string())
            .or_insert_with(|| Value::String(DEFAULT_SERIES.to_string()));

        for attr in COMMON_ATTRS {
            match common.get(*attr) {
                None => return Err(ConfigError::Empty(attr.to_string())),
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(ConfigError::Empty(attr.to_string()))
                }
                Some(Value::String(_)) => {}
                Some(other) => {
                    return Err(ConfigError::NotAString {
                        attr: attr.to_string(),
                        found: kind_of(other),
                    })
                }
            }
        }
        Ok(EnvironConfig { common, unknown })
    }

    fn common_str(&self, attr: &str) -> &str {
        match self.common.get(attr) {
            Some(Value::String(s)) => s,
            // `new` guaranteed every common attribute is a string.
            _ => unreachable!("common attribute {:?} missing after validation", attr),
        }
    }

    /// The provider type.
    pub fn type_name(&self) -> &str {
        self.common_str("type")
    }

    /// The environment name.
    pub fn name(&self) -> &str {
        self.common_str("name")
    }

    /// The default series for new machines.
    pub fn default_series(&self) -> &str {
        self.common_str("default-series")
    }

    /// The contents of ssh's authorized_keys file.
    pub fn authorized_keys(&self) -> &str {
        self.common_str("authorized-keys")
    }

    /// A copy of the raw attributes that are supposedly specific to the
    /// provider type.
    pub fn unknown_attrs(&self) -> Attrs {
        self.unknown.clone()
    }

    /// A copy of all attributes, common and provider-specific.
    pub fn all_attrs(&self) -> Attrs {
        let mut attrs = self.unknown.clone();
        attrs.extend(self.common.clone());
        attrs
    }

    /// Return a new configuration with the attributes of `self` plus
    /// `attrs`, re-validated.
    pub fn apply(&self, attrs: Attrs) -> Result<EnvironConfig, ConfigError> {
        let mut all = self.all_attrs();
        all.extend(attrs);
        EnvironConfig::new(all)
    }
}
