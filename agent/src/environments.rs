// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operator's `environments.yaml`: named environment configurations
//! the CLI can open.
//!
//! ```yaml
//! default: local
//! environments:
//!   local:
//!     type: dummy
//!     authorized-keys: ssh-rsa AAAA...
//! ```
//!
//! The environment's `name` attribute is implied by its key in the file.

use camino::{Utf8Path, Utf8PathBuf};
use drover_provider::{registry, EnvironConfig, SharedEnviron};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvironmentsError {
    #[error("cannot read environments file {path:?}: {message}")]
    Unreadable { path: String, message: String },

    #[error("environment {0:?} not found")]
    NotFound(String),

    #[error("no default environment and none specified")]
    NoDefault,

    #[error(transparent)]
    Provider(#[from] drover_provider::Error),
}

#[derive(Debug, Deserialize)]
struct EnvironmentsDoc {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    environments: BTreeMap<String, drover_provider::Attrs>,
}

/// The parsed environments file.
pub struct Environments {
    doc: EnvironmentsDoc,
}

impl Environments {
    pub fn read(path: &Utf8Path) -> Result<Environments, EnvironmentsError> {
        let unreadable = |message: String| EnvironmentsError::Unreadable {
            path: path.to_string(),
            message,
        };
        let contents =
            std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        let doc: EnvironmentsDoc = serde_yaml::from_str(&contents)
            .map_err(|e| unreadable(e.to_string()))?;
        Ok(Environments { doc })
    }

    /// The default path: `$DROVER_HOME/environments.yaml`, falling back to
    /// `~/.drover/environments.yaml`.
    pub fn default_path() -> Utf8PathBuf {
        if let Ok(home) = std::env::var("DROVER_HOME") {
            return Utf8PathBuf::from(home).join("environments.yaml");
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Utf8PathBuf::from(home).join(".drover").join("environments.yaml")
    }

    /// The validated configuration for `name`, or for the file's default
    /// environment when `name` is `None`.
    pub fn config(
        &self,
        name: Option<&str>,
    ) -> Result<EnvironConfig, EnvironmentsError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => match &self.doc.default {
                Some(default) => default.clone(),
                None if self.doc.environments.len() == 1 => self
                    .doc
                    .environments
                    .keys()
                    .next()
                    .expect("len() == 1")
                    .clone(),
                None => return Err(EnvironmentsError::NoDefault),
            },
        };
        let attrs = self
            .doc
            .environments
            .get(&name)
            .ok_or_else(|| EnvironmentsError::NotFound(name.clone()))?;
        let mut attrs = attrs.clone();
        // The name attribute is implied by the key in the file.
        attrs.entry("name".to_string()).or_insert_with(|| name.clone().into());
        Ok(EnvironConfig::new(attrs).map_err(drover_provider::Error::from)?)
    }

    /// Open the named (or default) environment via the provider registry.
    pub fn open(
        &self,
        name: Option<&str>,
    ) -> Result<SharedEnviron, EnvironmentsError> {
        let config = self.config(name)?;
        Ok(registry::open(&config)?)
    }
}
