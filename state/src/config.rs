// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read/modify/write access to a key-value configuration node.
//!
//! A [`ConfigNode`] caches the node contents as read from the store and
//! accumulates local modifications.  `write()` computes the delta against
//! the cached contents and merges it onto whatever is in the store at write
//! time, so two writers editing disjoint keys both win; `read()` discards
//! local modifications and resyncs.

use crate::store::{Store, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Configuration attributes, as stored: a YAML mapping.
pub type Attrs = BTreeMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigNodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed configuration node {path:?}: {message}")]
    Malformed { path: String, message: String },
}

/// The kind of one reported change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One key's worth of difference flushed by [`ConfigNode::write`].
#[derive(Debug, Clone, PartialEq)]
pub struct ItemChange {
    pub kind: ItemChangeKind,
    pub key: String,
    pub old_value: Option<serde_yaml::Value>,
    pub new_value: Option<serde_yaml::Value>,
}

impl std::fmt::Display for ItemChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt = |v: &Option<serde_yaml::Value>| match v {
            Some(v) => serde_yaml::to_string(v)
                .unwrap_or_else(|_| "?".to_string())
                .trim_end()
                .to_string(),
            None => "<absent>".to_string(),
        };
        match self.kind {
            ItemChangeKind::Added => {
                write!(f, "setting added: {} = {}", self.key, fmt(&self.new_value))
            }
            ItemChangeKind::Modified => write!(
                f,
                "setting modified: {} = {} (was {})",
                self.key,
                fmt(&self.new_value),
                fmt(&self.old_value)
            ),
            ItemChangeKind::Deleted => write!(
                f,
                "setting deleted: {} (was {})",
                self.key,
                fmt(&self.old_value)
            ),
        }
    }
}

/// A node under `path` interpreted as a YAML mapping.
pub struct ConfigNode {
    store: Store,
    path: String,
    /// Contents as of the last read or write.
    disk: Attrs,
    /// Contents including local modifications.
    cache: Attrs,
}

fn parse(path: &str, contents: Option<&str>) -> Result<Attrs, ConfigNodeError> {
    match contents {
        None | Some("") => Ok(Attrs::new()),
        Some(contents) => serde_yaml::from_str(contents).map_err(|e| {
            ConfigNodeError::Malformed {
                path: path.to_string(),
                message: e.to_string(),
            }
        }),
    }
}

fn dump(path: &str, attrs: &Attrs) -> Result<String, ConfigNodeError> {
    serde_yaml::to_string(attrs).map_err(|e| ConfigNodeError::Malformed {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// Read the node at `path`, which need not exist yet.
pub fn read_config_node(
    store: &Store,
    path: &str,
) -> Result<ConfigNode, ConfigNodeError> {
    let mut node = ConfigNode {
        store: store.clone(),
        path: path.to_string(),
        disk: Attrs::new(),
        cache: Attrs::new(),
    };
    node.read()?;
    Ok(node)
}

/// Create the node at `path` with the given initial contents and return it.
pub fn create_config_node(
    store: &Store,
    path: &str,
    initial: Attrs,
) -> Result<ConfigNode, ConfigNodeError> {
    let mut node = ConfigNode {
        store: store.clone(),
        path: path.to_string(),
        disk: Attrs::new(),
        cache: initial,
    };
    node.write()?;
    Ok(node)
}

impl ConfigNode {
    /// Keys in alphabetical order, including local modifications.
    pub fn keys(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.cache.get(key)
    }

    pub fn set(
        &mut self,
        key: &str,
        value: impl Into<serde_yaml::Value>,
    ) {
        self.cache.insert(key.to_string(), value.into());
    }

    pub fn update(&mut self, attrs: Attrs) {
        self.cache.extend(attrs);
    }

    pub fn delete(&mut self, key: &str) {
        self.cache.remove(key);
    }

    /// A copy of the current (locally modified) contents.
    pub fn map(&self) -> Attrs {
        self.cache.clone()
    }

    /// Re-read the node, discarding any local modifications.
    pub fn read(&mut self) -> Result<(), ConfigNodeError> {
        let (contents, _) = self.store.read(&self.path)?;
        self.disk = parse(&self.path, contents.as_deref())?;
        self.cache = self.disk.clone();
        Ok(())
    }

    /// Flush local modifications and return what changed, ordered by key.
    ///
    /// The modifications are applied as a delta against this node's last
    /// known contents, merged onto the store's current contents under
    /// compare-and-swap, so concurrent writers editing different keys do
    /// not clobber one another.
    pub fn write(&mut self) -> Result<Vec<ItemChange>, ConfigNodeError> {
        let mut changes = Vec::new();
        let keys: BTreeSet<&String> =
            self.disk.keys().chain(self.cache.keys()).collect();
        for key in keys {
            let old = self.disk.get(key);
            let new = self.cache.get(key);
            let kind = match (old, new) {
                (None, Some(_)) => ItemChangeKind::Added,
                (Some(_), None) => ItemChangeKind::Deleted,
                (Some(o), Some(n)) if o != n => ItemChangeKind::Modified,
                _ => continue,
            };
            changes.push(ItemChange {
                kind,
                key: key.clone(),
                old_value: old.cloned(),
                new_value: new.cloned(),
            });
        }
        if changes.is_empty() {
            return Ok(changes);
        }

        let path = self.path.clone();
        let mut merged = Attrs::new();
        self.store.retry_change(&self.path, |contents| {
            merged = parse(&path, contents)?;
            for change in &changes {
                match &change.new_value {
                    Some(value) => {
                        merged.insert(change.key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(&change.key);
                    }
                }
            }
            Ok::<_, ConfigNodeError>(Some(dump(&path, &merged)?))
        })?;

        self.disk = merged;
        self.cache = self.disk.clone();
        Ok(changes)
    }
}
