// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provider storage helpers: an in-memory [`Storage`] implementation and
//! the bootstrap state marker.
//!
//! The state marker is how bootstrap stays idempotent and how a restarted
//! provisioner learns which instances belong to the state server rather
//! than to any machine: it must never reap those.

use crate::{Error, InstanceId, Storage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Name of the bootstrap state marker in provider storage.
pub const STATE_FILE: &str = "provider-state";

/// The bootstrap state marker's contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootstrapState {
    /// Instances hosting the state server.
    pub state_instances: Vec<String>,
}

impl BootstrapState {
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.state_instances.iter().map(|id| InstanceId(id.clone())).collect()
    }
}

/// Write the bootstrap state marker.
pub async fn save_state(
    storage: &dyn Storage,
    state: &BootstrapState,
) -> Result<(), Error> {
    let yaml = serde_yaml::to_string(state)
        .expect("a bootstrap state always serializes");
    storage.put(STATE_FILE, yaml.as_bytes()).await
}

/// Read the bootstrap state marker.  [`Error::NotBootstrapped`] if there
/// isn't one.
pub async fn load_state(storage: &dyn Storage) -> Result<BootstrapState, Error> {
    let raw = match storage.get(STATE_FILE).await {
        Ok(raw) => raw,
        Err(Error::StorageNotFound(_)) => return Err(Error::NotBootstrapped),
        Err(error) => return Err(error),
    };
    let yaml = String::from_utf8(raw)
        .map_err(|e| Error::Provider(format!("corrupt state marker: {}", e)))?;
    serde_yaml::from_str(&yaml)
        .map_err(|e| Error::Provider(format!("corrupt state marker: {}", e)))
}

/// Remove the bootstrap state marker, if present.
pub async fn remove_state(storage: &dyn Storage) -> Result<(), Error> {
    match storage.remove(STATE_FILE).await {
        Ok(()) | Err(Error::StorageNotFound(_)) => Ok(()),
        Err(error) => Err(error),
    }
}

/// In-memory provider storage.
#[derive(Default)]
pub struct MemStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> MemStorage {
        MemStorage::default()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StorageNotFound(name.to_string()))
    }

    async fn put(&self, name: &str, contents: &[u8]) -> Result<(), Error> {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), contents.to_vec());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), Error> {
        match self.files.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::StorageNotFound(name.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn state_marker_round_trips() {
        let storage = MemStorage::new();
        assert_matches!(
            load_state(&storage).await,
            Err(Error::NotBootstrapped)
        );

        let state = BootstrapState {
            state_instances: vec!["i-0".to_string()],
        };
        save_state(&storage, &state).await.unwrap();
        assert_eq!(load_state(&storage).await.unwrap(), state);

        remove_state(&storage).await.unwrap();
        assert_matches!(
            load_state(&storage).await,
            Err(Error::NotBootstrapped)
        );
        // Removing twice is fine.
        remove_state(&storage).await.unwrap();
    }
}
