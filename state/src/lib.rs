// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared environment state: the coordination store, the topology document
//! that lives in it, and the typed operations agents perform against both.
//!
//! [`State`] is the handle everything else in drover holds.  All topology
//! mutations go through [`Store::retry_change`] with a pure transform, so
//! they are linearizable without any locking on the caller's side.

use slog::{o, Logger};
use thiserror::Error;
use tokio::sync::watch;

pub mod config;
pub mod presence;
pub mod relation;
pub mod store;
pub mod topology;

pub use config::{read_config_node, Attrs, ConfigNode, ConfigNodeError, ItemChange, ItemChangeKind};
pub use relation::{RelationSnapshot, RelationUnit, RelationWatch, RemoteUnit};
pub use store::{NodeSnapshot, Store, StoreError, Version};
pub use topology::{
    Life, Machine, RelationEndpoint, RelationRole, RelationScope, Topology,
    TopologyError,
};

/// Store path of the topology document.
pub const TOPOLOGY_PATH: &str = "/topology";

/// Store path of the environment configuration node.
pub const ENVIRONMENT_PATH: &str = "/environment";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    ConfigNode(#[from] ConfigNodeError),

    #[error("machine {0:?} is not provisioned")]
    NotProvisioned(String),

    #[error("unit {0:?} is already marked resolved")]
    AlreadyResolved(String),

    #[error("malformed document at {path:?}: {message}")]
    Malformed { path: String, message: String },
}

/// How an operator wants a failed hook handled once resolved.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedMode {
    /// Re-run the failed hook.
    Retry,
    /// Record the hook as complete without re-running it.
    Skip,
}

/// Operator-visible status of a unit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "message")]
pub enum UnitStatus {
    Pending,
    Installed,
    Started,
    Stopped,
    Error(String),
}

/// Typed access to one environment's shared state.  Cheap to clone.
#[derive(Clone)]
pub struct State {
    log: Logger,
    store: Store,
}

impl State {
    pub fn new(log: &Logger, store: Store) -> State {
        State { log: log.new(o!("component" => "State")), store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Read and parse the current topology document.
    pub fn topology(&self) -> Result<Topology, StateError> {
        let (contents, _) = self.store.read(TOPOLOGY_PATH)?;
        Ok(Topology::parse(contents.as_deref())?)
    }

    /// Apply a pure transformation to the topology document.  `f` may run
    /// multiple times (on write conflict), so it must be side-effect free;
    /// its value from the successful run is returned.
    pub fn update_topology<T>(
        &self,
        mut f: impl FnMut(&mut Topology) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut outcome = None;
        self.store.retry_change(TOPOLOGY_PATH, |contents| {
            let mut topology = Topology::parse(contents)?;
            outcome = Some(f(&mut topology)?);
            Ok::<_, StateError>(Some(topology.dump()?))
        })?;
        Ok(outcome.expect("retry_change ran the transform at least once"))
    }

    /// Watch the topology document.  The receiver is a coalescing snapshot
    /// of the raw node; use [`State::topology`] to interpret it.
    pub fn watch_topology(&self) -> watch::Receiver<NodeSnapshot> {
        self.store.watch(TOPOLOGY_PATH)
    }

    // Machines

    /// Add a machine to the topology and return its key.
    pub fn add_machine(&self) -> Result<String, StateError> {
        self.update_topology(|t| Ok(t.add_machine()))
    }

    pub fn remove_machine(&self, machine_key: &str) -> Result<(), StateError> {
        self.update_topology(|t| Ok(t.remove_machine(machine_key)?))
    }

    pub fn machines(&self) -> Result<Vec<Machine>, StateError> {
        Ok(self.topology()?.machines())
    }

    /// The instance id recorded for a machine, or
    /// [`StateError::NotProvisioned`] if none has been recorded yet.
    pub fn instance_id(&self, machine_key: &str) -> Result<String, StateError> {
        self.topology()?
            .machine_instance_id(machine_key)?
            .ok_or_else(|| StateError::NotProvisioned(machine_key.to_string()))
    }

    pub fn set_instance_id(
        &self,
        machine_key: &str,
        instance_id: Option<String>,
    ) -> Result<(), StateError> {
        self.update_topology(|t| {
            Ok(t.set_machine_instance_id(machine_key, instance_id.clone())?)
        })
    }

    pub fn set_machine_life(
        &self,
        machine_key: &str,
        life: Life,
    ) -> Result<(), StateError> {
        self.update_topology(|t| Ok(t.set_machine_life(machine_key, life)?))
    }

    // Services and units

    /// Deploy a service: allocate a key, record the name.
    pub fn add_service(&self, name: &str) -> Result<String, StateError> {
        self.update_topology(|t| {
            let key = t.next_service_key();
            t.add_service(&key, name)?;
            Ok(key)
        })
    }

    pub fn service_key(&self, name: &str) -> Result<String, StateError> {
        Ok(self.topology()?.service_key(name)?)
    }

    /// Add a unit of the named service and return its name
    /// (`<service>/<sequence>`).
    pub fn add_unit(&self, service_name: &str) -> Result<String, StateError> {
        self.update_topology(|t| {
            let service_key = t.service_key(service_name)?;
            let unit_key = t.next_unit_key();
            let sequence = t.add_unit(&service_key, &unit_key)?;
            Ok(format!("{}/{}", service_name, sequence))
        })
    }

    /// All relations the named unit's service participates in, with the
    /// service's own endpoint in each.
    pub fn unit_relations(
        &self,
        unit_name: &str,
    ) -> Result<Vec<(String, RelationEndpoint)>, StateError> {
        let service_name = service_of_unit(unit_name);
        let topology = self.topology()?;
        let service_key = topology.service_key(service_name)?;
        Ok(topology.relations_of_service(&service_key)?)
    }

    // Relations

    /// Relate services: allocate a relation key and record the endpoints.
    pub fn add_relation(
        &self,
        endpoints: Vec<RelationEndpoint>,
    ) -> Result<String, StateError> {
        self.update_topology(|t| {
            let key = t.next_relation_key();
            t.add_relation(&key, endpoints.clone())?;
            Ok(key)
        })
    }

    /// Mark a relation as dying.  Member units observe this through their
    /// relation watchers and run their departed/broken sequences.
    pub fn set_relation_dying(&self, relation_key: &str) -> Result<(), StateError> {
        let path = format!("/relations/{}/life", relation_key);
        self.store
            .retry_change(&path, |_| Ok::<_, StoreError>(Some("dying".to_string())))?;
        Ok(())
    }

    /// A unit's handle on one relation, resolving the relation name from
    /// the unit's own endpoint.
    pub fn relation_unit(
        &self,
        relation_key: &str,
        unit_name: &str,
    ) -> Result<RelationUnit, StateError> {
        let topology = self.topology()?;
        let service_key = topology.service_key(service_of_unit(unit_name))?;
        let endpoint = topology
            .relation_endpoints(relation_key)?
            .into_iter()
            .find(|ep| ep.service_key == service_key)
            .ok_or_else(|| {
                StateError::Topology(TopologyError::RelationNotFound(
                    relation_key.to_string(),
                ))
            })?;
        Ok(RelationUnit::new(
            &self.log,
            self.store.clone(),
            relation_key,
            &endpoint.name,
            unit_name,
        ))
    }

    // Environment configuration

    /// The environment configuration node.
    pub fn environ_config(&self) -> Result<ConfigNode, StateError> {
        Ok(read_config_node(&self.store, ENVIRONMENT_PATH)?)
    }

    pub fn watch_environment(&self) -> watch::Receiver<NodeSnapshot> {
        self.store.watch(ENVIRONMENT_PATH)
    }

    // Unit administration

    fn unit_path(unit_name: &str, leaf: &str) -> String {
        format!("/units/{}/{}", unit_name, leaf)
    }

    pub fn set_unit_status(
        &self,
        unit_name: &str,
        status: &UnitStatus,
    ) -> Result<(), StateError> {
        let path = Self::unit_path(unit_name, "status");
        let contents = serde_yaml::to_string(status)
            .expect("a unit status always serializes");
        self.store
            .retry_change(&path, move |_| Ok::<_, StoreError>(Some(contents.clone())))?;
        Ok(())
    }

    pub fn unit_status(
        &self,
        unit_name: &str,
    ) -> Result<Option<UnitStatus>, StateError> {
        let path = Self::unit_path(unit_name, "status");
        let (contents, _) = self.store.read(&path)?;
        match contents.as_deref() {
            None => Ok(None),
            Some(contents) => serde_yaml::from_str(contents)
                .map(Some)
                .map_err(|e| StateError::Malformed {
                    path,
                    message: e.to_string(),
                }),
        }
    }

    /// Mark a failed unit resolved.  Fails if a resolution is already
    /// pending, so an operator cannot stack them.
    pub fn set_resolved(
        &self,
        unit_name: &str,
        mode: ResolvedMode,
    ) -> Result<(), StateError> {
        let path = Self::unit_path(unit_name, "resolved");
        let (contents, version) = self.store.read(&path)?;
        if contents.is_some() {
            return Err(StateError::AlreadyResolved(unit_name.to_string()));
        }
        let contents = serde_yaml::to_string(&mode)
            .expect("a resolved mode always serializes");
        match self.store.write(&path, version, &contents) {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => {
                Err(StateError::AlreadyResolved(unit_name.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn resolved(
        &self,
        unit_name: &str,
    ) -> Result<Option<ResolvedMode>, StateError> {
        let path = Self::unit_path(unit_name, "resolved");
        let (contents, _) = self.store.read(&path)?;
        Ok(contents
            .as_deref()
            .and_then(|contents| serde_yaml::from_str(contents).ok()))
    }

    pub fn clear_resolved(&self, unit_name: &str) -> Result<(), StateError> {
        let path = Self::unit_path(unit_name, "resolved");
        self.store.retry_change(&path, |_| Ok::<_, StoreError>(None))?;
        Ok(())
    }

    pub fn watch_resolved(&self, unit_name: &str) -> watch::Receiver<NodeSnapshot> {
        self.store.watch(&Self::unit_path(unit_name, "resolved"))
    }

    /// Mark a unit as dying; its agent runs the stop sequence and exits.
    pub fn set_unit_dying(&self, unit_name: &str) -> Result<(), StateError> {
        let path = Self::unit_path(unit_name, "life");
        self.store
            .retry_change(&path, |_| Ok::<_, StoreError>(Some("dying".to_string())))?;
        Ok(())
    }

    pub fn watch_unit_life(&self, unit_name: &str) -> watch::Receiver<NodeSnapshot> {
        self.store.watch(&Self::unit_path(unit_name, "life"))
    }

    /// The configuration node for a service's charm settings.
    pub fn service_config(
        &self,
        service_name: &str,
    ) -> Result<ConfigNode, StateError> {
        let key = self.service_key(service_name)?;
        Ok(read_config_node(&self.store, &format!("/services/{}/config", key))?)
    }

    pub fn watch_service_config(
        &self,
        service_name: &str,
    ) -> Result<watch::Receiver<NodeSnapshot>, StateError> {
        let key = self.service_key(service_name)?;
        Ok(self.store.watch(&format!("/services/{}/config", key)))
    }

    /// The charm URL recorded for a service.
    pub fn set_service_charm(
        &self,
        service_name: &str,
        charm_url: &str,
    ) -> Result<(), StateError> {
        let key = self.service_key(service_name)?;
        let path = format!("/services/{}/charm", key);
        let charm_url = charm_url.to_string();
        self.store
            .retry_change(&path, move |_| Ok::<_, StoreError>(Some(charm_url.clone())))?;
        Ok(())
    }

    pub fn watch_service_charm(
        &self,
        service_name: &str,
    ) -> Result<watch::Receiver<NodeSnapshot>, StateError> {
        let key = self.service_key(service_name)?;
        Ok(self.store.watch(&format!("/services/{}/charm", key)))
    }
}

/// The service name embedded in a unit name (`wordpress/0` → `wordpress`).
pub fn service_of_unit(unit_name: &str) -> &str {
    unit_name.split('/').next().unwrap_or(unit_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &'static str) -> State {
        let log = drover_test_utils::test_logger(name);
        State::new(&log, Store::new(log.clone()))
    }

    #[tokio::test]
    async fn machines_round_trip() {
        let state = state("machines");
        let m0 = state.add_machine().unwrap();
        let m1 = state.add_machine().unwrap();
        assert_eq!(m0, "m-0");
        assert_eq!(m1, "m-1");

        assert_eq!(
            state.instance_id(&m0).unwrap_err(),
            StateError::NotProvisioned("m-0".to_string())
        );
        state.set_instance_id(&m0, Some("i-4".to_string())).unwrap();
        assert_eq!(state.instance_id(&m0).unwrap(), "i-4");

        state.remove_machine(&m1).unwrap();
        let machines = state.machines().unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].key, "m-0");
    }

    #[tokio::test]
    async fn units_are_named_by_sequence() {
        let state = state("units");
        state.add_service("wordpress").unwrap();
        assert_eq!(state.add_unit("wordpress").unwrap(), "wordpress/0");
        assert_eq!(state.add_unit("wordpress").unwrap(), "wordpress/1");
    }

    #[tokio::test]
    async fn relations_resolve_unit_endpoints() {
        let state = state("relations");
        let wp = state.add_service("wordpress").unwrap();
        let my = state.add_service("mysql").unwrap();
        let rel = state
            .add_relation(vec![
                RelationEndpoint {
                    service_key: my.clone(),
                    name: "db".to_string(),
                    role: RelationRole::Provider,
                    scope: RelationScope::Global,
                },
                RelationEndpoint {
                    service_key: wp.clone(),
                    name: "db".to_string(),
                    role: RelationRole::Requirer,
                    scope: RelationScope::Global,
                },
            ])
            .unwrap();

        let unit = state.add_unit("wordpress").unwrap();
        let relations = state.unit_relations(&unit).unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].0, rel);

        let ru = state.relation_unit(&rel, &unit).unwrap();
        assert_eq!(ru.relation_name(), "db");
        assert_eq!(ru.unit_name(), "wordpress/0");
    }

    #[tokio::test]
    async fn resolved_cannot_be_stacked() {
        let state = state("resolved");
        assert_eq!(state.resolved("wordpress/0").unwrap(), None);
        state.set_resolved("wordpress/0", ResolvedMode::Retry).unwrap();
        assert_eq!(
            state.resolved("wordpress/0").unwrap(),
            Some(ResolvedMode::Retry)
        );
        assert_eq!(
            state.set_resolved("wordpress/0", ResolvedMode::Skip).unwrap_err(),
            StateError::AlreadyResolved("wordpress/0".to_string())
        );
        state.clear_resolved("wordpress/0").unwrap();
        assert_eq!(state.resolved("wordpress/0").unwrap(), None);
    }

    #[tokio::test]
    async fn unit_status_round_trips() {
        let state = state("status");
        assert_eq!(state.unit_status("wordpress/0").unwrap(), None);
        state
            .set_unit_status(
                "wordpress/0",
                &UnitStatus::Error("hook failed: \"install\"".to_string()),
            )
            .unwrap();
        assert_eq!(
            state.unit_status("wordpress/0").unwrap(),
            Some(UnitStatus::Error("hook failed: \"install\"".to_string()))
        );
    }
}
