// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The topology document: the single logically-atomic description of every
//! service, unit, machine, and relation in an environment.
//!
//! The document is stored as YAML under one path in the coordination store
//! and mutated exclusively through [`crate::Store::retry_change`], so all the
//! operations here are pure in-memory transformations.  The protocol version
//! is stored under the `version` key and should *only* be bumped when a
//! change is in fact incompatible; a reader that sees a version it does not
//! recognize refuses to parse.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The topology protocol version.
pub const TOPOLOGY_VERSION: u32 = 1;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TopologyError {
    #[error("incompatible topology versions: got {got}, want {want}")]
    IncompatibleVersions { got: u32, want: u32 },

    #[error("malformed topology document: {0}")]
    Malformed(String),

    #[error("attempted to add duplicated service {0:?}")]
    DuplicatedService(String),

    #[error("service name {0:?} already in use")]
    ServiceNameInUse(String),

    #[error("service with name {0:?} cannot be found")]
    ServiceNameNotFound(String),

    #[error("service with key {0:?} cannot be found")]
    ServiceNotFound(String),

    #[error("unit {unit:?} already in use in service {service:?}")]
    UnitAlreadyInUse { unit: String, service: String },

    #[error("unit with key {0:?} cannot be found")]
    UnitNotFound(String),

    #[error("unit with sequence number {0} cannot be found")]
    UnitSequenceNotFound(u32),

    #[error("unit {unit:?} in service {service:?} is not assigned to a machine")]
    UnitNotAssigned { unit: String, service: String },

    #[error(
        "unit {unit:?} in service {service:?} already assigned to machine {machine:?}"
    )]
    UnitAlreadyAssigned { unit: String, service: String, machine: String },

    #[error("attempted to add duplicated machine {0:?}")]
    DuplicatedMachine(String),

    #[error("machine with key {0:?} cannot be found")]
    MachineNotFound(String),

    #[error("attempted to add duplicated relation {0:?}")]
    DuplicatedRelation(String),

    #[error("relation with key {0:?} cannot be found")]
    RelationNotFound(String),

    #[error("relation must have either one peer endpoint or a provider and a requirer endpoint")]
    MalformedRelation,
}

/// Life state of a machine (and, eventually, of any topology entity).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

/// Role of one endpoint of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationRole {
    Provider,
    Requirer,
    Peer,
}

/// Scope of one endpoint of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationScope {
    Global,
    Container,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelationEndpoint {
    pub service_key: String,
    pub name: String,
    pub role: RelationRole,
    pub scope: RelationScope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UnitRecord {
    sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    machine: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ServiceRecord {
    name: String,
    #[serde(default)]
    units: BTreeMap<String, UnitRecord>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MachineRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
    #[serde(default)]
    life: Life,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RelationRecord {
    endpoints: Vec<RelationEndpoint>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

/// On-disk shape of the document.  Unknown top-level keys land in `extra`
/// and are preserved on round-trip, as are unknown keys within each record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TopologyDoc {
    version: u32,
    #[serde(default)]
    services: BTreeMap<String, ServiceRecord>,
    #[serde(default)]
    unit_sequence: BTreeMap<String, u32>,
    #[serde(default)]
    unit_key_sequence: u32,
    #[serde(default)]
    service_key_sequence: u32,
    #[serde(default)]
    machine_sequence: u32,
    #[serde(default)]
    relation_sequence: u32,
    #[serde(default)]
    machines: BTreeMap<String, MachineRecord>,
    #[serde(default)]
    relations: BTreeMap<String, RelationRecord>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for TopologyDoc {
    fn default() -> TopologyDoc {
        TopologyDoc {
            version: TOPOLOGY_VERSION,
            services: BTreeMap::new(),
            unit_sequence: BTreeMap::new(),
            unit_key_sequence: 0,
            service_key_sequence: 0,
            machine_sequence: 0,
            relation_sequence: 0,
            machines: BTreeMap::new(),
            relations: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// Used to check the protocol version before committing to a full parse.
#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// In-memory handle on the topology document.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    doc: TopologyDoc,
}

/// A machine as seen by readers of the topology.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub key: String,
    pub instance_id: Option<String>,
    pub life: Life,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Parse the YAML representation.  `None` (the path has never been
    /// written) parses as an empty document at the current version.
    pub fn parse(yaml: Option<&str>) -> Result<Topology, TopologyError> {
        let yaml = match yaml {
            None | Some("") => return Ok(Topology::new()),
            Some(yaml) => yaml,
        };
        let probe: VersionProbe = serde_yaml::from_str(yaml)
            .map_err(|e| TopologyError::Malformed(e.to_string()))?;
        if probe.version != TOPOLOGY_VERSION {
            return Err(TopologyError::IncompatibleVersions {
                got: probe.version,
                want: TOPOLOGY_VERSION,
            });
        }
        let doc: TopologyDoc = serde_yaml::from_str(yaml)
            .map_err(|e| TopologyError::Malformed(e.to_string()))?;
        Ok(Topology { doc })
    }

    /// Return the document as YAML.
    pub fn dump(&self) -> Result<String, TopologyError> {
        serde_yaml::to_string(&self.doc)
            .map_err(|e| TopologyError::Malformed(e.to_string()))
    }

    pub fn version(&self) -> u32 {
        self.doc.version
    }

    // Services

    pub fn has_service(&self, service_key: &str) -> bool {
        self.doc.services.contains_key(service_key)
    }

    pub fn add_service(
        &mut self,
        service_key: &str,
        name: &str,
    ) -> Result<(), TopologyError> {
        if self.doc.services.contains_key(service_key) {
            return Err(TopologyError::DuplicatedService(
                service_key.to_string(),
            ));
        }
        if self.doc.services.values().any(|svc| svc.name == name) {
            return Err(TopologyError::ServiceNameInUse(name.to_string()));
        }
        self.doc.services.insert(
            service_key.to_string(),
            ServiceRecord { name: name.to_string(), ..Default::default() },
        );
        Ok(())
    }

    pub fn remove_service(
        &mut self,
        service_key: &str,
    ) -> Result<(), TopologyError> {
        self.assert_service(service_key)?;
        // The unit sequence for the service's name is deliberately retained:
        // unit names must stay unique even if a service with the same name is
        // created again later.
        self.doc.services.remove(service_key);
        Ok(())
    }

    pub fn service_key(&self, name: &str) -> Result<String, TopologyError> {
        self.doc
            .services
            .iter()
            .find(|(_, svc)| svc.name == name)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| TopologyError::ServiceNameNotFound(name.to_string()))
    }

    pub fn service_name(
        &self,
        service_key: &str,
    ) -> Result<String, TopologyError> {
        Ok(self.service(service_key)?.name.clone())
    }

    pub fn service_keys(&self) -> Vec<String> {
        self.doc.services.keys().cloned().collect()
    }

    /// Allocate the key for a new service.  Keys are never reused.
    pub fn next_service_key(&mut self) -> String {
        let key = format!("s-{}", self.doc.service_key_sequence);
        self.doc.service_key_sequence += 1;
        key
    }

    // Units

    pub fn has_unit(&self, service_key: &str, unit_key: &str) -> bool {
        self.doc
            .services
            .get(service_key)
            .map(|svc| svc.units.contains_key(unit_key))
            .unwrap_or(false)
    }

    /// Add a new unit and return its sequence number.  The sequence number
    /// increases monotonically for each service name and is what makes unit
    /// names (`<service>/<sequence>`) globally unique for all time.
    pub fn add_unit(
        &mut self,
        service_key: &str,
        unit_key: &str,
    ) -> Result<u32, TopologyError> {
        self.assert_service(service_key)?;
        // Unit keys are globally unique across services.
        for (key, svc) in &self.doc.services {
            if svc.units.contains_key(unit_key) {
                return Err(TopologyError::UnitAlreadyInUse {
                    unit: unit_key.to_string(),
                    service: key.clone(),
                });
            }
        }
        let name = self.service(service_key)?.name.clone();
        let sequence = *self.doc.unit_sequence.get(&name).unwrap_or(&0);
        self.service_mut(service_key)?.units.insert(
            unit_key.to_string(),
            UnitRecord { sequence, ..Default::default() },
        );
        self.doc.unit_sequence.insert(name, sequence + 1);
        Ok(sequence)
    }

    pub fn remove_unit(
        &mut self,
        service_key: &str,
        unit_key: &str,
    ) -> Result<(), TopologyError> {
        self.assert_unit(service_key, unit_key)?;
        self.service_mut(service_key)?.units.remove(unit_key);
        Ok(())
    }

    /// Unit keys for all units of a service, in alphabetical order.
    pub fn unit_keys(
        &self,
        service_key: &str,
    ) -> Result<Vec<String>, TopologyError> {
        Ok(self.service(service_key)?.units.keys().cloned().collect())
    }

    /// The human-readable name of a unit: `<service>/<sequence>`.
    pub fn unit_name(
        &self,
        service_key: &str,
        unit_key: &str,
    ) -> Result<String, TopologyError> {
        self.assert_unit(service_key, unit_key)?;
        let svc = self.service(service_key)?;
        let unit = &svc.units[unit_key];
        Ok(format!("{}/{}", svc.name, unit.sequence))
    }

    pub fn unit_key_from_sequence(
        &self,
        service_key: &str,
        sequence: u32,
    ) -> Result<String, TopologyError> {
        self.service(service_key)?
            .units
            .iter()
            .find(|(_, unit)| unit.sequence == sequence)
            .map(|(key, _)| key.clone())
            .ok_or(TopologyError::UnitSequenceNotFound(sequence))
    }

    /// Allocate the key for a new unit.  Keys are never reused.
    pub fn next_unit_key(&mut self) -> String {
        let key = format!("u-{}", self.doc.unit_key_sequence);
        self.doc.unit_key_sequence += 1;
        key
    }

    /// The key of the machine the unit is assigned to, if any.
    pub fn unit_machine_key(
        &self,
        service_key: &str,
        unit_key: &str,
    ) -> Result<Option<String>, TopologyError> {
        self.assert_unit(service_key, unit_key)?;
        Ok(self.service(service_key)?.units[unit_key].machine.clone())
    }

    pub fn assign_unit_to_machine(
        &mut self,
        service_key: &str,
        unit_key: &str,
        machine_key: &str,
    ) -> Result<(), TopologyError> {
        self.assert_unit(service_key, unit_key)?;
        self.assert_machine(machine_key)?;
        let unit = self.unit_mut(service_key, unit_key)?;
        if let Some(assigned) = &unit.machine {
            return Err(TopologyError::UnitAlreadyAssigned {
                unit: unit_key.to_string(),
                service: service_key.to_string(),
                machine: assigned.clone(),
            });
        }
        unit.machine = Some(machine_key.to_string());
        Ok(())
    }

    pub fn unassign_unit_from_machine(
        &mut self,
        service_key: &str,
        unit_key: &str,
    ) -> Result<(), TopologyError> {
        self.assert_unit(service_key, unit_key)?;
        let unit = self.unit_mut(service_key, unit_key)?;
        if unit.machine.is_none() {
            return Err(TopologyError::UnitNotAssigned {
                unit: unit_key.to_string(),
                service: service_key.to_string(),
            });
        }
        unit.machine = None;
        Ok(())
    }

    // Machines

    /// Add a new machine and return its key.  Keys are never reused.
    pub fn add_machine(&mut self) -> String {
        let key = format!("m-{}", self.doc.machine_sequence);
        self.doc.machine_sequence += 1;
        self.doc.machines.insert(key.clone(), MachineRecord::default());
        key
    }

    pub fn has_machine(&self, machine_key: &str) -> bool {
        self.doc.machines.contains_key(machine_key)
    }

    pub fn remove_machine(
        &mut self,
        machine_key: &str,
    ) -> Result<(), TopologyError> {
        self.assert_machine(machine_key)?;
        self.doc.machines.remove(machine_key);
        Ok(())
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.doc
            .machines
            .iter()
            .map(|(key, record)| Machine {
                key: key.clone(),
                instance_id: record.instance_id.clone(),
                life: record.life,
            })
            .collect()
    }

    pub fn machine_instance_id(
        &self,
        machine_key: &str,
    ) -> Result<Option<String>, TopologyError> {
        self.assert_machine(machine_key)?;
        Ok(self.doc.machines[machine_key].instance_id.clone())
    }

    pub fn set_machine_instance_id(
        &mut self,
        machine_key: &str,
        instance_id: Option<String>,
    ) -> Result<(), TopologyError> {
        self.assert_machine(machine_key)?;
        self.machine_mut(machine_key)?.instance_id = instance_id;
        Ok(())
    }

    pub fn machine_life(
        &self,
        machine_key: &str,
    ) -> Result<Life, TopologyError> {
        self.assert_machine(machine_key)?;
        Ok(self.doc.machines[machine_key].life)
    }

    pub fn set_machine_life(
        &mut self,
        machine_key: &str,
        life: Life,
    ) -> Result<(), TopologyError> {
        self.assert_machine(machine_key)?;
        self.machine_mut(machine_key)?.life = life;
        Ok(())
    }

    // Relations

    pub fn add_relation(
        &mut self,
        relation_key: &str,
        endpoints: Vec<RelationEndpoint>,
    ) -> Result<(), TopologyError> {
        if self.doc.relations.contains_key(relation_key) {
            return Err(TopologyError::DuplicatedRelation(
                relation_key.to_string(),
            ));
        }
        let roles: Vec<_> = endpoints.iter().map(|ep| ep.role).collect();
        let well_formed = match roles.as_slice() {
            [RelationRole::Peer] => true,
            [a, b] => {
                matches!(
                    (a, b),
                    (RelationRole::Provider, RelationRole::Requirer)
                        | (RelationRole::Requirer, RelationRole::Provider)
                )
            }
            _ => false,
        };
        if !well_formed {
            return Err(TopologyError::MalformedRelation);
        }
        for endpoint in &endpoints {
            self.assert_service(&endpoint.service_key)?;
        }
        self.doc.relations.insert(
            relation_key.to_string(),
            RelationRecord { endpoints, ..Default::default() },
        );
        Ok(())
    }

    pub fn has_relation(&self, relation_key: &str) -> bool {
        self.doc.relations.contains_key(relation_key)
    }

    pub fn remove_relation(
        &mut self,
        relation_key: &str,
    ) -> Result<(), TopologyError> {
        if self.doc.relations.remove(relation_key).is_none() {
            return Err(TopologyError::RelationNotFound(
                relation_key.to_string(),
            ));
        }
        Ok(())
    }

    pub fn relation_endpoints(
        &self,
        relation_key: &str,
    ) -> Result<Vec<RelationEndpoint>, TopologyError> {
        self.doc
            .relations
            .get(relation_key)
            .map(|r| r.endpoints.clone())
            .ok_or_else(|| {
                TopologyError::RelationNotFound(relation_key.to_string())
            })
    }

    pub fn relation_keys(&self) -> Vec<String> {
        self.doc.relations.keys().cloned().collect()
    }

    /// All relations one service participates in, with the service's own
    /// endpoint in each.
    pub fn relations_of_service(
        &self,
        service_key: &str,
    ) -> Result<Vec<(String, RelationEndpoint)>, TopologyError> {
        self.assert_service(service_key)?;
        let mut relations = Vec::new();
        for (key, record) in &self.doc.relations {
            for endpoint in &record.endpoints {
                if endpoint.service_key == service_key {
                    relations.push((key.clone(), endpoint.clone()));
                }
            }
        }
        Ok(relations)
    }

    /// Allocate the key for a new relation.  Keys are never reused.
    pub fn next_relation_key(&mut self) -> String {
        let key = format!("r-{}", self.doc.relation_sequence);
        self.doc.relation_sequence += 1;
        key
    }

    // Internal helpers

    fn service(
        &self,
        service_key: &str,
    ) -> Result<&ServiceRecord, TopologyError> {
        self.doc
            .services
            .get(service_key)
            .ok_or_else(|| TopologyError::ServiceNotFound(service_key.to_string()))
    }

    fn service_mut(
        &mut self,
        service_key: &str,
    ) -> Result<&mut ServiceRecord, TopologyError> {
        self.doc
            .services
            .get_mut(service_key)
            .ok_or_else(|| TopologyError::ServiceNotFound(service_key.to_string()))
    }

    fn unit_mut(
        &mut self,
        service_key: &str,
        unit_key: &str,
    ) -> Result<&mut UnitRecord, TopologyError> {
        self.service_mut(service_key)?
            .units
            .get_mut(unit_key)
            .ok_or_else(|| TopologyError::UnitNotFound(unit_key.to_string()))
    }

    fn machine_mut(
        &mut self,
        machine_key: &str,
    ) -> Result<&mut MachineRecord, TopologyError> {
        self.doc
            .machines
            .get_mut(machine_key)
            .ok_or_else(|| TopologyError::MachineNotFound(machine_key.to_string()))
    }

    fn assert_service(&self, service_key: &str) -> Result<(), TopologyError> {
        self.service(service_key).map(|_| ())
    }

    fn assert_unit(
        &self,
        service_key: &str,
        unit_key: &str,
    ) -> Result<(), TopologyError> {
        if !self.service(service_key)?.units.contains_key(unit_key) {
            return Err(TopologyError::UnitNotFound(unit_key.to_string()));
        }
        Ok(())
    }

    fn assert_machine(&self, machine_key: &str) -> Result<(), TopologyError> {
        if !self.doc.machines.contains_key(machine_key) {
            return Err(TopologyError::MachineNotFound(
                machine_key.to_string(),
            ));
        }
        Ok(())
    }
}
