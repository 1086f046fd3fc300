// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cloud provider interface.
//!
//! An [`Environ`] is one environment's handle on its cloud provider:
//! bootstrap, instance lifecycle, storage, and port control.  Every
//! operation tolerates concurrent callers.  `start_instance` either returns
//! a usable instance whose id is stable and recordable, or fails with no
//! side effect — the provisioner depends on that to avoid leaking
//! instances.
//!
//! Concrete providers register a factory in the process-wide
//! [`registry`]; the [`dummy`] provider backs the test suites.

use async_trait::async_trait;
use slog::Logger;
use std::sync::Arc;
use thiserror::Error;

pub mod config;
pub mod dummy;
pub mod registry;
pub mod storage;

pub use config::{Attrs, ConfigError, EnvironConfig};
pub use storage::{
    load_state, remove_state, save_state, BootstrapState, MemStorage, STATE_FILE,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("environment is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("environment is not bootstrapped")]
    NotBootstrapped,

    #[error("no instances found")]
    NoInstances,

    #[error("file {0:?} not found in provider storage")]
    StorageNotFound(String),

    #[error("no registered provider for type {0:?}")]
    UnknownProvider(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("provider operation failed: {0}")]
    Provider(String),

    #[error(transparent)]
    Store(#[from] drover_state::StoreError),
}

impl Error {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Provider(_))
    }
}

/// A cloud instance identifier, stable for the life of the instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub String);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> InstanceId {
        InstanceId(s.to_string())
    }
}

/// A running (or starting) compute resource.
pub trait Instance: Send + Sync + std::fmt::Debug {
    fn id(&self) -> InstanceId;
    fn dns_name(&self) -> Option<String>;
}

/// Constraints on the hardware an instance should get.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    pub arch: Option<String>,
    pub mem_mb: Option<u64>,
    pub cpu_cores: Option<u32>,
}

/// What the provider actually allocated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareCharacteristics {
    pub arch: Option<String>,
    pub mem_mb: Option<u64>,
    pub cpu_cores: Option<u32>,
}

/// How agents reach the coordination store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateInfo {
    pub addrs: Vec<String>,
}

/// How clients reach the API surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiInfo {
    pub addrs: Vec<String>,
}

/// Everything `start_instance` needs to provision one machine.
#[derive(Debug, Clone)]
pub struct StartInstanceParams {
    /// The topology key of the machine this instance is for.
    pub machine_id: String,
    /// A fresh nonce recorded on the instance, so a machine agent can prove
    /// which provisioning attempt it belongs to.
    pub nonce: String,
    pub series: String,
    pub constraints: Constraints,
    pub state_info: StateInfo,
    pub api_info: ApiInfo,
}

/// A port opened on a machine's firewall.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Port {
    pub protocol: String,
    pub number: u16,
}

/// Provider-backed blob storage, used for the bootstrap state marker among
/// other things.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, name: &str) -> Result<Vec<u8>, Error>;
    async fn put(&self, name: &str, contents: &[u8]) -> Result<(), Error>;
    async fn remove(&self, name: &str) -> Result<(), Error>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// One environment's handle on its cloud provider.
#[async_trait]
pub trait Environ: Send + Sync + std::fmt::Debug {
    /// The environment name.
    fn name(&self) -> String;

    /// A snapshot of the current configuration.  In-flight operations keep
    /// using the snapshot they started with.
    fn config(&self) -> EnvironConfig;

    /// Atomically replace the configuration.
    fn set_config(&self, config: EnvironConfig) -> Result<(), Error>;

    /// Bootstrap the environment.  At most one bootstrap can succeed; the
    /// guard is a state marker in provider storage.
    async fn bootstrap(&self, constraints: &Constraints) -> Result<(), Error>;

    /// How agents reach the coordination store for this environment.
    async fn state_info(&self) -> Result<StateInfo, Error>;

    /// Open a [`drover_state::State`] handle on this environment's
    /// coordination store.
    async fn open_state(&self, log: &Logger) -> Result<drover_state::State, Error>;

    /// Start an instance for a machine.  On success the returned instance's
    /// id is stable and recordable; on failure there is no side effect.
    async fn start_instance(
        &self,
        params: &StartInstanceParams,
    ) -> Result<(Arc<dyn Instance>, HardwareCharacteristics), Error>;

    /// Stop the given instances.  Unknown ids are ignored.
    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), Error>;

    /// Look up instances by id.  The result is index-aligned with `ids`;
    /// instances the provider does not know are `None`.  If none of the ids
    /// are known the call fails with [`Error::NoInstances`].
    async fn instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<Option<Arc<dyn Instance>>>, Error>;

    /// Every instance the provider is running for this environment.
    async fn all_instances(&self) -> Result<Vec<Arc<dyn Instance>>, Error>;

    /// Provider storage private to this environment.
    fn storage(&self) -> Arc<dyn Storage>;

    /// World-readable provider storage (tools, charms).
    fn public_storage(&self) -> Arc<dyn Storage>;

    async fn open_ports(&self, machine_id: &str, ports: &[Port]) -> Result<(), Error>;
    async fn close_ports(&self, machine_id: &str, ports: &[Port]) -> Result<(), Error>;
    async fn ports(&self, machine_id: &str) -> Result<Vec<Port>, Error>;

    /// Tear the environment down entirely.
    async fn destroy(&self) -> Result<(), Error>;
}

/// Convenience alias used throughout the agents.
pub type SharedEnviron = Arc<dyn Environ>;
