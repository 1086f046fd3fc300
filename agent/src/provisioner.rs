// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provisioner: a reconciliation loop that drives the cloud provider
//! toward the machine set recorded in the topology.
//!
//! Each pass of the loop (a "tick") is triggered by a change to either the
//! machine set or the environment configuration; bursts of changes coalesce
//! into a single pass.  A pass reads the world fresh, issues stops before
//! starts to free capacity first, and records every started instance's id
//! back into the topology before moving on.  Instances the provider is
//! running that no machine (and no bootstrap marker) accounts for are
//! reaped; that covers the window where a previous provisioner died between
//! removing a machine from the topology and stopping its instance.
//!
//! An invalid environment configuration does not stop the loop: the last
//! known good configuration continues to serve until an operator fixes
//! things.

use drover_common::backoff::{self, Backoff};
use drover_common::task::{Shutdown, Task};
use drover_provider::{
    load_state, registry, Constraints, EnvironConfig, Error as ProviderError,
    InstanceId, SharedEnviron, StartInstanceParams,
};
use drover_state::{config::Attrs, Life, State, StateError, StoreError, TopologyError};
use slog::{debug, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProvisionerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<StoreError> for ProvisionerError {
    fn from(error: StoreError) -> ProvisionerError {
        ProvisionerError::State(StateError::Store(error))
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Total retry budget for one provider call within one pass.  A machine
    /// whose provisioning exhausts it stays pending and is retried on the
    /// next tick.
    pub retry_total: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> ProvisionerConfig {
        ProvisionerConfig { retry_total: Duration::from_secs(5) }
    }
}

/// Handle on a running provisioner.
pub struct Provisioner {
    task: Task<ProvisionerError>,
}

impl Provisioner {
    /// Start provisioning against the given state.  The environment is
    /// opened from the configuration recorded in the state, once a valid
    /// one is available.
    pub fn new(log: &Logger, state: State, config: ProvisionerConfig) -> Provisioner {
        let inner = Inner {
            log: log.new(o!("component" => "Provisioner")),
            state,
            config,
            environ: None,
            instances: BTreeMap::new(),
        };
        let task = Task::spawn(move |shutdown| inner.run(shutdown));
        Provisioner { task }
    }

    /// Stop the loop, draining any in-flight provider call, and return the
    /// first error it encountered.  Idempotent.
    pub async fn stop(&self) -> Result<(), ProvisionerError> {
        self.task.stop().await
    }

    /// Wait for the loop to exit and return its terminal error.
    pub async fn wait(&self) -> Result<(), ProvisionerError> {
        self.task.wait().await
    }
}

struct Inner {
    log: Logger,
    state: State,
    config: ProvisionerConfig,
    environ: Option<SharedEnviron>,
    /// Instance ids this provisioner started (or adopted from the
    /// topology), by machine key.  Consulted when a machine disappears so
    /// its instance can be stopped without a topology record.
    instances: BTreeMap<String, InstanceId>,
}

impl Inner {
    async fn run(mut self, mut shutdown: Shutdown) -> Result<(), ProvisionerError> {
        let mut machines_rx = self.state.watch_topology();
        let mut environ_rx = self.state.watch_environment();
        info!(self.log, "provisioner starting");

        loop {
            // Process first, then wait: the initial pass reconciles whatever
            // state accumulated while no provisioner was running.
            self.refresh_environ()?;
            if let Some(environ) = self.environ.clone() {
                self.process_machines(&environ, &mut shutdown).await?;
            } else {
                debug!(
                    self.log,
                    "no usable environment configuration; skipping pass"
                );
            }

            tokio::select! {
                changed = machines_rx.changed() => {
                    if changed.is_err() || machines_rx.borrow().closed {
                        return Err(StoreError::Closed.into());
                    }
                }
                changed = environ_rx.changed() => {
                    if changed.is_err() || environ_rx.borrow().closed {
                        return Err(StoreError::Closed.into());
                    }
                }
                _ = shutdown.wait() => {
                    info!(self.log, "provisioner stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Bring `self.environ` in line with the configuration in the state.
    /// An invalid or missing configuration is not fatal: the previous one
    /// stays in service.
    fn refresh_environ(&mut self) -> Result<(), ProvisionerError> {
        let attrs: Attrs = match self.state.environ_config() {
            Ok(node) => node.map(),
            Err(StateError::ConfigNode(
                drover_state::ConfigNodeError::Malformed { message, .. },
            )) => {
                warn!(self.log, "unparsable environment configuration";
                    "error" => message);
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };
        if attrs.is_empty() {
            return Ok(());
        }
        let config = match EnvironConfig::new(attrs) {
            Ok(config) => config,
            Err(error) => {
                warn!(self.log, "invalid environment configuration";
                    "error" => %error);
                return Ok(());
            }
        };
        match &self.environ {
            Some(environ) => {
                if let Err(error) = environ.set_config(config) {
                    warn!(self.log, "cannot update environment configuration";
                        "error" => %error);
                }
            }
            None => match registry::open(&config) {
                Ok(environ) => {
                    info!(self.log, "environment opened";
                        "name" => environ.name());
                    self.environ = Some(environ);
                }
                Err(error) => {
                    warn!(self.log, "cannot open environment"; "error" => %error);
                }
            },
        }
        Ok(())
    }

    /// One reconciliation pass: stops first, then starts.
    async fn process_machines(
        &mut self,
        environ: &SharedEnviron,
        shutdown: &mut Shutdown,
    ) -> Result<(), ProvisionerError> {
        let topology = self.state.topology()?;
        let machines = topology.machines();
        let alive: BTreeMap<&str, _> = machines
            .iter()
            .filter(|m| m.life == Life::Alive)
            .map(|m| (m.key.as_str(), m))
            .collect();

        // Instances the bootstrap owns are never candidates for reaping.
        let bootstrap: BTreeSet<InstanceId> =
            match load_state(environ.storage().as_ref()).await {
                Ok(state) => state.instance_ids().into_iter().collect(),
                Err(ProviderError::NotBootstrapped) => BTreeSet::new(),
                Err(error) => {
                    warn!(self.log, "cannot read bootstrap state";
                        "error" => %error);
                    return Ok(());
                }
            };

        let mut known: BTreeSet<InstanceId> = bootstrap;
        for machine in alive.values() {
            if let Some(id) = &machine.instance_id {
                known.insert(InstanceId(id.clone()));
            }
        }

        // Stop instances for machines that are gone (or no longer alive)
        // but whose instance we remember starting.
        let mut stops: BTreeSet<InstanceId> = BTreeSet::new();
        let stale: Vec<String> = self
            .instances
            .keys()
            .filter(|key| !alive.contains_key(key.as_str()))
            .cloned()
            .collect();
        for key in stale {
            if let Some(id) = self.instances.remove(&key) {
                debug!(self.log, "machine gone; stopping its instance";
                    "machine" => %key, "instance" => %id);
                stops.insert(id);
            }
        }
        for id in self.instances.values() {
            known.insert(id.clone());
        }

        // Reap instances nothing accounts for.  This covers instances
        // orphaned while no provisioner was running.
        match environ.all_instances().await {
            Ok(instances) => {
                for instance in instances {
                    let id = instance.id();
                    if !known.contains(&id) {
                        info!(self.log, "reaping unknown instance";
                            "instance" => %id);
                        stops.insert(id);
                    }
                }
            }
            Err(error) => {
                warn!(self.log, "cannot list instances"; "error" => %error);
            }
        }

        if !stops.is_empty() {
            let ids: Vec<InstanceId> = stops.into_iter().collect();
            if let Err(error) = self
                .retry_provider(shutdown, || environ.stop_instances(&ids))
                .await
            {
                if !error.is_transient() {
                    return Err(error.into());
                }
                warn!(self.log, "cannot stop instances; will retry";
                    "error" => %error);
            }
        }

        // Start instances for machines that need one.
        for (key, machine) in &alive {
            if shutdown.is_stopping() {
                return Ok(());
            }
            if machine.instance_id.is_some() || self.instances.contains_key(*key)
            {
                continue;
            }
            match self.start_machine(environ, key, shutdown).await {
                Ok(instance_id) => {
                    self.instances.insert(key.to_string(), instance_id);
                }
                Err(ProvisionerError::Provider(error))
                    if error.is_transient() =>
                {
                    warn!(self.log, "cannot start instance; machine stays pending";
                        "machine" => %key, "error" => %error);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn start_machine(
        &self,
        environ: &SharedEnviron,
        machine_key: &str,
        shutdown: &mut Shutdown,
    ) -> Result<InstanceId, ProvisionerError> {
        let state_info = environ.state_info().await?;
        let params = StartInstanceParams {
            machine_id: machine_key.to_string(),
            nonce: format!("{}:{}", machine_key, Uuid::new_v4()),
            series: environ.config().default_series().to_string(),
            constraints: Constraints::default(),
            state_info,
            api_info: Default::default(),
        };
        let (instance, _) = self
            .retry_provider(shutdown, || environ.start_instance(&params))
            .await?;
        let instance_id = instance.id();
        info!(self.log, "started instance";
            "machine" => machine_key, "instance" => %instance_id);

        match self
            .state
            .set_instance_id(machine_key, Some(instance_id.0.clone()))
        {
            Ok(()) => {}
            Err(StateError::Topology(TopologyError::MachineNotFound(_))) => {
                // The machine vanished while we were starting its instance.
                // The instance is now unaccounted for; the next pass reaps
                // it.
                warn!(self.log, "machine removed while starting its instance";
                    "machine" => machine_key, "instance" => %instance_id);
            }
            Err(error) => return Err(error.into()),
        }
        Ok(instance_id)
    }

    /// Run one provider call with the bounded per-pass retry budget.
    /// A stop request abandons further retries.
    async fn retry_provider<T, F, Fut>(
        &self,
        shutdown: &mut Shutdown,
        mut call: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut policy =
            backoff::retry_policy_provider_bounded(self.config.retry_total);
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => {
                    // None means the budget is spent; the machine stays
                    // pending for the next tick.
                    let Some(delay) = policy.next_backoff() else {
                        return Err(error);
                    };
                    debug!(self.log, "provider call failed; backing off";
                        "delay" => ?delay, "error" => %error);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => return Err(error),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}
