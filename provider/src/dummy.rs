// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dummy provider: an in-process cloud for the test suites.
//!
//! Each environment name maps to one shared in-memory "cloud" for the life
//! of the process (until [`reset`]), so that a provisioner, a CLI command,
//! and a test harness all opening `"testing"` observe the same instances
//! and the same coordination store.  Every provider operation is mirrored
//! onto an observer channel ([`listen`]) so tests can assert exactly what
//! the provider was asked to do, in order.

use crate::config::EnvironConfig;
use crate::storage::{load_state, remove_state, save_state, BootstrapState, MemStorage};
use crate::{
    registry, Constraints, Environ, Error, HardwareCharacteristics, Instance,
    InstanceId, Port, StartInstanceParams, StateInfo, Storage,
};
use async_trait::async_trait;
use drover_state::{State, Store};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, Mutex};
use tokio::sync::mpsc;

/// One recorded provider operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Bootstrap {
        env: String,
    },
    StartInstance {
        env: String,
        machine_id: String,
        instance_id: InstanceId,
        nonce: String,
        series: String,
        state_info: StateInfo,
    },
    StopInstances {
        env: String,
        ids: Vec<InstanceId>,
    },
    OpenPorts {
        env: String,
        machine_id: String,
        ports: Vec<Port>,
    },
    ClosePorts {
        env: String,
        machine_id: String,
        ports: Vec<Port>,
    },
    Destroy {
        env: String,
    },
}

struct DummyInstance {
    id: InstanceId,
}

impl std::fmt::Debug for DummyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyInstance").field("id", &self.id).finish()
    }
}

impl Instance for DummyInstance {
    fn id(&self) -> InstanceId {
        self.id.clone()
    }

    fn dns_name(&self) -> Option<String> {
        Some(format!("{}.dummy", self.id))
    }
}

struct Inner {
    broken: bool,
    next_id: u64,
    instances: BTreeMap<InstanceId, Arc<DummyInstance>>,
    ports: BTreeMap<String, BTreeSet<Port>>,
    ops: Option<mpsc::UnboundedSender<Op>>,
}

struct Shared {
    name: String,
    store: Store,
    storage: Arc<MemStorage>,
    public_storage: Arc<MemStorage>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn record(&self, op: Op) {
        let mut inner = self.inner.lock().unwrap();
        let observer_gone = match &inner.ops {
            Some(ops) => ops.send(op).is_err(),
            None => false,
        };
        if observer_gone {
            inner.ops = None;
        }
    }
}

static ENVIRONS: LazyLock<Mutex<BTreeMap<String, Arc<Shared>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

fn discard_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

fn shared(name: &str) -> Arc<Shared> {
    let mut environs = ENVIRONS.lock().unwrap();
    Arc::clone(environs.entry(name.to_string()).or_insert_with(|| {
        Arc::new(Shared {
            name: name.to_string(),
            store: Store::new(discard_logger()),
            storage: Arc::new(MemStorage::new()),
            public_storage: Arc::new(MemStorage::new()),
            inner: Mutex::new(Inner {
                broken: false,
                next_id: 0,
                instances: BTreeMap::new(),
                ports: BTreeMap::new(),
                ops: None,
            }),
        })
    }))
}

/// Register the dummy provider under the type name `"dummy"`.
pub fn register() {
    registry::register("dummy", |config| {
        Ok(Arc::new(DummyEnviron::new(config)) as Arc<dyn Environ>)
    });
}

/// Forget every dummy environment.  Call between tests.
pub fn reset() {
    ENVIRONS.lock().unwrap().clear();
}

/// Observe every operation performed against the named environment from now
/// on.  A second call replaces the previous observer.
pub fn listen(env_name: &str) -> mpsc::UnboundedReceiver<Op> {
    let (tx, rx) = mpsc::unbounded_channel();
    shared(env_name).inner.lock().unwrap().ops = Some(tx);
    rx
}

/// Make (or unmake) the named environment's provider calls fail, to
/// exercise retry paths.
pub fn set_broken(env_name: &str, broken: bool) {
    shared(env_name).inner.lock().unwrap().broken = broken;
}

pub struct DummyEnviron {
    config: Mutex<EnvironConfig>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DummyEnviron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyEnviron").field("name", &self.shared.name).finish()
    }
}

impl DummyEnviron {
    pub fn new(config: EnvironConfig) -> DummyEnviron {
        let shared = shared(config.name());
        DummyEnviron { config: Mutex::new(config), shared }
    }

    fn check_broken(&self, operation: &str) -> Result<(), Error> {
        if self.shared.inner.lock().unwrap().broken {
            return Err(Error::Provider(format!(
                "dummy environment {:?} is broken: {} failed",
                self.shared.name, operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Environ for DummyEnviron {
    fn name(&self) -> String {
        self.shared.name.clone()
    }

    fn config(&self) -> EnvironConfig {
        self.config.lock().unwrap().clone()
    }

    fn set_config(&self, config: EnvironConfig) -> Result<(), Error> {
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    async fn bootstrap(&self, _constraints: &Constraints) -> Result<(), Error> {
        self.check_broken("bootstrap")?;
        match load_state(self.shared.storage.as_ref()).await {
            Ok(_) => return Err(Error::AlreadyBootstrapped),
            Err(Error::NotBootstrapped) => {}
            Err(error) => return Err(error),
        }
        let instance = {
            let mut inner = self.shared.inner.lock().unwrap();
            let id = InstanceId(format!("i-{}", inner.next_id));
            inner.next_id += 1;
            let instance = Arc::new(DummyInstance { id: id.clone() });
            inner.instances.insert(id, Arc::clone(&instance));
            instance
        };
        save_state(
            self.shared.storage.as_ref(),
            &BootstrapState { state_instances: vec![instance.id().0] },
        )
        .await?;
        self.shared.record(Op::Bootstrap { env: self.shared.name.clone() });
        Ok(())
    }

    async fn state_info(&self) -> Result<StateInfo, Error> {
        Ok(StateInfo {
            addrs: vec![format!("{}.dummy.local:37017", self.shared.name)],
        })
    }

    async fn open_state(&self, log: &Logger) -> Result<State, Error> {
        Ok(State::new(log, self.shared.store.clone()))
    }

    async fn start_instance(
        &self,
        params: &StartInstanceParams,
    ) -> Result<(Arc<dyn Instance>, HardwareCharacteristics), Error> {
        self.check_broken("start_instance")?;
        let instance = {
            let mut inner = self.shared.inner.lock().unwrap();
            let id = InstanceId(format!("i-{}", inner.next_id));
            inner.next_id += 1;
            let instance = Arc::new(DummyInstance { id: id.clone() });
            inner.instances.insert(id, Arc::clone(&instance));
            instance
        };
        self.shared.record(Op::StartInstance {
            env: self.shared.name.clone(),
            machine_id: params.machine_id.clone(),
            instance_id: instance.id(),
            nonce: params.nonce.clone(),
            series: params.series.clone(),
            state_info: params.state_info.clone(),
        });
        Ok((instance, HardwareCharacteristics::default()))
    }

    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), Error> {
        self.check_broken("stop_instances")?;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            for id in ids {
                inner.instances.remove(id);
            }
        }
        self.shared.record(Op::StopInstances {
            env: self.shared.name.clone(),
            ids: ids.to_vec(),
        });
        Ok(())
    }

    async fn instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<Option<Arc<dyn Instance>>>, Error> {
        let inner = self.shared.inner.lock().unwrap();
        let found: Vec<Option<Arc<dyn Instance>>> = ids
            .iter()
            .map(|id| {
                inner
                    .instances
                    .get(id)
                    .map(|i| Arc::clone(i) as Arc<dyn Instance>)
            })
            .collect();
        if !ids.is_empty() && found.iter().all(Option::is_none) {
            return Err(Error::NoInstances);
        }
        Ok(found)
    }

    async fn all_instances(&self) -> Result<Vec<Arc<dyn Instance>>, Error> {
        let inner = self.shared.inner.lock().unwrap();
        Ok(inner
            .instances
            .values()
            .map(|i| Arc::clone(i) as Arc<dyn Instance>)
            .collect())
    }

    fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.shared.storage) as Arc<dyn Storage>
    }

    fn public_storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.shared.public_storage) as Arc<dyn Storage>
    }

    async fn open_ports(&self, machine_id: &str, ports: &[Port]) -> Result<(), Error> {
        self.check_broken("open_ports")?;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner
                .ports
                .entry(machine_id.to_string())
                .or_default()
                .extend(ports.iter().cloned());
        }
        self.shared.record(Op::OpenPorts {
            env: self.shared.name.clone(),
            machine_id: machine_id.to_string(),
            ports: ports.to_vec(),
        });
        Ok(())
    }

    async fn close_ports(&self, machine_id: &str, ports: &[Port]) -> Result<(), Error> {
        self.check_broken("close_ports")?;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if let Some(open) = inner.ports.get_mut(machine_id) {
                for port in ports {
                    open.remove(port);
                }
            }
        }
        self.shared.record(Op::ClosePorts {
            env: self.shared.name.clone(),
            machine_id: machine_id.to_string(),
            ports: ports.to_vec(),
        });
        Ok(())
    }

    async fn ports(&self, machine_id: &str) -> Result<Vec<Port>, Error> {
        let inner = self.shared.inner.lock().unwrap();
        Ok(inner
            .ports
            .get(machine_id)
            .map(|ports| ports.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn destroy(&self) -> Result<(), Error> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.instances.clear();
            inner.ports.clear();
        }
        remove_state(self.shared.storage.as_ref()).await?;
        self.shared.record(Op::Destroy { env: self.shared.name.clone() });
        Ok(())
    }
}
