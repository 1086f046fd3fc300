// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The uniter: the agent loop that runs one unit's charm.
//!
//! Exactly one charm hook runs at a time for a given unit.  Relation hooks
//! arrive on a single fan-in channel fed by every relationer's queue;
//! lifecycle hooks (`install`, `config-changed`, `start`, `upgrade-charm`,
//! `stop`) are derived from watchers on the unit, its service's
//! configuration, and its service's charm URL, and are queued rather than
//! preempting anything.
//!
//! A failed charm hook is fatal to the unit's forward progress: its status
//! becomes `error` and no further hooks run until an operator resolves it,
//! either retrying the hook or skipping it.
//!
//! On startup the uniter recovers from a crash between hook prepare and
//! hook commit: a durable pending marker is surfaced before anything else,
//! and the configurable [`RecoveryPolicy`] decides whether the marked hook
//! is re-run or counted as complete.

use camino::Utf8PathBuf;
use drover_common::task::{Shutdown, Task};
use drover_state::{ResolvedMode, State, StateError, StoreError, UnitStatus};
use slog::{info, o, warn, Logger};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod context;
pub mod hook;
pub mod queue;
pub mod relation_state;
pub mod relationer;
pub mod tools;

use hook::{HookInfo, HookKind, RelationHook};
use relation_state::{PendingHook, RelationState, RelationStateError};
use relationer::{PresenceConfig, Relationer, RelationerError};
use tools::ToolsError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum UniterError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Relationer(#[from] RelationerError),

    #[error(transparent)]
    RelationState(#[from] RelationStateError),

    #[error(transparent)]
    Tools(#[from] ToolsError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("hook {name:?} failed")]
    HookFailed { name: String },
}

impl From<StoreError> for UniterError {
    fn from(error: StoreError) -> UniterError {
        UniterError::State(StateError::Store(error))
    }
}

impl From<std::io::Error> for UniterError {
    fn from(error: std::io::Error) -> UniterError {
        UniterError::Io(error.to_string())
    }
}

/// What to do with a pending hook marker found during recovery.
///
/// The safe default is to re-run the hook: charms are expected to make
/// their hooks idempotent, and re-running loses nothing.  Marking it
/// complete instead means the charm may never observe that hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    #[default]
    RerunPending,
    MarkComplete,
}

#[derive(Debug, Clone)]
pub struct UniterConfig {
    pub unit_name: String,
    /// The agent's data directory: tool symlinks and durable relation
    /// state live here.
    pub data_dir: Utf8PathBuf,
    /// The unpacked charm; hooks are at `<charm_dir>/hooks/<name>`.
    pub charm_dir: Utf8PathBuf,
    pub recovery: RecoveryPolicy,
    pub presence: PresenceConfig,
}

/// Handle on a running uniter.
pub struct Uniter {
    task: Task<UniterError>,
}

impl Uniter {
    pub fn new(log: &Logger, state: State, config: UniterConfig) -> Uniter {
        let (hooks_tx, hooks_rx) = mpsc::channel(1);
        let inner = Inner {
            log: log.new(o!(
                "component" => "Uniter",
                "unit" => config.unit_name.clone(),
            )),
            state,
            config,
            relationers: BTreeMap::new(),
            hooks_tx,
            lifecycle: VecDeque::new(),
        };
        let task = Task::spawn(move |shutdown| inner.run(hooks_rx, shutdown));
        Uniter { task }
    }

    pub async fn stop(&self) -> Result<(), UniterError> {
        self.task.stop().await
    }

    pub async fn wait(&self) -> Result<(), UniterError> {
        self.task.wait().await
    }
}

/// Outcome of running one hook, as far as the loop is concerned.
enum Outcome {
    Ran,
    StopRequested,
}

struct Inner {
    log: Logger,
    state: State,
    config: UniterConfig,
    relationers: BTreeMap<String, Relationer>,
    /// Kept so the fan-in channel never closes while relationers come and
    /// go.
    hooks_tx: mpsc::Sender<RelationHook>,
    /// Queued lifecycle hooks, run between relation hooks.
    lifecycle: VecDeque<&'static str>,
}

impl Inner {
    async fn run(
        mut self,
        hooks_rx: mpsc::Receiver<RelationHook>,
        mut shutdown: Shutdown,
    ) -> Result<(), UniterError> {
        let result = self.run_inner(hooks_rx, &mut shutdown).await;
        self.teardown().await;
        result
    }

    async fn run_inner(
        &mut self,
        mut hooks_rx: mpsc::Receiver<RelationHook>,
        shutdown: &mut Shutdown,
    ) -> Result<(), UniterError> {
        info!(self.log, "uniter starting");
        self.ensure_filesystem()?;
        self.open_relationers()?;

        // Crash recovery comes before anything else: a hook that was
        // prepared but never committed is the first thing surfaced.
        if let Outcome::StopRequested = self.recover_pending(shutdown).await? {
            return Ok(());
        }

        // install → config-changed → start, with install and start running
        // once per unit ever (durable markers).
        if !self.marker_exists("installed") {
            if let Outcome::StopRequested =
                self.run_lifecycle_hook("install", shutdown).await?
            {
                return Ok(());
            }
            self.write_marker("installed")?;
            self.state
                .set_unit_status(&self.config.unit_name, &UnitStatus::Installed)?;
        }
        if let Outcome::StopRequested =
            self.run_lifecycle_hook("config-changed", shutdown).await?
        {
            return Ok(());
        }
        if !self.marker_exists("started") {
            if let Outcome::StopRequested =
                self.run_lifecycle_hook("start", shutdown).await?
            {
                return Ok(());
            }
            self.write_marker("started")?;
        }
        self.state
            .set_unit_status(&self.config.unit_name, &UnitStatus::Started)?;

        for relationer in self.relationers.values_mut() {
            relationer.start_hooks()?;
        }

        let service = drover_state::service_of_unit(&self.config.unit_name);
        let mut config_rx = self.state.watch_service_config(service)?;
        let mut charm_rx = self.state.watch_service_charm(service)?;
        let mut life_rx = self.state.watch_unit_life(&self.config.unit_name);
        config_rx.mark_unchanged();
        charm_rx.mark_unchanged();
        life_rx.mark_unchanged();

        loop {
            while let Some(name) = self.lifecycle.pop_front() {
                if let Outcome::StopRequested =
                    self.run_lifecycle_hook(name, shutdown).await?
                {
                    return Ok(());
                }
            }

            tokio::select! {
                received = hooks_rx.recv() => {
                    let Some(relation_hook) = received else {
                        return Ok(());
                    };
                    if let Outcome::StopRequested =
                        self.run_relation_hook(relation_hook, shutdown).await?
                    {
                        return Ok(());
                    }
                }
                changed = config_rx.changed() => {
                    if changed.is_err() || config_rx.borrow().closed {
                        return Err(StoreError::Closed.into());
                    }
                    self.queue_lifecycle("config-changed");
                }
                changed = charm_rx.changed() => {
                    if changed.is_err() || charm_rx.borrow().closed {
                        return Err(StoreError::Closed.into());
                    }
                    self.queue_lifecycle("upgrade-charm");
                }
                changed = life_rx.changed() => {
                    if changed.is_err() || life_rx.borrow().closed {
                        return Err(StoreError::Closed.into());
                    }
                    let dying = life_rx.borrow().contents.as_deref()
                        == Some("dying");
                    if dying {
                        info!(self.log, "unit is dying");
                        let _ = self
                            .run_lifecycle_hook("stop", shutdown)
                            .await?;
                        self.state.set_unit_status(
                            &self.config.unit_name,
                            &UnitStatus::Stopped,
                        )?;
                        return Ok(());
                    }
                }
                _ = shutdown.wait() => {
                    info!(self.log, "uniter stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn teardown(&mut self) {
        for relationer in self.relationers.values_mut() {
            if let Err(error) = relationer.stop_hooks().await {
                warn!(self.log, "cannot stop relation hooks"; "error" => %error);
            }
            if let Err(error) = relationer.abandon().await {
                warn!(self.log, "cannot abandon relation"; "error" => %error);
            }
        }
    }

    fn ensure_filesystem(&self) -> Result<(), UniterError> {
        let tools = tools::tools_dir(&self.config.data_dir, &self.config.unit_name);
        std::fs::create_dir_all(&tools)?;
        // The jujuc multiplexer is normally deployed alongside the agent
        // binary; make sure something is there for the symlinks to point
        // at.
        let jujuc = tools.join("jujuc");
        if !jujuc.exists() {
            std::fs::write(&jujuc, b"#!/bin/sh\nexit 0\n")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    &jujuc,
                    std::fs::Permissions::from_mode(0o755),
                )?;
            }
        }
        tools::ensure_tools(&self.config.data_dir, &self.config.unit_name)?;
        std::fs::create_dir_all(self.state_dir())?;
        Ok(())
    }

    fn state_dir(&self) -> Utf8PathBuf {
        self.config
            .data_dir
            .join("state")
            .join(format!("unit-{}", self.config.unit_name.replace('/', "-")))
    }

    fn marker_exists(&self, name: &str) -> bool {
        self.state_dir().join(name).exists()
    }

    fn write_marker(&self, name: &str) -> Result<(), UniterError> {
        std::fs::write(self.state_dir().join(name), b"")?;
        Ok(())
    }

    fn open_relationers(&mut self) -> Result<(), UniterError> {
        let relations = self.state.unit_relations(&self.config.unit_name)?;
        for (relation_key, _endpoint) in relations {
            let ru = self
                .state
                .relation_unit(&relation_key, &self.config.unit_name)?;
            let dir = self.state_dir().join("relations").join(&relation_key);
            let relation_state = RelationState::load(&dir)?;
            let mut relationer = Relationer::new(
                &self.log,
                ru,
                relation_state,
                self.config.presence.clone(),
                self.hooks_tx.clone(),
            );
            relationer.join();
            self.relationers.insert(relation_key, relationer);
        }
        Ok(())
    }

    /// Surface any pending hook markers left by a crash, per the
    /// configured policy.
    async fn recover_pending(
        &mut self,
        shutdown: &mut Shutdown,
    ) -> Result<Outcome, UniterError> {
        let pending: Vec<(String, PendingHook)> = self
            .relationers
            .iter()
            .filter_map(|(key, relationer)| {
                relationer
                    .relation_state()
                    .pending()
                    .map(|pending| (key.clone(), pending.clone()))
            })
            .collect();

        for (relation_key, pending) in pending {
            match self.config.recovery {
                RecoveryPolicy::MarkComplete => {
                    info!(self.log, "marking recovered hook complete";
                        "relation" => %relation_key,
                        "kind" => %pending.kind);
                    let relationer = self
                        .relationers
                        .get_mut(&relation_key)
                        .expect("relationer exists; we just listed it");
                    let info = recovered_hook_info(
                        relationer.relation_state(),
                        &pending,
                    );
                    relationer.commit_hook(&info)?;
                }
                RecoveryPolicy::RerunPending => {
                    info!(self.log, "re-running recovered hook";
                        "relation" => %relation_key,
                        "kind" => %pending.kind);
                    let info = {
                        let relationer = self
                            .relationers
                            .get(&relation_key)
                            .expect("relationer exists; we just listed it");
                        recovered_hook_info(relationer.relation_state(), &pending)
                    };
                    let relation_hook =
                        RelationHook { relation_key, info };
                    if let Outcome::StopRequested =
                        self.run_relation_hook(relation_hook, shutdown).await?
                    {
                        return Ok(Outcome::StopRequested);
                    }
                }
            }
        }
        Ok(Outcome::Ran)
    }

    fn queue_lifecycle(&mut self, name: &'static str) {
        if !self.lifecycle.contains(&name) {
            self.lifecycle.push_back(name);
        }
    }

    async fn run_lifecycle_hook(
        &mut self,
        name: &str,
        shutdown: &mut Shutdown,
    ) -> Result<Outcome, UniterError> {
        let env = self.base_env();
        self.execute_resolving(name, env, None, shutdown).await
    }

    async fn run_relation_hook(
        &mut self,
        relation_hook: RelationHook,
        shutdown: &mut Shutdown,
    ) -> Result<Outcome, UniterError> {
        let RelationHook { relation_key, info } = relation_hook;
        let Some(relationer) = self.relationers.get_mut(&relation_key) else {
            warn!(self.log, "hook for unknown relation dropped";
                "relation" => %relation_key);
            return Ok(Outcome::Ran);
        };
        let name = relationer.prepare_hook(&info)?;
        let relation_name = relationer.context().relation_name().to_string();
        let mut env = self.base_env();
        env.push(("JUJU_RELATION".to_string(), relation_name));
        env.push(("JUJU_REMOTE_UNIT".to_string(), info.remote_unit.clone()));
        self.execute_resolving(&name, env, Some((relation_key, info)), shutdown)
            .await
    }

    /// Run one hook, holding the unit in the error state (and off the hook
    /// treadmill) until the operator resolves any failure.
    async fn execute_resolving(
        &mut self,
        name: &str,
        env: Vec<(String, String)>,
        relation: Option<(String, HookInfo)>,
        shutdown: &mut Shutdown,
    ) -> Result<Outcome, UniterError> {
        loop {
            match self.exec_hook(name, &env).await {
                Ok(()) => {
                    if let Some((relation_key, info)) = &relation {
                        let relationer = self
                            .relationers
                            .get_mut(relation_key)
                            .expect("relationer outlives its hooks");
                        relationer.commit_hook(info)?;
                    }
                    return Ok(Outcome::Ran);
                }
                Err(UniterError::HookFailed { .. }) => {
                    warn!(self.log, "hook failed"; "hook" => %name);
                    self.state.set_unit_status(
                        &self.config.unit_name,
                        &UnitStatus::Error(format!("hook failed: {:?}", name)),
                    )?;
                    match self.await_resolution(shutdown).await? {
                        Resolution::Retry => {
                            info!(self.log, "re-running failed hook";
                                "hook" => %name);
                            continue;
                        }
                        Resolution::Skip => {
                            info!(self.log, "skipping failed hook";
                                "hook" => %name);
                            if let Some((relation_key, info)) = &relation {
                                let relationer = self
                                    .relationers
                                    .get_mut(relation_key)
                                    .expect("relationer outlives its hooks");
                                relationer.commit_hook(info)?;
                            }
                            self.state.set_unit_status(
                                &self.config.unit_name,
                                &UnitStatus::Started,
                            )?;
                            return Ok(Outcome::Ran);
                        }
                        Resolution::StopRequested => {
                            return Ok(Outcome::StopRequested);
                        }
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Block until the operator marks the unit resolved (or we are asked
    /// to stop).
    async fn await_resolution(
        &mut self,
        shutdown: &mut Shutdown,
    ) -> Result<Resolution, UniterError> {
        let mut resolved_rx = self.state.watch_resolved(&self.config.unit_name);
        loop {
            if let Some(mode) = self.state.resolved(&self.config.unit_name)? {
                self.state.clear_resolved(&self.config.unit_name)?;
                self.state.set_unit_status(
                    &self.config.unit_name,
                    &UnitStatus::Started,
                )?;
                return Ok(match mode {
                    ResolvedMode::Retry => Resolution::Retry,
                    ResolvedMode::Skip => Resolution::Skip,
                });
            }
            tokio::select! {
                changed = resolved_rx.changed() => {
                    if changed.is_err() || resolved_rx.borrow().closed {
                        return Err(StoreError::Closed.into());
                    }
                }
                _ = shutdown.wait() => return Ok(Resolution::StopRequested),
            }
        }
    }

    fn base_env(&self) -> Vec<(String, String)> {
        let tools =
            tools::tools_dir(&self.config.data_dir, &self.config.unit_name);
        let path = match std::env::var("PATH") {
            Ok(path) => format!("{}:{}", tools, path),
            Err(_) => tools.to_string(),
        };
        vec![
            ("JUJU_UNIT_NAME".to_string(), self.config.unit_name.clone()),
            (
                "JUJU_CONTEXT_ID".to_string(),
                format!("{}:{}", self.config.unit_name, Uuid::new_v4()),
            ),
            ("PATH".to_string(), path),
        ]
    }

    /// Run the named hook from the charm.  A charm that does not provide
    /// the hook is not an error.
    async fn exec_hook(
        &self,
        name: &str,
        env: &[(String, String)],
    ) -> Result<(), UniterError> {
        let path = self.config.charm_dir.join("hooks").join(name);
        if !path.exists() {
            return Ok(());
        }
        info!(self.log, "running hook"; "hook" => %name);
        let status = tokio::process::Command::new(&path)
            .current_dir(&self.config.charm_dir)
            .envs(env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .status()
            .await?;
        if !status.success() {
            return Err(UniterError::HookFailed { name: name.to_string() });
        }
        Ok(())
    }
}

enum Resolution {
    Retry,
    Skip,
    StopRequested,
}

/// Reconstruct the hook info for a recovered pending marker.  The members
/// snapshot is rebuilt from the durable record; settings snapshots are not
/// persisted, so the recovered hook sees empty ones.
fn recovered_hook_info(state: &RelationState, pending: &PendingHook) -> HookInfo {
    let mut members: BTreeMap<String, u64> = state.members().clone();
    match pending.kind {
        HookKind::Joined | HookKind::Changed => {
            members.insert(pending.unit.clone(), pending.change_version);
        }
        HookKind::Departed => {
            members.remove(&pending.unit);
        }
        HookKind::Broken => {}
    }
    HookInfo {
        kind: pending.kind,
        remote_unit: pending.unit.clone(),
        change_version: pending.change_version,
        members,
        settings: BTreeMap::new(),
    }
}
