// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The relationer: the per-relation controller a uniter owns for each
//! relation its unit participates in.
//!
//! It wires together presence (a pinger), the hook queue, the durable
//! relation state, and the charm-facing context.  The legal state machine
//! is `detached → joined → watching → joined → detached`; transitions
//! outside that order are programmer errors and panic.

use super::context::RelationContext;
use super::hook::{HookInfo, RelationHook};
use super::queue::HookQueue;
use super::relation_state::{RelationState, RelationStateError};
use drover_state::presence::Pinger;
use drover_state::{RelationUnit, StoreError};
use slog::{info, o, Logger};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelationerError {
    #[error(transparent)]
    State(#[from] RelationStateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Presence timing for a relationer's pinger.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub period: Duration,
    pub timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> PresenceConfig {
        PresenceConfig {
            period: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct Relationer {
    log: Logger,
    ru: RelationUnit,
    state: RelationState,
    ctx: RelationContext,
    presence: PresenceConfig,
    pinger: Option<Pinger>,
    queue: Option<HookQueue>,
    hooks: mpsc::Sender<RelationHook>,
}

impl Relationer {
    /// Create a relationer.  The unit does not join the relation until
    /// explicitly requested.
    pub fn new(
        log: &Logger,
        ru: RelationUnit,
        state: RelationState,
        presence: PresenceConfig,
        hooks: mpsc::Sender<RelationHook>,
    ) -> Relationer {
        let ctx = RelationContext::new(ru.relation_name());
        Relationer {
            log: log.new(o!(
                "component" => "Relationer",
                "relation" => ru.relation_key().to_string(),
            )),
            ru,
            state,
            ctx,
            presence,
            pinger: None,
            queue: None,
            hooks,
        }
    }

    pub fn context(&self) -> &RelationContext {
        &self.ctx
    }

    pub fn relation_state(&self) -> &RelationState {
        &self.state
    }

    /// Begin periodically asserting this unit's presence in the relation.
    /// Calling `join` while already joined is a programmer error.
    pub fn join(&mut self) {
        if self.pinger.is_some() {
            panic!("unit already joined relation {}", self.ru.relation_key());
        }
        info!(self.log, "joining relation");
        self.pinger =
            Some(self.ru.join(self.presence.period, self.presence.timeout));
    }

    /// Stop asserting presence; it lapses after the server-side timeout.
    /// Does not emit a departed locally.  A no-op when not joined.
    pub async fn abandon(&mut self) -> Result<(), RelationerError> {
        if self.queue.is_some() {
            panic!("cannot abandon a relation while hooks are running");
        }
        if let Some(pinger) = self.pinger.take() {
            info!(self.log, "abandoning relation");
            pinger.stop().await?;
        }
        Ok(())
    }

    /// Immediately withdraw presence and tear down local state.
    pub async fn depart(&mut self) -> Result<(), RelationerError> {
        if self.queue.is_some() {
            panic!("cannot depart a relation while hooks are running");
        }
        if let Some(pinger) = self.pinger.take() {
            pinger.stop().await?;
        }
        info!(self.log, "departing relation");
        self.ru.depart()?;
        Ok(())
    }

    /// Start watching the relation and sending hook infos on the shared
    /// hooks channel.  Panics if hooks are already running or the unit has
    /// not joined.
    pub fn start_hooks(&mut self) -> Result<(), RelationerError> {
        if self.queue.is_some() {
            panic!(
                "hooks already started for relation {}",
                self.ru.relation_key()
            );
        }
        if self.pinger.is_none() {
            panic!(
                "cannot watch relation {} before joining it",
                self.ru.relation_key()
            );
        }
        let watch = self.ru.watch()?;
        self.queue = Some(HookQueue::new(
            &self.log,
            self.ru.relation_key(),
            self.state.members().clone(),
            watch,
            self.hooks.clone(),
        ));
        Ok(())
    }

    /// Stop watching the relation.  A no-op when hooks are not running.
    pub async fn stop_hooks(&mut self) -> Result<(), RelationerError> {
        if let Some(queue) = self.queue.take() {
            queue.stop().await?;
        }
        Ok(())
    }

    /// Check that `info` may fire now, durably record it as pending, and
    /// expose its snapshot to the charm context.  Returns the hook name to
    /// run (`<relation>-relation-<kind>`).
    pub fn prepare_hook(
        &mut self,
        info: &HookInfo,
    ) -> Result<String, RelationerError> {
        // prepare() revalidates the ordering rules before anything durable
        // happens.
        self.state.prepare(info)?;
        self.ctx.set_members(info);
        Ok(format!("{}-relation-{}", self.ru.relation_name(), info.kind))
    }

    /// Persist the fact of the hook's completion.
    pub fn commit_hook(&mut self, info: &HookInfo) -> Result<(), RelationerError> {
        self.state.commit(info)?;
        Ok(())
    }

    /// Clear a recovered pending marker without running it, per the
    /// mark-complete recovery policy.
    pub fn discard_pending(&mut self) -> Result<(), RelationerError> {
        self.state.clear_pending()?;
        Ok(())
    }
}
