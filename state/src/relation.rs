// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One unit's view of one relation: presence, settings, and membership
//! snapshots.
//!
//! Everything a relation's members share lives under
//! `/relations/<key>/`: a presence node and a settings node per unit, and a
//! `life` node that flips to `dying` when the relation is being destroyed.
//! [`RelationUnit::watch`] runs a task that folds all of that into a stream
//! of [`RelationSnapshot`]s — coalesced value snapshots, not deltas, so a
//! consumer that falls behind sees eventual state rather than a replay.

use crate::config::Attrs;
use crate::presence::{self, Pinger};
use crate::store::{Store, StoreError, Version};
use drover_common::task::Task;
use slog::{o, Logger};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

/// What a unit knows about one remote member.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteUnit {
    /// Change version of the member's settings; increases on every write.
    pub version: u64,
    /// The member's settings as of the snapshot.
    pub settings: Attrs,
}

/// A coalesced view of a relation's membership.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationSnapshot {
    /// Remote units currently present, keyed by unit name.
    pub members: BTreeMap<String, RemoteUnit>,
    /// Whether the relation itself is being destroyed.
    pub dying: bool,
}

/// A unit's handle on one relation it participates in.
#[derive(Clone)]
pub struct RelationUnit {
    log: Logger,
    store: Store,
    relation_key: String,
    relation_name: String,
    unit_name: String,
}

impl RelationUnit {
    pub fn new(
        log: &Logger,
        store: Store,
        relation_key: &str,
        relation_name: &str,
        unit_name: &str,
    ) -> RelationUnit {
        RelationUnit {
            log: log.new(o!(
                "component" => "RelationUnit",
                "relation" => relation_key.to_string(),
                "unit" => unit_name.to_string(),
            )),
            store,
            relation_key: relation_key.to_string(),
            relation_name: relation_name.to_string(),
            unit_name: unit_name.to_string(),
        }
    }

    pub fn relation_key(&self) -> &str {
        &self.relation_key
    }

    /// The relation name as used in hook names
    /// (`<relation>-relation-<kind>`).
    pub fn relation_name(&self) -> &str {
        &self.relation_name
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    fn base(&self) -> String {
        format!("/relations/{}/", self.relation_key)
    }

    fn presence_path(&self, unit: &str) -> String {
        format!("{}presence/{}", self.base(), unit)
    }

    fn settings_path(&self, unit: &str) -> String {
        format!("{}settings/{}", self.base(), unit)
    }

    fn life_path(&self) -> String {
        format!("{}life", self.base())
    }

    /// Start asserting this unit's presence in the relation.
    pub fn join(&self, period: Duration, timeout: Duration) -> Pinger {
        Pinger::start(
            &self.log,
            self.store.clone(),
            &self.presence_path(&self.unit_name),
            period,
            timeout,
        )
    }

    /// Immediately withdraw this unit's presence, rather than letting it
    /// lapse.  Safe to call whether or not a presence node exists.
    pub fn depart(&self) -> Result<(), StoreError> {
        self.store
            .retry_change(&self.presence_path(&self.unit_name), |_| {
                Ok::<_, StoreError>(None)
            })
            .map(|_| ())
    }

    /// Write this unit's relation settings, returning the new change
    /// version.
    pub fn write_settings(&self, attrs: &Attrs) -> Result<Version, StoreError> {
        let contents = serde_yaml::to_string(attrs)
            .expect("attribute maps always serialize");
        self.store.retry_change(
            &self.settings_path(&self.unit_name),
            move |_| Ok::<_, StoreError>(Some(contents.clone())),
        )
    }

    /// Read a member's settings and their change version.  A member that
    /// has never written settings reads as empty at version zero.
    pub fn settings(&self, unit: &str) -> Result<(Attrs, Version), StoreError> {
        let (contents, version) = self.store.read(&self.settings_path(unit))?;
        let attrs = contents
            .as_deref()
            .and_then(|contents| serde_yaml::from_str(contents).ok())
            .unwrap_or_default();
        Ok((attrs, version))
    }

    /// Compute the current membership snapshot, and the earliest future
    /// presence deadline (so a watcher knows when presence can next lapse
    /// without any write happening).
    fn snapshot(&self) -> Result<(RelationSnapshot, Option<u64>), StoreError> {
        let presence_prefix = format!("{}presence/", self.base());
        let mut members = BTreeMap::new();
        let mut next_deadline: Option<u64> = None;
        let now = SystemTime::UNIX_EPOCH
            .elapsed()
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64;
        for (path, contents, _) in self.store.list(&presence_prefix)? {
            let unit = &path[presence_prefix.len()..];
            if unit == self.unit_name {
                continue;
            }
            let Some(deadline) = presence::deadline_millis(Some(&contents))
            else {
                continue;
            };
            if deadline <= now {
                continue;
            }
            next_deadline =
                Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
            let (settings, version) = self.settings(unit)?;
            members.insert(
                unit.to_string(),
                RemoteUnit { version: version.0, settings },
            );
        }
        let (life, _) = self.store.read(&self.life_path())?;
        let dying = life.as_deref().map(str::trim) == Some("dying");
        Ok((RelationSnapshot { members, dying }, next_deadline))
    }

    /// Start watching the relation.  The returned watch holds a coalescing
    /// receiver seeded with the current snapshot.
    pub fn watch(&self) -> Result<RelationWatch, StoreError> {
        let (initial, _) = self.snapshot()?;
        let (tx, rx) = watch::channel(initial);
        let mut prefix_rx = self.store.watch_prefix(&self.base());
        let ru = self.clone();
        let task = Task::spawn(move |mut shutdown| async move {
            loop {
                let (snapshot, next_deadline) = ru.snapshot()?;
                tx.send_if_modified(|current| {
                    if *current != snapshot {
                        *current = snapshot;
                        true
                    } else {
                        false
                    }
                });

                let now = SystemTime::UNIX_EPOCH
                    .elapsed()
                    .expect("system clock is before the Unix epoch")
                    .as_millis() as u64;
                let lapse = next_deadline
                    .map(|d| Duration::from_millis(d.saturating_sub(now)));
                tokio::select! {
                    changed = prefix_rx.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        if ru.store.is_closed() {
                            return Err(StoreError::Closed);
                        }
                    }
                    _ = async {
                        match lapse {
                            Some(lapse) => tokio::time::sleep(lapse).await,
                            None => std::future::pending().await,
                        }
                    } => {}
                    _ = shutdown.wait() => return Ok(()),
                }
            }
        });
        Ok(RelationWatch { rx, task })
    }
}

/// A running membership watcher.  Dropping it (or stopping it) ends the
/// stream; the receiver then reports closed.
pub struct RelationWatch {
    rx: watch::Receiver<RelationSnapshot>,
    task: Task<StoreError>,
}

impl RelationWatch {
    pub fn receiver(&self) -> watch::Receiver<RelationSnapshot> {
        self.rx.clone()
    }

    pub async fn stop(&self) -> Result<(), StoreError> {
        self.task.stop().await
    }
}
