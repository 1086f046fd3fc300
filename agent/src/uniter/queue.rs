// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hook queue: merges a stream of membership snapshots into a totally
//! ordered sequence of hook firings.
//!
//! The interesting part is the [`Scoreboard`]: a pure state machine that
//! diffs each incoming snapshot against what has already been delivered and
//! keeps at most one queued event per remote unit.  While an event for a
//! unit is queued but not yet handed to the consumer, newer snapshots
//! update it in place rather than appending; ordering across units is FIFO
//! of first enqueue, which gives a fair rotation and preserves the
//! guarantee that a unit's `joined` precedes any of its `changed`s.
//!
//! [`HookQueue`] wraps the scoreboard in a task fed by a relation watcher
//! and drains it into the consumer's channel.

use super::hook::{HookInfo, HookKind, RelationHook};
use drover_common::task::Task;
use drover_state::{RelationSnapshot, RelationWatch, StoreError};
use slog::{debug, o, Logger};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq)]
enum QueuedOp {
    Join { version: u64 },
    Change { version: u64 },
    Depart,
}

/// The queue's internal state machine.  Pure: feed it snapshots with
/// [`Scoreboard::update`], drain it with [`Scoreboard::next`] /
/// [`Scoreboard::pop`].
#[derive(Debug, Default)]
pub struct Scoreboard {
    /// Remote units whose `joined` has been delivered, with the settings
    /// version most recently delivered (or acknowledged) for each.
    joined: BTreeMap<String, u64>,
    /// Queued units in FIFO order of first enqueue.  Entries whose op has
    /// been coalesced away are skipped lazily.
    order: VecDeque<String>,
    /// The single queued op per unit.
    ops: BTreeMap<String, QueuedOp>,
    /// The most recent snapshot, used to build hook infos.
    last: RelationSnapshot,
    broken_sent: bool,
}

impl Scoreboard {
    /// A scoreboard resuming from durable state: `members` maps each
    /// already-joined remote unit to the settings version last
    /// acknowledged for it.
    pub fn resume(members: BTreeMap<String, u64>) -> Scoreboard {
        Scoreboard { joined: members, ..Default::default() }
    }

    /// Fold a new membership snapshot into the queue.
    pub fn update(&mut self, snapshot: RelationSnapshot) {
        // BTreeMap iteration is lexicographic, which is exactly the
        // tie-break we want for units first seen in the same snapshot.
        for (unit, remote) in &snapshot.members {
            let version = remote.version;
            match self.ops.get(unit) {
                Some(QueuedOp::Join { .. }) => {
                    self.ops
                        .insert(unit.clone(), QueuedOp::Join { version });
                }
                Some(QueuedOp::Change { .. }) => {
                    self.ops
                        .insert(unit.clone(), QueuedOp::Change { version });
                }
                Some(QueuedOp::Depart) => {
                    // Came back before the departed was delivered.  If the
                    // settings moved on, the reappearance is a change;
                    // otherwise there is nothing to say.
                    match self.joined.get(unit) {
                        Some(acked) if *acked != version => {
                            self.ops.insert(
                                unit.clone(),
                                QueuedOp::Change { version },
                            );
                        }
                        _ => {
                            self.ops.remove(unit);
                        }
                    }
                }
                None => match self.joined.get(unit) {
                    Some(acked) if version > *acked => {
                        self.enqueue(unit, QueuedOp::Change { version });
                    }
                    Some(_) => {}
                    None => {
                        self.enqueue(unit, QueuedOp::Join { version });
                    }
                },
            }
        }

        let present: BTreeSet<&String> = snapshot.members.keys().collect();
        let absent: Vec<String> = self
            .joined
            .keys()
            .chain(self.ops.keys())
            .filter(|unit| !present.contains(unit))
            .cloned()
            .collect();
        for unit in absent {
            match self.ops.get(&unit) {
                Some(QueuedOp::Join { .. }) => {
                    // Never delivered: the unit came and went unobserved.
                    self.ops.remove(&unit);
                }
                Some(QueuedOp::Change { .. }) => {
                    self.ops.insert(unit, QueuedOp::Depart);
                }
                Some(QueuedOp::Depart) => {}
                None => {
                    if self.joined.contains_key(&unit) {
                        self.enqueue(&unit, QueuedOp::Depart);
                    }
                }
            }
        }

        self.last = snapshot;
    }

    fn enqueue(&mut self, unit: &str, op: QueuedOp) {
        if !self.ops.contains_key(unit) {
            self.order.push_back(unit.to_string());
        }
        self.ops.insert(unit.to_string(), op);
    }

    /// The next hook to deliver, if any, without consuming it.
    pub fn next(&mut self) -> Option<HookInfo> {
        loop {
            let unit = self.order.front()?.clone();
            let Some(op) = self.ops.get(&unit) else {
                // Coalesced away; drop the stale order entry.
                self.order.pop_front();
                continue;
            };
            let (kind, change_version) = match op {
                QueuedOp::Join { version } => (HookKind::Joined, *version),
                QueuedOp::Change { version } => (HookKind::Changed, *version),
                QueuedOp::Depart => (
                    HookKind::Departed,
                    self.joined.get(&unit).copied().unwrap_or(0),
                ),
            };
            return Some(HookInfo {
                kind,
                remote_unit: unit,
                change_version,
                members: self
                    .last
                    .members
                    .iter()
                    .map(|(unit, remote)| (unit.clone(), remote.version))
                    .collect(),
                settings: self
                    .last
                    .members
                    .iter()
                    .map(|(unit, remote)| {
                        (unit.clone(), remote.settings.clone())
                    })
                    .collect(),
            });
        }
    }

    /// Record that the hook at the head of the queue has been handed to
    /// the consumer, and advance.
    pub fn pop(&mut self, delivered: &HookInfo) {
        let unit = &delivered.remote_unit;
        debug_assert_eq!(self.order.front(), Some(unit));
        self.order.pop_front();
        self.ops.remove(unit);
        match delivered.kind {
            HookKind::Joined | HookKind::Changed => {
                self.joined
                    .insert(unit.clone(), delivered.change_version);
            }
            HookKind::Departed => {
                self.joined.remove(unit);
            }
            HookKind::Broken => {}
        }
    }

    /// Whether the terminal `broken` hook should be delivered now: the
    /// relation is dying, nothing is queued, and nobody is joined.
    pub fn ready_to_break(&mut self) -> bool {
        !self.broken_sent
            && self.last.dying
            && self.joined.is_empty()
            && self.next().is_none()
    }

    /// Produce the terminal `broken` firing.  The queue is done after
    /// this.
    pub fn brk(&mut self) -> HookInfo {
        self.broken_sent = true;
        HookInfo::broken()
    }

    pub fn is_broken(&self) -> bool {
        self.broken_sent
    }
}

/// A running hook queue: a task that folds a relation watcher's snapshots
/// through a [`Scoreboard`] and delivers hook infos to `hooks`.
pub struct HookQueue {
    task: Task<StoreError>,
    watch: RelationWatch,
}

impl HookQueue {
    /// Start the queue.  `members` is the durable last-acknowledged state
    /// the scoreboard resumes from; `hooks` is the (possibly shared)
    /// consumer channel.
    pub fn new(
        log: &Logger,
        relation_key: &str,
        members: BTreeMap<String, u64>,
        watch: RelationWatch,
        hooks: mpsc::Sender<RelationHook>,
    ) -> HookQueue {
        let log = log.new(o!("component" => "HookQueue"));
        let relation_key = relation_key.to_string();
        let mut rx = watch.receiver();
        let task = Task::spawn(move |mut shutdown| async move {
            let mut board = Scoreboard::resume(members);
            board.update(rx.borrow_and_update().clone());
            loop {
                let next = board.next();
                let terminal = next.is_none() && board.ready_to_break();
                if let Some(info) = next {
                    tokio::select! {
                        permit = hooks.reserve() => {
                            let Ok(permit) = permit else {
                                // Consumer is gone; nothing left to do.
                                return Ok(());
                            };
                            debug!(log, "delivering hook";
                                "kind" => %info.kind,
                                "remote_unit" => %info.remote_unit);
                            board.pop(&info);
                            permit.send(RelationHook {
                                relation_key: relation_key.clone(),
                                info,
                            });
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                            board.update(rx.borrow_and_update().clone());
                        }
                        _ = shutdown.wait() => return Ok(()),
                    }
                } else if terminal {
                    let info = board.brk();
                    tokio::select! {
                        permit = hooks.reserve() => {
                            let Ok(permit) = permit else { return Ok(()) };
                            debug!(log, "delivering hook"; "kind" => "broken");
                            permit.send(RelationHook {
                                relation_key: relation_key.clone(),
                                info,
                            });
                            return Ok(());
                        }
                        _ = shutdown.wait() => return Ok(()),
                    }
                } else {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                            board.update(rx.borrow_and_update().clone());
                        }
                        _ = shutdown.wait() => return Ok(()),
                    }
                }
            }
        });
        HookQueue { task, watch }
    }

    /// Stop the queue and its watcher.  Idempotent; any event already
    /// handed to the consumer channel stays there.
    pub async fn stop(&self) -> Result<(), StoreError> {
        let result = self.task.stop().await;
        self.watch.stop().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_state::RemoteUnit;

    fn snapshot(members: &[(&str, u64)], dying: bool) -> RelationSnapshot {
        RelationSnapshot {
            members: members
                .iter()
                .map(|(unit, version)| {
                    (
                        unit.to_string(),
                        RemoteUnit {
                            version: *version,
                            settings: Default::default(),
                        },
                    )
                })
                .collect(),
            dying,
        }
    }

    fn drain(board: &mut Scoreboard) -> Vec<(HookKind, String, u64)> {
        let mut fired = Vec::new();
        while let Some(info) = board.next() {
            board.pop(&info);
            fired.push((info.kind, info.remote_unit, info.change_version));
        }
        fired
    }

    #[test]
    fn joined_precedes_changed() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("u/0", 1)], false));
        board.update(snapshot(&[("u/0", 3)], false));
        // Coalesced: a single joined carrying the latest version.
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Joined, "u/0".to_string(), 3)]
        );

        // A later bump is a changed.
        board.update(snapshot(&[("u/0", 4)], false));
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Changed, "u/0".to_string(), 4)]
        );
    }

    #[test]
    fn coalescing_keeps_one_event_per_unit() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("u/0", 1)], false));
        board.update(snapshot(&[("u/0", 2)], false));
        board.update(snapshot(&[("u/0", 5)], false));
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Joined, "u/0".to_string(), 5)]
        );
        assert_eq!(drain(&mut board), vec![]);
    }

    #[test]
    fn unseen_visit_leaves_no_trace() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("u/0", 1)], false));
        // Gone before anyone saw the joined.
        board.update(snapshot(&[], false));
        assert_eq!(drain(&mut board), vec![]);
    }

    #[test]
    fn departed_requires_joined() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("u/0", 1)], false));
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Joined, "u/0".to_string(), 1)]
        );
        board.update(snapshot(&[], false));
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Departed, "u/0".to_string(), 1)]
        );
    }

    #[test]
    fn queued_change_becomes_depart() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("u/0", 1)], false));
        drain(&mut board);
        board.update(snapshot(&[("u/0", 2)], false));
        board.update(snapshot(&[], false));
        // The queued changed collapses into a single departed.
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Departed, "u/0".to_string(), 1)]
        );
    }

    #[test]
    fn queued_depart_cancelled_by_reappearance() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("u/0", 1)], false));
        drain(&mut board);
        board.update(snapshot(&[], false));
        // Back again with unchanged settings before the departed fired.
        board.update(snapshot(&[("u/0", 1)], false));
        assert_eq!(drain(&mut board), vec![]);

        // Back again with *changed* settings: one changed fires.
        board.update(snapshot(&[], false));
        board.update(snapshot(&[("u/0", 9)], false));
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Changed, "u/0".to_string(), 9)]
        );
    }

    #[test]
    fn fifo_of_first_enqueue_with_lexicographic_ties() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("b/0", 1)], false));
        board.update(snapshot(&[("b/0", 1), ("a/0", 1), ("c/0", 1)], false));
        // b/0 was enqueued first; a/0 and c/0 tie-break lexicographically.
        assert_eq!(
            drain(&mut board),
            vec![
                (HookKind::Joined, "b/0".to_string(), 1),
                (HookKind::Joined, "a/0".to_string(), 1),
                (HookKind::Joined, "c/0".to_string(), 1),
            ]
        );
    }

    #[test]
    fn resume_skips_acknowledged_state() {
        let members =
            [("u/0".to_string(), 3)].into_iter().collect::<BTreeMap<_, _>>();
        let mut board = Scoreboard::resume(members);
        // Same version as acknowledged: nothing fires.
        board.update(snapshot(&[("u/0", 3)], false));
        assert_eq!(drain(&mut board), vec![]);
        // A newer version fires a changed, not a joined.
        board.update(snapshot(&[("u/0", 4)], false));
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Changed, "u/0".to_string(), 4)]
        );
    }

    #[test]
    fn broken_fires_once_when_dying_and_empty() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("u/0", 1)], false));
        drain(&mut board);
        board.update(snapshot(&[], true));
        assert!(!board.ready_to_break() || board.next().is_some());
        assert_eq!(
            drain(&mut board),
            vec![(HookKind::Departed, "u/0".to_string(), 1)]
        );
        assert!(board.ready_to_break());
        let info = board.brk();
        assert_eq!(info.kind, HookKind::Broken);
        assert!(board.is_broken());
        assert!(!board.ready_to_break());
    }

    #[test]
    fn not_broken_while_members_remain() {
        let mut board = Scoreboard::default();
        board.update(snapshot(&[("u/0", 1)], true));
        assert!(!board.ready_to_break());
        drain(&mut board);
        // Still joined: the relation can't break yet.
        assert!(!board.ready_to_break());
        board.update(snapshot(&[], true));
        drain(&mut board);
        assert!(board.ready_to_break());
    }
}
