// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Presence as a heartbeat.
//!
//! A [`Pinger`] periodically refreshes an "alive until" deadline under a
//! store path.  Observers consider the occupant present while the deadline
//! lies in the future, so presence lapses one timeout after the pinger
//! stops — whether it stopped deliberately or died with its process.
//! Removing the node signals departure immediately; see
//! [`crate::RelationUnit::depart`].

use crate::store::{Store, StoreError};
use drover_common::task::Task;
use serde::{Deserialize, Serialize};
use slog::{debug, o, Logger};
use std::time::{Duration, SystemTime};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Beat {
    alive_until: u64,
}

fn now_millis() -> u64 {
    // The system clock being before the Unix epoch is not a condition we
    // try to survive.
    SystemTime::UNIX_EPOCH
        .elapsed()
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

/// Parse a presence node's contents and report whether the occupant is
/// still considered present.
pub fn is_alive(contents: Option<&str>) -> bool {
    deadline_millis(contents)
        .map(|deadline| deadline > now_millis())
        .unwrap_or(false)
}

/// The raw deadline recorded in a presence node, if it parses.
pub fn deadline_millis(contents: Option<&str>) -> Option<u64> {
    let beat: Beat = serde_yaml::from_str(contents?).ok()?;
    Some(beat.alive_until)
}

/// A background task asserting presence under one path.
pub struct Pinger {
    task: Task<StoreError>,
}

impl Pinger {
    /// Start asserting presence.  The deadline is refreshed to
    /// `now + timeout` every `period`; `period` must be comfortably smaller
    /// than `timeout` or observers will see flapping.
    pub fn start(
        log: &Logger,
        store: Store,
        path: &str,
        period: Duration,
        timeout: Duration,
    ) -> Pinger {
        assert!(
            period < timeout,
            "presence period {:?} must be shorter than timeout {:?}",
            period,
            timeout
        );
        let log = log.new(o!("component" => "Pinger", "path" => path.to_string()));
        let path = path.to_string();
        let task = Task::spawn(move |mut shutdown| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let deadline = now_millis() + timeout.as_millis() as u64;
                        let beat = Beat { alive_until: deadline };
                        store.retry_change(&path, |_| {
                            Ok::<_, StoreError>(Some(
                                serde_yaml::to_string(&beat)
                                    .expect("a beat always serializes"),
                            ))
                        })?;
                        debug!(log, "presence refreshed"; "deadline" => deadline);
                    }
                    _ = shutdown.wait() => {
                        // Leave the last deadline in place: presence lapses
                        // after the timeout, which is the contract.
                        return Ok(());
                    }
                }
            }
        });
        Pinger { task }
    }

    /// Stop refreshing presence.  Idempotent.  Does not remove the node;
    /// presence lapses after the timeout.
    pub async fn stop(&self) -> Result<(), StoreError> {
        self.task.stop().await
    }
}
