// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The durable per-relation record a unit agent keeps so that a crash
//! between hook start and hook commit is recoverable.
//!
//! One file per relation under the unit's data directory, containing the
//! settings version last acknowledged for every remote unit ever joined,
//! plus at most one `pending` marker for a hook that was prepared but not
//! yet committed.  Writes go to `state.new`, are fsynced, and are renamed
//! over `state`, so a reader sees either the pre-hook or the post-hook
//! record and never a torn write.  A leftover `state.new` is an
//! interrupted write and is discarded on load.

use super::hook::{HookInfo, HookKind};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use thiserror::Error;

const STATE_FILE: &str = "state";
const STATE_FILE_NEW: &str = "state.new";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelationStateError {
    #[error("cannot access relation state in {dir:?}: {message}")]
    Io { dir: String, message: String },

    #[error("relation state in {dir:?} is corrupt: {message}")]
    Corrupt { dir: String, message: String },

    #[error("unit {0:?} is not a member of the relation")]
    NotJoined(String),

    #[error("unit {0:?} has already joined the relation")]
    AlreadyJoined(String),

    #[error("cannot run {hook:?} hook while the relation has members")]
    StillHasMembers { hook: String },
}

/// The pending marker: a hook that was prepared but not committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PendingHook {
    pub unit: String,
    pub kind: HookKind,
    pub change_version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Record {
    #[serde(default)]
    members: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<PendingHook>,
}

/// Durable relation state for one unit's participation in one relation.
pub struct RelationState {
    dir: Utf8PathBuf,
    record: Record,
}

fn io_error(dir: &Utf8Path, error: std::io::Error) -> RelationStateError {
    RelationStateError::Io { dir: dir.to_string(), message: error.to_string() }
}

impl RelationState {
    /// Load (or initialize) the state kept in `dir`, creating the
    /// directory if needed.
    pub fn load(dir: &Utf8Path) -> Result<RelationState, RelationStateError> {
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

        // A leftover in-progress write never counts.
        let tmp = dir.join(STATE_FILE_NEW);
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(dir, e)),
        }

        let path = dir.join(STATE_FILE);
        let record = match fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| {
                RelationStateError::Corrupt {
                    dir: dir.to_string(),
                    message: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Record::default()
            }
            Err(e) => return Err(io_error(dir, e)),
        };
        Ok(RelationState { dir: dir.to_path_buf(), record })
    }

    /// The settings version last acknowledged for every joined remote unit.
    pub fn members(&self) -> &BTreeMap<String, u64> {
        &self.record.members
    }

    /// The hook that was prepared but not committed, if any.  Recovery must
    /// surface it before anything else.
    pub fn pending(&self) -> Option<&PendingHook> {
        self.record.pending.as_ref()
    }

    /// Check that firing `info` respects the ordering rules: a unit must
    /// join before it can change or depart, must not join twice, and the
    /// relation can only break once nobody is left.
    pub fn validate(&self, info: &HookInfo) -> Result<(), RelationStateError> {
        match info.kind {
            HookKind::Joined => {
                if self.record.members.contains_key(&info.remote_unit) {
                    return Err(RelationStateError::AlreadyJoined(
                        info.remote_unit.clone(),
                    ));
                }
            }
            HookKind::Changed | HookKind::Departed => {
                if !self.record.members.contains_key(&info.remote_unit) {
                    return Err(RelationStateError::NotJoined(
                        info.remote_unit.clone(),
                    ));
                }
            }
            HookKind::Broken => {
                if !self.record.members.is_empty() {
                    return Err(RelationStateError::StillHasMembers {
                        hook: "broken".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Durably record that `info` is about to run, so that a crash before
    /// commit is detectable.
    pub fn prepare(&mut self, info: &HookInfo) -> Result<(), RelationStateError> {
        self.validate(info)?;
        self.record.pending = Some(PendingHook {
            unit: info.remote_unit.clone(),
            kind: info.kind,
            change_version: info.change_version,
        });
        self.flush()
    }

    /// Durably record the effect of `info` and clear any pending marker.
    pub fn commit(&mut self, info: &HookInfo) -> Result<(), RelationStateError> {
        match info.kind {
            HookKind::Joined | HookKind::Changed => {
                self.record
                    .members
                    .insert(info.remote_unit.clone(), info.change_version);
            }
            HookKind::Departed => {
                self.record.members.remove(&info.remote_unit);
            }
            HookKind::Broken => {}
        }
        self.record.pending = None;
        if info.kind == HookKind::Broken {
            // The relation is over; nothing will ever read this again.
            let path = self.dir.join(STATE_FILE);
            match fs::remove_file(&path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(())
                }
                Err(e) => return Err(io_error(&self.dir, e)),
            }
        }
        self.flush()
    }

    /// Clear a pending marker without applying it (the configured recovery
    /// policy may decide a prepared hook counts as complete).
    pub fn clear_pending(&mut self) -> Result<(), RelationStateError> {
        self.record.pending = None;
        self.flush()
    }

    fn flush(&self) -> Result<(), RelationStateError> {
        let yaml = serde_yaml::to_string(&self.record).map_err(|e| {
            RelationStateError::Corrupt {
                dir: self.dir.to_string(),
                message: e.to_string(),
            }
        })?;
        let tmp = self.dir.join(STATE_FILE_NEW);
        let path = self.dir.join(STATE_FILE);
        let mut file =
            fs::File::create(&tmp).map_err(|e| io_error(&self.dir, e))?;
        file.write_all(yaml.as_bytes()).map_err(|e| io_error(&self.dir, e))?;
        file.sync_all().map_err(|e| io_error(&self.dir, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&self.dir, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;

    fn joined(unit: &str, version: u64) -> HookInfo {
        HookInfo {
            kind: HookKind::Joined,
            remote_unit: unit.to_string(),
            change_version: version,
            members: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    fn with_kind(mut info: HookInfo, kind: HookKind) -> HookInfo {
        info.kind = kind;
        info
    }

    #[test]
    fn ordering_rules() {
        let dir = Utf8TempDir::new().unwrap();
        let mut rs = RelationState::load(dir.path()).unwrap();

        // changed/departed before joined are rejected.
        assert_matches!(
            rs.validate(&with_kind(joined("mysql/0", 1), HookKind::Changed)),
            Err(RelationStateError::NotJoined(_))
        );
        assert_matches!(
            rs.validate(&with_kind(joined("mysql/0", 1), HookKind::Departed)),
            Err(RelationStateError::NotJoined(_))
        );

        rs.commit(&joined("mysql/0", 1)).unwrap();
        // A second join is rejected.
        assert_matches!(
            rs.validate(&joined("mysql/0", 2)),
            Err(RelationStateError::AlreadyJoined(_))
        );
        // broken is rejected while anyone is still joined.
        assert_matches!(
            rs.validate(&HookInfo::broken()),
            Err(RelationStateError::StillHasMembers { .. })
        );

        rs.commit(&with_kind(joined("mysql/0", 1), HookKind::Departed))
            .unwrap();
        rs.validate(&HookInfo::broken()).unwrap();
    }

    #[test]
    fn commit_survives_reload() {
        let dir = Utf8TempDir::new().unwrap();
        let mut rs = RelationState::load(dir.path()).unwrap();
        rs.commit(&joined("mysql/0", 3)).unwrap();
        rs.commit(&with_kind(joined("mysql/1", 7), HookKind::Joined)).unwrap();

        let rs = RelationState::load(dir.path()).unwrap();
        assert_eq!(rs.members().get("mysql/0"), Some(&3));
        assert_eq!(rs.members().get("mysql/1"), Some(&7));
        assert_eq!(rs.pending(), None);
    }

    #[test]
    fn pending_marker_survives_crash() {
        let dir = Utf8TempDir::new().unwrap();
        let mut rs = RelationState::load(dir.path()).unwrap();
        rs.prepare(&joined("mysql/0", 2)).unwrap();
        // Simulated crash: drop without committing.
        drop(rs);

        let mut rs = RelationState::load(dir.path()).unwrap();
        let pending = rs.pending().unwrap().clone();
        assert_eq!(
            pending,
            PendingHook {
                unit: "mysql/0".to_string(),
                kind: HookKind::Joined,
                change_version: 2,
            }
        );
        // Not yet a member: prepare is not commit.
        assert!(rs.members().is_empty());

        rs.commit(&joined("mysql/0", 2)).unwrap();
        assert_eq!(rs.pending(), None);
        assert_eq!(rs.members().get("mysql/0"), Some(&2));
    }

    #[test]
    fn stale_in_progress_write_is_discarded() {
        let dir = Utf8TempDir::new().unwrap();
        let mut rs = RelationState::load(dir.path()).unwrap();
        rs.commit(&joined("mysql/0", 1)).unwrap();

        // A torn write left behind by a crash mid-rename.
        std::fs::write(dir.path().join("state.new"), "members:\n  garbage")
            .unwrap();
        let rs = RelationState::load(dir.path()).unwrap();
        assert_eq!(rs.members().get("mysql/0"), Some(&1));
        assert!(!dir.path().join("state.new").exists());
    }

    #[test]
    fn broken_removes_the_record() {
        let dir = Utf8TempDir::new().unwrap();
        let mut rs = RelationState::load(dir.path()).unwrap();
        rs.commit(&joined("mysql/0", 1)).unwrap();
        rs.commit(&with_kind(joined("mysql/0", 1), HookKind::Departed))
            .unwrap();
        rs.commit(&HookInfo::broken()).unwrap();
        assert!(!dir.path().join("state").exists());
    }
}
