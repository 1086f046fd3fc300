// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hook kinds and the in-memory value the hook queue hands to its consumer.

use drover_state::config::Attrs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The relation lifecycle points a charm can respond to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Joined,
    Changed,
    Departed,
    Broken,
}

impl HookKind {
    /// The suffix used in hook names (`<relation>-relation-<kind>`).
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Joined => "joined",
            HookKind::Changed => "changed",
            HookKind::Departed => "departed",
            HookKind::Broken => "broken",
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hook firing, as delivered by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct HookInfo {
    pub kind: HookKind,
    /// The remote unit this firing is about.  Empty for `broken`, which is
    /// about the relation itself.
    pub remote_unit: String,
    /// The remote unit's settings change version as of delivery.
    pub change_version: u64,
    /// Snapshot of the current membership: unit name to settings version.
    pub members: BTreeMap<String, u64>,
    /// Snapshot of every member's settings as visible at enqueue time.
    pub settings: BTreeMap<String, Attrs>,
}

impl HookInfo {
    /// The firing for a dying relation's final `broken` hook.
    pub fn broken() -> HookInfo {
        HookInfo {
            kind: HookKind::Broken,
            remote_unit: String::new(),
            change_version: 0,
            members: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }
}

/// What actually travels on the uniter's fan-in channel: a hook firing
/// tagged with the relation it belongs to, so the uniter can find the
/// right relationer.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationHook {
    pub relation_key: String,
    pub info: HookInfo,
}
