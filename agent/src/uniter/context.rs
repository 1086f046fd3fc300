// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The charm-facing execution context for relation hooks.
//!
//! A [`RelationContext`] holds the membership and settings snapshot that
//! hook tools (`relation-list`, `relation-get`) read while a hook for that
//! relation is running.  It is updated from each [`HookInfo`] during
//! prepare, before the charm process starts, so the charm observes exactly
//! the state the hook was fired for.

use super::hook::HookInfo;
use drover_state::config::Attrs;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct RelationContext {
    relation_name: String,
    members: BTreeMap<String, Attrs>,
}

impl RelationContext {
    pub fn new(relation_name: &str) -> RelationContext {
        RelationContext {
            relation_name: relation_name.to_string(),
            members: BTreeMap::new(),
        }
    }

    pub fn relation_name(&self) -> &str {
        &self.relation_name
    }

    /// Replace the membership snapshot with the one carried by `info`.
    pub fn set_members(&mut self, info: &HookInfo) {
        self.members = info.settings.clone();
    }

    /// Member unit names, for `relation-list`.
    pub fn member_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    /// One member's settings, for `relation-get`.
    pub fn member_settings(&self, unit: &str) -> Option<&Attrs> {
        self.members.get(unit)
    }
}
