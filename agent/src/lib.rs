// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The drover agents.
//!
//! Two long-running workers live here: the [`provisioner`], which
//! reconciles the cloud provider with the machine set in the topology, and
//! the [`uniter`], which runs one unit's charm and its relation hook
//! engine.  The `drover` binary (the operator CLI) is built from this
//! crate as well.

pub mod environments;
pub mod provisioner;
pub mod uniter;
