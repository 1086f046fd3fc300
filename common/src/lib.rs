// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by every drover crate.
//!
//! This is intentionally small: retry policies and the long-lived task
//! harness.  Anything specific to the coordination store, the provider
//! interface, or the agents lives in the crate that owns it.

pub mod backoff;
pub mod task;
