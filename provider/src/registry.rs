// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process-wide registry of provider factories.
//!
//! This is drover's one sanctioned piece of global state: a table mapping a
//! provider type name (the `type` attribute of an environment
//! configuration) to a factory for that provider's [`Environ`].

use crate::{Environ, EnvironConfig, Error};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex};

/// Builds an [`Environ`] from a validated configuration.
pub type Factory = fn(EnvironConfig) -> Result<Arc<dyn Environ>, Error>;

static REGISTRY: LazyLock<Mutex<BTreeMap<String, Factory>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

/// Register a provider factory under a type name.  Re-registering a name
/// replaces the factory; providers do this from their own `register()`
/// entry points.
pub fn register(type_name: &str, factory: Factory) {
    REGISTRY
        .lock()
        .unwrap()
        .insert(type_name.to_string(), factory);
}

/// Open an environment using the provider named by its configuration.
pub fn open(config: &EnvironConfig) -> Result<Arc<dyn Environ>, Error> {
    let factory = {
        let registry = REGISTRY.lock().unwrap();
        registry.get(config.type_name()).copied()
    };
    match factory {
        Some(factory) => factory(config.clone()),
        None => Err(Error::UnknownProvider(config.type_name().to_string())),
    }
}
