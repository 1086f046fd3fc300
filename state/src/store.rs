// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The coordination store: versioned content nodes with compare-and-swap
//! writes and change notifications.
//!
//! Every piece of shared state in a drover environment lives under a path in
//! one store: the topology document, the environment configuration, relation
//! presence and settings, unit status.  The store guarantees:
//!
//! - Every node carries a version that increases monotonically on every
//!   mutation of that path and is never reset, even across removal.
//! - Writes are compare-and-swap: a write carries the version the writer
//!   read, and fails with [`StoreError::Conflict`] if the node has moved on.
//! - Watchers observe coalesced state: a consumer that falls behind sees the
//!   latest contents, not a replay of every intermediate write.
//!
//! Conflict errors are transient; the caller retries (most conveniently via
//! [`Store::retry_change`]).  A closed store is permanent: every call fails
//! with [`StoreError::Closed`] and all watchers are notified.

use slog::{debug, o, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;

/// Version token for a node.  Version zero means the node has never been
/// written.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
)]
pub struct Version(pub u64);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error(
        "version conflict writing {path:?}: expected {expected}, found {actual}"
    )]
    Conflict { path: String, expected: Version, actual: Version },

    #[error("coordination store is closed")]
    Closed,
}

impl StoreError {
    /// Conflicts are transient: re-read and retry.  Everything else is
    /// fatal to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A snapshot of one node, as delivered to watchers and readers.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    /// `None` if the node does not exist (never written, or removed).
    pub contents: Option<String>,
    pub version: Version,
    /// Set once the store has been closed; no further snapshots follow.
    pub closed: bool,
}

struct Node {
    contents: Option<String>,
    version: u64,
    watcher: Option<watch::Sender<NodeSnapshot>>,
}

impl Node {
    fn snapshot(&self, closed: bool) -> NodeSnapshot {
        NodeSnapshot {
            contents: self.contents.clone(),
            version: Version(self.version),
            closed,
        }
    }
}

struct PrefixWatcher {
    prefix: String,
    tx: watch::Sender<u64>,
}

struct StoreState {
    closed: bool,
    nodes: BTreeMap<String, Node>,
    prefix_watchers: Vec<PrefixWatcher>,
}

struct StoreInner {
    log: Logger,
    state: Mutex<StoreState>,
}

/// Handle to a coordination store.  Cheap to clone; all clones share the
/// same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(log: Logger) -> Store {
        Store {
            inner: Arc::new(StoreInner {
                log: log.new(o!("component" => "Store")),
                state: Mutex::new(StoreState {
                    closed: false,
                    nodes: BTreeMap::new(),
                    prefix_watchers: Vec::new(),
                }),
            }),
        }
    }

    /// Read the current contents and version of `path`.  A path that has
    /// never been written reads as `(None, Version(0))`.
    pub fn read(&self, path: &str) -> Result<(Option<String>, Version), StoreError> {
        let state = self.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        match state.nodes.get(path) {
            Some(node) => Ok((node.contents.clone(), Version(node.version))),
            None => Ok((None, Version(0))),
        }
    }

    /// Write `contents` to `path` if its version is still `expected`.
    /// Returns the new version.
    pub fn write(
        &self,
        path: &str,
        expected: Version,
        contents: &str,
    ) -> Result<Version, StoreError> {
        self.mutate(path, expected, Some(contents.to_string()))
    }

    /// Remove `path` if its version is still `expected`.  The version
    /// counter survives removal, so a later write continues from it.
    pub fn remove(&self, path: &str, expected: Version) -> Result<(), StoreError> {
        self.mutate(path, expected, None).map(|_| ())
    }

    fn mutate(
        &self,
        path: &str,
        expected: Version,
        contents: Option<String>,
    ) -> Result<Version, StoreError> {
        let mut state = self.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        let node = state.nodes.entry(path.to_string()).or_insert_with(|| Node {
            contents: None,
            version: 0,
            watcher: None,
        });
        if node.version != expected.0 {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected,
                actual: Version(node.version),
            });
        }
        node.contents = contents;
        node.version += 1;
        let new_version = Version(node.version);
        let snapshot = node.snapshot(false);
        if let Some(tx) = &node.watcher {
            let _ = tx.send(snapshot);
        }
        debug!(self.inner.log, "node written";
            "path" => %path, "version" => %new_version);
        Self::notify_prefix_watchers(&mut state, path);
        Ok(new_version)
    }

    /// Apply a pure transformation to the contents of `path`, retrying on
    /// version conflict until the write lands.
    ///
    /// `f` maps the current contents to the desired contents (`None` in
    /// either position means "absent").  Because it may run many times, `f`
    /// must be free of side effects.  Any error it returns aborts the loop
    /// and is passed through.
    pub fn retry_change<F, E>(&self, path: &str, mut f: F) -> Result<Version, E>
    where
        F: FnMut(Option<&str>) -> Result<Option<String>, E>,
        E: From<StoreError>,
    {
        loop {
            let (contents, version) = self.read(path)?;
            let new_contents = f(contents.as_deref())?;
            match self.mutate(path, version, new_contents) {
                Ok(version) => return Ok(version),
                Err(error) if error.is_transient() => continue,
                Err(error) => return Err(E::from(error)),
            }
        }
    }

    /// List every existing node under `prefix`, with contents and version.
    pub fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, String, Version)>, StoreError> {
        let state = self.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state
            .nodes
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .filter_map(|(path, node)| {
                node.contents.as_ref().map(|contents| {
                    (path.clone(), contents.clone(), Version(node.version))
                })
            })
            .collect())
    }

    /// Watch `path` for changes.  The receiver always holds the latest
    /// snapshot; intermediate states may be skipped if the consumer lags.
    pub fn watch(&self, path: &str) -> watch::Receiver<NodeSnapshot> {
        let mut state = self.lock();
        let closed = state.closed;
        let node = state.nodes.entry(path.to_string()).or_insert_with(|| Node {
            contents: None,
            version: 0,
            watcher: None,
        });
        match &node.watcher {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(node.snapshot(closed));
                node.watcher = Some(tx);
                rx
            }
        }
    }

    /// Watch every path under `prefix`.  The receiver holds a counter that
    /// is bumped on any change under the prefix; consumers re-read whatever
    /// state they care about when it moves.  This is deliberately a
    /// coalescing signal, not a change feed.
    pub fn watch_prefix(&self, prefix: &str) -> watch::Receiver<u64> {
        let mut state = self.lock();
        let (tx, rx) = watch::channel(0);
        state.prefix_watchers.push(PrefixWatcher {
            prefix: prefix.to_string(),
            tx,
        });
        rx
    }

    /// Permanently close the store.  Every subsequent call fails with
    /// [`StoreError::Closed`]; all watchers are woken with a closed
    /// snapshot.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        debug!(self.inner.log, "store closed");
        for node in state.nodes.values() {
            if let Some(tx) = &node.watcher {
                let _ = tx.send(node.snapshot(true));
            }
        }
        for watcher in &state.prefix_watchers {
            watcher.tx.send_modify(|n| *n += 1);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn notify_prefix_watchers(state: &mut StoreState, path: &str) {
        state
            .prefix_watchers
            .retain(|watcher| !watcher.tx.is_closed());
        for watcher in &state.prefix_watchers {
            if path.starts_with(&watcher.prefix) {
                watcher.tx.send_modify(|n| *n += 1);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap()
    }
}
