// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hook tool symlinks.
//!
//! Each unit's tools directory holds the `jujuc` multiplexer binary and one
//! symlink per hook command name pointing at `./jujuc`; hook processes find
//! them on `PATH` and invoke them to read and mutate their context.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Every hook command `jujuc` answers to.
pub const COMMAND_NAMES: &[&str] = &[
    "close-port",
    "config-get",
    "juju-log",
    "open-port",
    "relation-get",
    "relation-list",
    "relation-set",
    "unit-get",
];

/// The multiplexer the symlinks resolve to.
pub const TOOL_TARGET: &str = "./jujuc";

#[derive(Debug, Clone, Error, PartialEq)]
#[error("cannot initialize hook commands in {dir:?}: {message}")]
pub struct ToolsError {
    pub dir: String,
    pub message: String,
}

/// The tools directory for a unit, under the agent's data directory.
pub fn tools_dir(data_dir: &Utf8Path, unit_name: &str) -> Utf8PathBuf {
    data_dir.join("tools").join(format!("unit-{}", unit_name.replace('/', "-")))
}

/// Idempotently create the hook command symlinks for a unit.  Symlinks
/// that already point at the right target are left untouched, so repeated
/// calls do not churn mtimes; anything else in the way is an error.
pub fn ensure_tools(
    data_dir: &Utf8Path,
    unit_name: &str,
) -> Result<(), ToolsError> {
    let dir = tools_dir(data_dir, unit_name);
    let fail = |message: String| ToolsError { dir: dir.to_string(), message };

    if !dir.is_dir() {
        return Err(fail("no such file or directory".to_string()));
    }
    for name in COMMAND_NAMES {
        let link = dir.join(name);
        match std::fs::read_link(&link) {
            Ok(target) if target == std::path::Path::new(TOOL_TARGET) => {
                continue
            }
            Ok(target) => {
                return Err(fail(format!(
                    "{} links to {} instead of {}",
                    name,
                    target.display(),
                    TOOL_TARGET
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::os::unix::fs::symlink(TOOL_TARGET, &link)
                    .map_err(|e| fail(e.to_string()))?;
            }
            Err(e) => return Err(fail(e.to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use std::time::SystemTime;

    fn mtime(path: &Utf8Path) -> SystemTime {
        std::fs::symlink_metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn ensure_tools_is_idempotent() {
        let data_dir = Utf8TempDir::new().unwrap();
        let dir = tools_dir(data_dir.path(), "u/123");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("jujuc"), "assume sane").unwrap();

        ensure_tools(data_dir.path(), "u/123").unwrap();
        let mut mtimes = Vec::new();
        for name in COMMAND_NAMES {
            let link = dir.join(name);
            assert_eq!(
                std::fs::read_link(&link).unwrap(),
                std::path::Path::new(TOOL_TARGET)
            );
            mtimes.push((link.clone(), mtime(&link)));
        }

        // A second run must not overwrite links that are already correct.
        ensure_tools(data_dir.path(), "u/123").unwrap();
        for (link, before) in mtimes {
            assert_eq!(mtime(&link), before);
        }
    }

    #[test]
    fn ensure_tools_without_a_directory() {
        let data_dir = Utf8TempDir::new().unwrap();
        let err = ensure_tools(data_dir.path(), "u/999").unwrap_err();
        assert!(err.to_string().starts_with("cannot initialize hook commands"));
        assert!(err.to_string().ends_with("no such file or directory"));
    }

    #[test]
    fn wrong_symlink_is_an_error() {
        let data_dir = Utf8TempDir::new().unwrap();
        let dir = tools_dir(data_dir.path(), "u/123");
        std::fs::create_dir_all(&dir).unwrap();
        std::os::unix::fs::symlink("/bin/true", dir.join("config-get"))
            .unwrap();
        assert!(ensure_tools(data_dir.path(), "u/123").is_err());
    }
}
