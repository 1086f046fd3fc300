// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the uniter: lifecycle hooks, the relation hook
//! engine end to end, failure/resolution, and crash recovery.

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use drover_agent::uniter::hook::{HookInfo, HookKind};
use drover_agent::uniter::relation_state::RelationState;
use drover_agent::uniter::relationer::PresenceConfig;
use drover_agent::uniter::{RecoveryPolicy, Uniter, UniterConfig};
use drover_state::{
    RelationEndpoint, RelationRole, RelationScope, ResolvedMode, State, Store,
    UnitStatus,
};
use drover_test_utils::poll::{wait_for_condition, CondCheckError};
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;

const UNIT: &str = "wordpress/0";
const REMOTE: &str = "mysql/0";

struct Harness {
    log: Logger,
    state: State,
    relation: String,
    data_dir: Utf8TempDir,
    charm_dir: Utf8TempDir,
    hooks_log: Utf8PathBuf,
}

fn presence() -> PresenceConfig {
    PresenceConfig {
        period: Duration::from_millis(20),
        timeout: Duration::from_millis(200),
    }
}

fn setup(test_name: &'static str) -> Harness {
    let log = drover_test_utils::test_logger(test_name);
    let state = State::new(&log, Store::new(log.clone()));

    let wordpress = state.add_service("wordpress").unwrap();
    let mysql = state.add_service("mysql").unwrap();
    let relation = state
        .add_relation(vec![
            RelationEndpoint {
                service_key: mysql,
                name: "db".to_string(),
                role: RelationRole::Provider,
                scope: RelationScope::Global,
            },
            RelationEndpoint {
                service_key: wordpress,
                name: "db".to_string(),
                role: RelationRole::Requirer,
                scope: RelationScope::Global,
            },
        ])
        .unwrap();
    assert_eq!(state.add_unit("wordpress").unwrap(), UNIT);

    let data_dir = Utf8TempDir::new().unwrap();
    let charm_dir = Utf8TempDir::new().unwrap();
    let hooks_log = data_dir.path().join("hooks.log");
    std::fs::create_dir_all(charm_dir.path().join("hooks")).unwrap();

    Harness { log, state, relation, data_dir, charm_dir, hooks_log }
}

impl Harness {
    /// Install a charm hook that appends its name (and the remote unit,
    /// for relation hooks) to the log and exits 0.
    fn write_hook(&self, name: &str) {
        self.write_hook_script(
            name,
            &format!(
                "#!/bin/sh\necho \"{} ${{JUJU_REMOTE_UNIT:-}}\" >> {}\n",
                name, self.hooks_log
            ),
        );
    }

    fn write_hook_script(&self, name: &str, script: &str) {
        let path = self.charm_dir.path().join("hooks").join(name);
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &path,
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }
    }

    fn write_standard_hooks(&self) {
        for name in [
            "install",
            "config-changed",
            "start",
            "stop",
            "upgrade-charm",
            "db-relation-joined",
            "db-relation-changed",
            "db-relation-departed",
            "db-relation-broken",
        ] {
            self.write_hook(name);
        }
    }

    fn uniter(&self, recovery: RecoveryPolicy) -> Uniter {
        Uniter::new(
            &self.log,
            self.state.clone(),
            UniterConfig {
                unit_name: UNIT.to_string(),
                data_dir: self.data_dir.path().to_path_buf(),
                charm_dir: self.charm_dir.path().to_path_buf(),
                recovery,
                presence: presence(),
            },
        )
    }

    fn log_lines(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.hooks_log) {
            Ok(contents) => contents
                .lines()
                .map(|line| line.trim_end().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn wait_for_log_line(&self, line: &str) {
        let result = wait_for_condition(
            || async {
                if self.log_lines().iter().any(|l| l == line) {
                    Ok(())
                } else {
                    Err(CondCheckError::<std::io::Error>::NotYet)
                }
            },
            &Duration::from_millis(20),
            &Duration::from_secs(10),
        )
        .await;
        if result.is_err() {
            panic!(
                "hook {:?} never ran; log so far: {:?}",
                line,
                self.log_lines()
            );
        }
    }

    async fn wait_for_status(&self, want: UnitStatus) {
        let result = wait_for_condition(
            || {
                let want = want.clone();
                async move {
                    match self.state.unit_status(UNIT) {
                        Ok(Some(status)) if status == want => Ok(()),
                        Ok(_) => Err(CondCheckError::NotYet),
                        Err(e) => Err(CondCheckError::Failed(e)),
                    }
                }
            },
            &Duration::from_millis(20),
            &Duration::from_secs(10),
        )
        .await;
        if result.is_err() {
            panic!(
                "unit never reached status {:?}; current: {:?}",
                want,
                self.state.unit_status(UNIT)
            );
        }
    }

    fn relation_state_dir(&self) -> Utf8PathBuf {
        self.data_dir
            .path()
            .join("state")
            .join("unit-wordpress-0")
            .join("relations")
            .join(&self.relation)
    }
}

#[tokio::test]
async fn lifecycle_hooks_run_in_order() {
    let h = setup("uniter-lifecycle");
    h.write_standard_hooks();

    let uniter = h.uniter(RecoveryPolicy::default());
    h.wait_for_status(UnitStatus::Started).await;
    assert_eq!(
        h.log_lines(),
        vec!["install", "config-changed", "start"]
    );

    uniter.stop().await.unwrap();
    uniter.stop().await.unwrap();
}

#[tokio::test]
async fn relation_hooks_follow_membership() {
    let h = setup("uniter-relation");
    h.write_standard_hooks();

    let uniter = h.uniter(RecoveryPolicy::default());
    h.wait_for_status(UnitStatus::Started).await;

    // A remote unit writes its settings and joins.
    let remote = h.state.relation_unit(&h.relation, REMOTE).unwrap();
    let mut settings = drover_state::config::Attrs::new();
    settings.insert("host".to_string(), "10.0.0.7".into());
    remote.write_settings(&settings).unwrap();
    let pinger = remote.join(presence().period, presence().timeout);
    h.wait_for_log_line("db-relation-joined mysql/0").await;

    // A settings change fires changed.
    settings.insert("port".to_string(), "3306".into());
    remote.write_settings(&settings).unwrap();
    h.wait_for_log_line("db-relation-changed mysql/0").await;

    // Departure fires departed.
    pinger.stop().await.unwrap();
    remote.depart().unwrap();
    h.wait_for_log_line("db-relation-departed mysql/0").await;

    // Destroying the relation fires broken once everyone is gone.
    h.state.set_relation_dying(&h.relation).unwrap();
    h.wait_for_log_line("db-relation-broken").await;

    // The full trace, in order: every departed is preceded by exactly one
    // joined, changed only between joined and departed, broken last.
    let lines = h.log_lines();
    let relation_lines: Vec<&str> = lines
        .iter()
        .filter(|l| l.starts_with("db-relation-"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        relation_lines,
        vec![
            "db-relation-joined mysql/0",
            "db-relation-changed mysql/0",
            "db-relation-departed mysql/0",
            "db-relation-broken",
        ]
    );

    uniter.stop().await.unwrap();
}

#[tokio::test]
async fn failed_hook_blocks_until_resolved_retry() {
    let h = setup("uniter-resolved-retry");
    h.write_standard_hooks();
    // config-changed fails until the fixed marker appears.
    let marker = h.data_dir.path().join("fixed");
    h.write_hook_script(
        "config-changed",
        &format!(
            "#!/bin/sh\necho \"config-changed \" >> {}\ntest -f {}\n",
            h.hooks_log, marker
        ),
    );

    let uniter = h.uniter(RecoveryPolicy::default());
    h.wait_for_status(UnitStatus::Error(
        "hook failed: \"config-changed\"".to_string(),
    ))
    .await;
    // Forward progress is blocked: start has not run.
    assert!(!h.log_lines().contains(&"start".to_string()));

    // The operator fixes the charm and resolves with retry.
    std::fs::write(&marker, b"").unwrap();
    h.state.set_resolved(UNIT, ResolvedMode::Retry).unwrap();
    h.wait_for_status(UnitStatus::Started).await;
    h.wait_for_log_line("start").await;
    // The resolved flag is consumed.
    assert_eq!(h.state.resolved(UNIT).unwrap(), None);

    uniter.stop().await.unwrap();
}

#[tokio::test]
async fn failed_hook_can_be_skipped() {
    let h = setup("uniter-resolved-skip");
    h.write_standard_hooks();
    h.write_hook_script(
        "start",
        &format!("#!/bin/sh\necho \"start \" >> {}\nexit 1\n", h.hooks_log),
    );

    let uniter = h.uniter(RecoveryPolicy::default());
    h.wait_for_status(UnitStatus::Error("hook failed: \"start\"".to_string()))
        .await;

    h.state.set_resolved(UNIT, ResolvedMode::Skip).unwrap();
    h.wait_for_status(UnitStatus::Started).await;
    // The hook ran once (and failed); skip did not re-run it.
    let starts =
        h.log_lines().iter().filter(|l| l.as_str() == "start").count();
    assert_eq!(starts, 1);

    uniter.stop().await.unwrap();
}

fn seed_pending(h: &Harness) {
    // Simulate a crash between prepare and commit: durable state carries a
    // pending joined for the remote unit.
    let mut rs = RelationState::load(&h.relation_state_dir()).unwrap();
    rs.prepare(&HookInfo {
        kind: HookKind::Joined,
        remote_unit: REMOTE.to_string(),
        change_version: 1,
        members: BTreeMap::from([(REMOTE.to_string(), 1)]),
        settings: BTreeMap::new(),
    })
    .unwrap();

    // The unit had already gotten past its initial lifecycle hooks.
    let state_dir = h.data_dir.path().join("state").join("unit-wordpress-0");
    std::fs::create_dir_all(&state_dir).unwrap();
    std::fs::write(state_dir.join("installed"), b"").unwrap();
    std::fs::write(state_dir.join("started"), b"").unwrap();
}

#[tokio::test]
async fn recovery_reruns_pending_hook_first() {
    let h = setup("uniter-recover-rerun");
    h.write_standard_hooks();
    seed_pending(&h);

    let uniter = h.uniter(RecoveryPolicy::RerunPending);
    h.wait_for_log_line("db-relation-joined mysql/0").await;
    h.wait_for_status(UnitStatus::Started).await;

    // The recovered hook came before anything else.
    assert_eq!(h.log_lines()[0], "db-relation-joined mysql/0");

    uniter.stop().await.unwrap();

    // Committed: the member is durably acknowledged, no pending marker.
    let rs = RelationState::load(&h.relation_state_dir()).unwrap();
    assert_eq!(rs.pending(), None);
    assert!(rs.members().contains_key(REMOTE) || rs.members().is_empty());
}

#[tokio::test]
async fn recovery_can_mark_pending_complete() {
    let h = setup("uniter-recover-mark");
    h.write_standard_hooks();
    seed_pending(&h);

    let uniter = h.uniter(RecoveryPolicy::MarkComplete);
    h.wait_for_status(UnitStatus::Started).await;

    // The hook was counted as already run, not re-run.
    assert!(!h
        .log_lines()
        .contains(&"db-relation-joined mysql/0".to_string()));

    uniter.stop().await.unwrap();

    let rs = RelationState::load(&h.relation_state_dir()).unwrap();
    assert_eq!(rs.pending(), None);
}

#[tokio::test]
async fn dying_unit_runs_stop() {
    let h = setup("uniter-dying");
    h.write_standard_hooks();

    let uniter = h.uniter(RecoveryPolicy::default());
    h.wait_for_status(UnitStatus::Started).await;

    h.state.set_unit_dying(UNIT).unwrap();
    h.wait_for_status(UnitStatus::Stopped).await;
    h.wait_for_log_line("stop").await;

    // The loop exited on its own.
    uniter.wait().await.unwrap();
}

#[tokio::test]
async fn config_changes_queue_a_hook() {
    let h = setup("uniter-config-change");
    h.write_standard_hooks();

    let uniter = h.uniter(RecoveryPolicy::default());
    h.wait_for_status(UnitStatus::Started).await;
    let before = h
        .log_lines()
        .iter()
        .filter(|l| l.as_str() == "config-changed")
        .count();

    let mut node = h.state.service_config("wordpress").unwrap();
    node.set("blog-title", "On the Care of Herds".to_string());
    node.write().unwrap();

    let result = wait_for_condition(
        || async {
            let now = h
                .log_lines()
                .iter()
                .filter(|l| l.as_str() == "config-changed")
                .count();
            if now > before {
                Ok(())
            } else {
                Err(CondCheckError::<std::io::Error>::NotYet)
            }
        },
        &Duration::from_millis(20),
        &Duration::from_secs(10),
    )
    .await;
    assert!(result.is_ok(), "config-changed never re-ran");

    uniter.stop().await.unwrap();
}

#[tokio::test]
async fn tools_are_installed() {
    let h = setup("uniter-tools");
    h.write_standard_hooks();

    let uniter = h.uniter(RecoveryPolicy::default());
    h.wait_for_status(UnitStatus::Started).await;

    let tools = drover_agent::uniter::tools::tools_dir(
        Utf8Path::new(h.data_dir.path().as_str()),
        UNIT,
    );
    for name in drover_agent::uniter::tools::COMMAND_NAMES {
        assert!(tools.join(name).is_symlink(), "{} is missing", name);
    }

    uniter.stop().await.unwrap();
}
