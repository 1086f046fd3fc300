// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the provisioner against the dummy provider.

use assert_matches::assert_matches;
use drover_agent::provisioner::{
    Provisioner, ProvisionerConfig, ProvisionerError,
};
use drover_provider::dummy::{self, Op};
use drover_provider::{registry, Constraints, EnvironConfig, SharedEnviron};
use drover_state::{State, StateError, StoreError};
use drover_test_utils::poll::{wait_for_condition, CondCheckError};
use slog::Logger;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

struct Harness {
    log: Logger,
    environ: SharedEnviron,
    state: State,
    ops: UnboundedReceiver<Op>,
}

fn environ_attrs(env_name: &str) -> drover_provider::Attrs {
    let mut attrs = drover_provider::Attrs::new();
    attrs.insert("type".to_string(), "dummy".into());
    attrs.insert("name".to_string(), env_name.into());
    attrs.insert("authorized-keys".to_string(), "ssh-rsa AAAA test".into());
    attrs
}

/// Bootstrap a fresh dummy environment and record its configuration in the
/// state, the way `drover bootstrap` would.  Each test uses its own
/// environment name so tests can run concurrently.
async fn setup(env_name: &'static str) -> Harness {
    let log = drover_test_utils::test_logger(env_name);
    dummy::register();

    let config = EnvironConfig::new(environ_attrs(env_name)).unwrap();
    let environ = registry::open(&config).unwrap();
    environ.bootstrap(&Constraints::default()).await.unwrap();
    let ops = dummy::listen(env_name);

    let state = environ.open_state(&log).await.unwrap();
    write_config(&state, environ_attrs(env_name));
    Harness { log, environ, state, ops }
}

fn write_config(state: &State, attrs: drover_provider::Attrs) {
    let mut node = state.environ_config().unwrap();
    node.update(attrs);
    node.write().unwrap();
}

/// Alter the environment configuration so it no longer validates.
fn invalidate_environment(state: &State) {
    let mut node = state.environ_config().unwrap();
    node.set("name", 1);
    node.write().unwrap();
}

fn fix_environment(state: &State, env_name: &str) {
    let mut node = state.environ_config().unwrap();
    node.set("name", env_name);
    node.write().unwrap();
}

fn provisioner(h: &Harness) -> Provisioner {
    Provisioner::new(
        &h.log,
        h.state.clone(),
        ProvisionerConfig { retry_total: Duration::from_secs(1) },
    )
}

/// Wait for a start of the given machine, ignoring unrelated operations,
/// and check that the machine's instance id lands in the topology.
async fn check_start_instance(h: &mut Harness, machine: &str) {
    let deadline = Duration::from_secs(5);
    loop {
        match timeout(deadline, h.ops.recv()).await {
            Ok(Some(Op::StartInstance { machine_id, instance_id, .. })) => {
                assert_eq!(machine_id, machine);
                let state = h.state.clone();
                let machine = machine.to_string();
                let recorded = wait_for_condition(
                    || {
                        let state = state.clone();
                        let machine = machine.clone();
                        async move {
                            match state.instance_id(&machine) {
                                Ok(id) => Ok(id),
                                Err(StateError::NotProvisioned(_)) => {
                                    Err(CondCheckError::NotYet)
                                }
                                Err(e) => Err(CondCheckError::Failed(e)),
                            }
                        }
                    },
                    &Duration::from_millis(10),
                    &Duration::from_secs(5),
                )
                .await
                .expect("instance id was never recorded");
                assert_eq!(recorded, instance_id.0);
                return;
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("operations channel closed"),
            Err(_) => panic!("provisioner did not start an instance"),
        }
    }
}

/// Check that no instance is started for a while.
async fn check_not_start_instance(h: &mut Harness) {
    let deadline = Duration::from_millis(200);
    loop {
        match timeout(deadline, h.ops.recv()).await {
            Ok(Some(Op::StartInstance { machine_id, .. })) => {
                panic!("instance unexpectedly started for {}", machine_id)
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("operations channel closed"),
            Err(_) => return,
        }
    }
}

/// Wait for a stop and return the stopped instance ids.
async fn check_stop_instances(h: &mut Harness) -> Vec<String> {
    let deadline = Duration::from_secs(5);
    loop {
        match timeout(deadline, h.ops.recv()).await {
            Ok(Some(Op::StopInstances { ids, .. })) => {
                return ids.into_iter().map(|id| id.0).collect()
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("operations channel closed"),
            Err(_) => panic!("provisioner did not stop an instance"),
        }
    }
}

#[tokio::test]
async fn provisioner_start_stop() {
    let h = setup("prov-start-stop").await;
    let p = provisioner(&h);
    assert_eq!(p.stop().await, Ok(()));
    // Stop is idempotent and keeps returning the stored result.
    assert_eq!(p.stop().await, Ok(()));
}

#[tokio::test]
async fn simple_provision_cycle() {
    let mut h = setup("prov-simple").await;
    let p = provisioner(&h);

    let machine = h.state.add_machine().unwrap();
    check_start_instance(&mut h, &machine).await;
    let instance_id = h.state.instance_id(&machine).unwrap();

    h.state.remove_machine(&machine).unwrap();
    let stopped = check_stop_instances(&mut h).await;
    assert_eq!(stopped, vec![instance_id]);

    p.stop().await.unwrap();
}

#[tokio::test]
async fn does_not_reprovision_after_restart() {
    let mut h = setup("prov-restart").await;
    let p = provisioner(&h);

    let machine = h.state.add_machine().unwrap();
    check_start_instance(&mut h, &machine).await;
    p.stop().await.unwrap();

    // A new provisioner adopts the recorded instance instead of starting a
    // second one.
    let p = provisioner(&h);
    check_not_start_instance(&mut h).await;
    p.stop().await.unwrap();
}

#[tokio::test]
async fn reaps_instances_orphaned_while_offline() {
    let mut h = setup("prov-orphan").await;
    let p = provisioner(&h);

    let m1 = h.state.add_machine().unwrap();
    check_start_instance(&mut h, &m1).await;
    let m2 = h.state.add_machine().unwrap();
    check_start_instance(&mut h, &m2).await;
    let orphan = h.state.instance_id(&m2).unwrap();

    p.stop().await.unwrap();

    // The machine goes away while no provisioner is running: nobody issued
    // a stop for its instance.
    h.state.remove_machine(&m2).unwrap();

    let p = provisioner(&h);
    let stopped = check_stop_instances(&mut h).await;
    assert_eq!(stopped, vec![orphan]);
    // The bootstrap instance and m1's instance are untouched, and m1 is
    // not re-provisioned.
    check_not_start_instance(&mut h).await;
    assert_eq!(h.environ.all_instances().await.unwrap().len(), 2);

    p.stop().await.unwrap();
}

#[tokio::test]
async fn reaps_orphan_even_when_no_machines_remain() {
    // Edge case: the final machine was removed from the state while the
    // provisioner was not running.
    let mut h = setup("prov-orphan-last").await;
    let p = provisioner(&h);

    let machine = h.state.add_machine().unwrap();
    check_start_instance(&mut h, &machine).await;
    let orphan = h.state.instance_id(&machine).unwrap();
    p.stop().await.unwrap();

    h.state.remove_machine(&machine).unwrap();
    assert!(h.state.machines().unwrap().is_empty());

    let p = provisioner(&h);
    let stopped = check_stop_instances(&mut h).await;
    assert_eq!(stopped, vec![orphan]);
    p.stop().await.unwrap();
}

#[tokio::test]
async fn no_provisioning_with_invalid_environment() {
    let mut h = setup("prov-invalid").await;
    invalidate_environment(&h.state);

    let p = provisioner(&h);
    h.state.add_machine().unwrap();
    check_not_start_instance(&mut h).await;
    p.stop().await.unwrap();
}

#[tokio::test]
async fn provisioning_resumes_when_environment_is_fixed() {
    let mut h = setup("prov-fixed").await;
    invalidate_environment(&h.state);

    let p = provisioner(&h);
    let machine = h.state.add_machine().unwrap();
    check_not_start_instance(&mut h).await;

    fix_environment(&h.state, "prov-fixed");
    check_start_instance(&mut h, &machine).await;
    p.stop().await.unwrap();
}

#[tokio::test]
async fn provisioning_continues_after_invalidation() {
    let mut h = setup("prov-lkg").await;
    let p = provisioner(&h);

    let m1 = h.state.add_machine().unwrap();
    check_start_instance(&mut h, &m1).await;

    // Invalidate the configuration: in-flight use of the last known good
    // configuration continues.
    invalidate_environment(&h.state);
    let m2 = h.state.add_machine().unwrap();
    check_start_instance(&mut h, &m2).await;

    // And fixing it again keeps things going.
    fix_environment(&h.state, "prov-lkg");
    let m3 = h.state.add_machine().unwrap();
    check_start_instance(&mut h, &m3).await;

    p.stop().await.unwrap();
}

#[tokio::test]
async fn store_close_is_fatal() {
    let h = setup("prov-close").await;
    let p = provisioner(&h);

    h.state.store().close();
    let err = p.wait().await.unwrap_err();
    assert_matches!(
        err,
        ProvisionerError::State(StateError::Store(StoreError::Closed))
    );
    // Stop after the fact returns the same stored error.
    assert_eq!(p.stop().await.unwrap_err(), err);
}
