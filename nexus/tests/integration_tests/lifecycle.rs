// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for the VM lifecycle state machine

use crate::common::{cpu_ledger, NexusTestContext};
use assert_matches::assert_matches;
use chrono::Utc;
use cirrus_common::api::external::Error;
use cirrus_db_model::{VmEvent, VmRuntimeState, VmState};
use cirrus_nexus::app::vm_lifecycle::{VmStateDao, VmTransitionContext};
use cirrus_nexus::fsm::TransitionError;
use std::sync::Arc;
use strum::IntoEnumIterator;

#[tokio::test]
async fn test_transition_totality() {
    let cptestctx = NexusTestContext::new("test_transition_totality").await;
    let datastore = cptestctx.nexus.datastore();
    let table = cptestctx.nexus.vm_state_machine().table();
    let host = cptestctx.create_host(64, 2000, 256).await;

    for state in VmState::iter() {
        for event in VmEvent::iter() {
            // Put a fresh VM in `state`, on the host if the state is up.
            let vm = cptestctx.create_vm(&format!("{state}-{event}")).await;
            let runtime = VmRuntimeState {
                state,
                host_id: state.is_up().then_some(host.id),
                last_host_id: Some(host.id),
                gen: vm.runtime.gen.next(),
                time_updated: Utc::now(),
            };
            let updated =
                datastore.vm_update_runtime(vm.id, &runtime).await.unwrap();
            assert!(updated);

            let result = cptestctx
                .nexus
                .vm_transit_to(cptestctx.opctx(), vm.id, event, None)
                .await;
            let stored = datastore.vm_fetch(vm.id).await.unwrap();
            match table.next_state(state, event) {
                Some(to) => {
                    let transitioned = result.unwrap_or_else(|e| {
                        panic!("{state} --{event}--> failed: {e}")
                    });
                    assert_eq!(transitioned.from, state);
                    assert_eq!(transitioned.to, to);
                    assert_eq!(stored.state(), to);
                    assert!(stored.runtime.gen > runtime.gen);
                }
                None => {
                    assert_matches!(
                        result,
                        Err(TransitionError::NoTransition { from, event: e })
                            if from == state && e == event
                    );
                    // A rejected event leaves the record alone.
                    assert_eq!(stored.runtime, runtime);
                }
            }
        }
    }

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_start_stop_tracks_hosts() {
    let cptestctx = NexusTestContext::new("test_start_stop_tracks_hosts").await;
    let host = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.create_vm("vm").await;

    let starting = cptestctx
        .transit(vm.id, VmEvent::StartRequested, Some(host.id))
        .await;
    assert_eq!(starting.from, VmState::Stopped);
    assert_eq!(starting.to, VmState::Starting);
    assert_eq!(starting.entity.host_id(), Some(host.id));
    assert_eq!(starting.entity.last_host_id(), None);

    let running =
        cptestctx.transit(vm.id, VmEvent::OperationSucceeded, None).await;
    assert_eq!(running.to, VmState::Running);
    assert_eq!(running.entity.host_id(), Some(host.id));
    assert_eq!(running.entity.last_host_id(), Some(host.id));

    let stopped = cptestctx.stop_vm(vm.id).await;
    assert_eq!(stopped.state(), VmState::Stopped);
    assert_eq!(stopped.host_id(), None);
    assert_eq!(stopped.last_host_id(), Some(host.id));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_illegal_request_is_rejected() {
    let cptestctx =
        NexusTestContext::new("test_illegal_request_is_rejected").await;
    let vm = cptestctx.create_vm("vm").await;
    cptestctx.transit(vm.id, VmEvent::DestroyRequested, None).await;

    let error = cptestctx
        .nexus
        .vm_transit_to(cptestctx.opctx(), vm.id, VmEvent::StopRequested, None)
        .await
        .unwrap_err();
    assert_matches!(
        error,
        TransitionError::NoTransition {
            from: VmState::Destroyed,
            event: VmEvent::StopRequested,
        }
    );
    assert!(!error.retryable());
    assert_matches!(Error::from(error), Error::InvalidRequest { .. });

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_stale_writer_loses() {
    let cptestctx = NexusTestContext::new("test_stale_writer_loses").await;
    let host = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.create_vm("vm").await;
    let running = cptestctx.start_vm(vm.id, host.id).await;

    // Somebody else asks the VM to stop first.
    cptestctx.transit(vm.id, VmEvent::StopRequested, None).await;
    let before = cptestctx.ledger(host.id).await;

    // A writer still holding the `Running` record tries the same thing.
    let fsm = cptestctx.nexus.vm_state_machine();
    let dao = VmStateDao::new(Arc::clone(cptestctx.nexus.datastore()));
    let context =
        VmTransitionContext::for_event(&running, VmEvent::StopRequested, None);
    let error = fsm
        .transit_to(
            cptestctx.opctx(),
            &dao,
            &running,
            VmEvent::StopRequested,
            &context,
        )
        .await
        .unwrap_err();
    assert_matches!(
        error,
        TransitionError::Conflict {
            expected: VmState::Running,
            found: VmState::Stopping,
        }
    );
    assert!(error.retryable());

    // Once the VM has stopped, a stale request that the current state doesn't
    // accept is refused outright.
    cptestctx.transit(vm.id, VmEvent::OperationSucceeded, None).await;
    let context = VmTransitionContext::for_event(
        &running,
        VmEvent::MigrationRequested,
        None,
    );
    let error = fsm
        .transit_to(
            cptestctx.opctx(),
            &dao,
            &running,
            VmEvent::MigrationRequested,
            &context,
        )
        .await
        .unwrap_err();
    assert_matches!(
        error,
        TransitionError::NoTransition {
            from: VmState::Stopped,
            event: VmEvent::MigrationRequested,
        }
    );

    // Losers don't touch the ledger: the only change is the real stop.
    let after = cptestctx.ledger(host.id).await;
    assert_eq!(cpu_ledger(&before), (1000, 0));
    assert_eq!(cpu_ledger(&after), (0, 1000));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_failed_start_releases_host() {
    let cptestctx =
        NexusTestContext::new("test_failed_start_releases_host").await;
    let host = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.create_vm("vm").await;

    cptestctx.transit(vm.id, VmEvent::StartRequested, Some(host.id)).await;
    assert_eq!(cpu_ledger(&cptestctx.ledger(host.id).await), (1000, 0));

    let failed =
        cptestctx.transit(vm.id, VmEvent::OperationFailed, None).await;
    assert_eq!(failed.to, VmState::Stopped);
    assert_eq!(failed.entity.host_id(), None);
    assert_eq!(failed.entity.last_host_id(), None);
    assert_eq!(cpu_ledger(&cptestctx.ledger(host.id).await), (0, 0));

    cptestctx.cleanup_successful();
}
