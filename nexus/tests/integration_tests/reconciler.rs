// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for recomputing host capacity from the VMs on each host

use crate::common::{
    cpu_ledger, memory_ledger, test_config, NexusTestContext, MIB,
};
use assert_matches::assert_matches;
use cirrus_common::api::external::{ByteCount, Error};
use cirrus_db_model::{
    CapacityType, HostCapacity, OvercommitRatios, Vm, VmEvent,
};
use cirrus_nexus::app::notify::CapacityEvent;
use cirrus_uuid_kinds::HostUuid;
use std::time::Duration;

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let cptestctx = NexusTestContext::new("test_reconcile_is_idempotent").await;
    let opctx = cptestctx.opctx();
    let host = cptestctx.create_host(4, 2000, 8).await;
    let running = cptestctx.create_vm("running").await;
    let stopped = cptestctx.create_vm("stopped").await;
    cptestctx.start_vm(running.id, host.id).await;
    cptestctx.start_vm(stopped.id, host.id).await;
    cptestctx.stop_vm(stopped.id).await;

    // The listener already left the ledger exactly where a recount would.
    let before = cptestctx.ledger(host.id).await;
    let outcome = cptestctx
        .nexus
        .host_capacity_reconcile(opctx, host.id)
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.reservations_freed, 0);
    assert_eq!(outcome.capacity, before);
    assert_eq!(cpu_ledger(&outcome.capacity), (1000, 1000));

    let again = cptestctx
        .nexus
        .host_capacity_reconcile(opctx, host.id)
        .await
        .unwrap();
    assert!(!again.changed);
    assert_eq!(again.capacity, outcome.capacity);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_reconcile_repairs_corrupted_ledger() {
    let cptestctx =
        NexusTestContext::new("test_reconcile_repairs_corrupted_ledger").await;
    let opctx = cptestctx.opctx();
    let host = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.create_vm("vm").await;
    cptestctx.start_vm(vm.id, host.id).await;

    cptestctx
        .nexus
        .datastore()
        .host_capacity_transaction(
            opctx,
            host.id,
            |capacity: &mut HostCapacity| {
                capacity.cpu.used = 7777;
                capacity.memory.reserved = 42;
                capacity.cpu_core.used = 0;
                Ok::<_, ()>(())
            },
        )
        .await
        .unwrap();

    let outcome = cptestctx
        .nexus
        .host_capacity_reconcile(opctx, host.id)
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(cpu_ledger(&outcome.capacity), (1000, 0));
    assert_eq!(memory_ledger(&outcome.capacity), (512 * MIB, 0));
    assert_eq!(outcome.capacity.cpu_core.used, 1);
    assert_eq!(cptestctx.ledger(host.id).await, outcome.capacity);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_reservation_expires_after_amnesty() {
    let mut config = test_config();
    config.capacity.skip_counting_secs = 0;
    let cptestctx = NexusTestContext::new_with_config(
        "test_reservation_expires_after_amnesty",
        config,
    )
    .await;
    let opctx = cptestctx.opctx();
    let mut events = cptestctx.nexus.events().subscribe();
    let host = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.create_vm("vm").await;
    cptestctx.start_vm(vm.id, host.id).await;
    cptestctx.stop_vm(vm.id).await;
    assert_eq!(cpu_ledger(&cptestctx.ledger(host.id).await), (0, 1000));

    let outcome = cptestctx
        .nexus
        .host_capacity_reconcile(opctx, host.id)
        .await
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.reservations_freed, 1);
    assert_eq!(cpu_ledger(&outcome.capacity), (0, 0));
    assert_eq!(memory_ledger(&outcome.capacity), (0, 0));

    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for capacity event")
        .unwrap();
    assert_eq!(
        event,
        CapacityEvent::ReservedCapacityFreed { vm_id: vm.id, host_id: host.id }
    );
    let vm = cptestctx.nexus.vm_fetch(vm.id).await.unwrap();
    assert!(vm.reserved_capacity_freed_notified);

    // Announced once only.
    let again = cptestctx
        .nexus
        .host_capacity_reconcile(opctx, host.id)
        .await
        .unwrap();
    assert!(!again.changed);
    assert_eq!(again.reservations_freed, 0);
    assert_matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    );

    // Running again makes the VM eligible for a future announcement.
    let vm = cptestctx.start_vm(vm.id, host.id).await;
    assert!(!vm.reserved_capacity_freed_notified);
    assert_eq!(cpu_ledger(&cptestctx.ledger(host.id).await), (1000, 0));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_reconcile_rescales_to_cluster_overcommit() {
    let cptestctx =
        NexusTestContext::new("test_reconcile_rescales_to_cluster_overcommit")
            .await;
    let opctx = cptestctx.opctx();
    let host = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.create_vm("vm").await;
    let vm = cptestctx.start_vm(vm.id, host.id).await;
    assert_eq!(vm.overcommit, Some(OvercommitRatios::NONE));

    cptestctx
        .nexus
        .cluster_set_overcommit(
            opctx,
            host.cluster_id,
            Some(OvercommitRatios { cpu: 2.0, memory: 1.0 }),
        )
        .await
        .unwrap();
    let outcome = cptestctx
        .nexus
        .host_capacity_reconcile(opctx, host.id)
        .await
        .unwrap();
    assert!(outcome.changed);
    // Booked at 1.0, counted again under 2.0.
    assert_eq!(cpu_ledger(&outcome.capacity), (2000, 0));
    assert_eq!(memory_ledger(&outcome.capacity), (512 * MIB, 0));
    assert_eq!(outcome.capacity.cpu_core.used, 1);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_host_report_recalibrates_totals() {
    let cptestctx =
        NexusTestContext::new("test_host_report_recalibrates_totals").await;
    let opctx = cptestctx.opctx();
    let host = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.create_vm("vm").await;
    cptestctx.start_vm(vm.id, host.id).await;

    // An unchanged report leaves the ledger alone.
    let before = cptestctx.ledger(host.id).await;
    cptestctx.nexus.host_report(opctx, host.clone()).await.unwrap();
    assert_eq!(cptestctx.ledger(host.id).await, before);

    let mut upgraded = host.clone();
    upgraded.hardware.cpu_cores = 8;
    upgraded.hardware.total_memory = ByteCount::from_gibibytes_u32(16);
    let reported = cptestctx.nexus.host_report(opctx, upgraded).await.unwrap();
    assert_eq!(reported.cpu_cores(), 8);

    let ledger = cptestctx.ledger(host.id).await;
    assert_eq!(ledger.get(CapacityType::Cpu).total, 16_000);
    assert_eq!(ledger.get(CapacityType::CpuCore).total, 8);
    assert_eq!(ledger.get(CapacityType::Memory).total, 16 * 1024 * MIB);
    assert_eq!(cpu_ledger(&ledger), (1000, 0));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_host_remove_refuses_occupied_host() {
    let cptestctx =
        NexusTestContext::new("test_host_remove_refuses_occupied_host").await;
    let opctx = cptestctx.opctx();
    let host = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.create_vm("vm").await;
    cptestctx.start_vm(vm.id, host.id).await;

    let error = cptestctx.nexus.host_remove(opctx, host.id).await.unwrap_err();
    assert_matches!(error, Error::Conflict { .. });

    cptestctx.stop_vm(vm.id).await;
    cptestctx.nexus.host_remove(opctx, host.id).await.unwrap();
    assert_matches!(
        cptestctx.nexus.host_fetch(host.id).await,
        Err(Error::ObjectNotFound { .. })
    );

    // A VM whose last host is gone can still start elsewhere.
    let other = cptestctx.create_host(4, 2000, 8).await;
    let vm = cptestctx.start_vm(vm.id, other.id).await;
    assert_eq!(vm.host_id(), Some(other.id));
    assert_eq!(cpu_ledger(&cptestctx.ledger(other.id).await), (1000, 0));
    cptestctx.transit(vm.id, VmEvent::AgentReportStopped, None).await;
    assert_eq!(cpu_ledger(&cptestctx.ledger(other.id).await), (0, 1000));

    cptestctx.cleanup_successful();
}

/// Two small VMs stopped on one host, the first parked past the amnesty
/// window and reconciled so only the second still holds a reservation.
async fn park_two_vms_one_expired(
    cptestctx: &NexusTestContext,
) -> (HostUuid, Vm, Vm) {
    let opctx = cptestctx.opctx();
    let host = cptestctx.create_host(4, 2000, 8).await;
    let expired = cptestctx.create_vm("expired").await;
    let parked = cptestctx.create_vm("parked").await;
    for vm in [&expired, &parked] {
        cptestctx.start_vm(vm.id, host.id).await;
        cptestctx.stop_vm(vm.id).await;
    }
    assert_eq!(cpu_ledger(&cptestctx.ledger(host.id).await), (0, 2000));

    cptestctx.backdate_vm(expired.id, chrono::Duration::hours(48)).await;
    let outcome = cptestctx
        .nexus
        .host_capacity_reconcile(opctx, host.id)
        .await
        .unwrap();
    assert_eq!(outcome.reservations_freed, 1);
    assert_eq!(cpu_ledger(&outcome.capacity), (0, 1000));
    (host.id, expired, parked)
}

async fn assert_ledger_matches_recount(
    cptestctx: &NexusTestContext,
    host_id: HostUuid,
) -> HostCapacity {
    let before = cptestctx.ledger(host_id).await;
    let outcome = cptestctx
        .nexus
        .host_capacity_reconcile(cptestctx.opctx(), host_id)
        .await
        .unwrap();
    assert!(!outcome.changed, "ledger drifted: {before:?}");
    assert_eq!(outcome.capacity, before);
    before
}

#[tokio::test]
async fn test_expired_vm_restart_leaves_other_reservations() {
    let cptestctx = NexusTestContext::new(
        "test_expired_vm_restart_leaves_other_reservations",
    )
    .await;
    let (host_id, expired, parked) =
        park_two_vms_one_expired(&cptestctx).await;

    // The restart books fresh capacity; the other VM keeps its hold.
    cptestctx.start_vm(expired.id, host_id).await;
    let ledger = assert_ledger_matches_recount(&cptestctx, host_id).await;
    assert_eq!(cpu_ledger(&ledger), (1000, 1000));
    assert_eq!(memory_ledger(&ledger), (512 * MIB, 512 * MIB));
    assert_eq!((ledger.cpu_core.used, ledger.cpu_core.reserved), (1, 1));

    // The VM still inside the window draws from its own reservation.
    cptestctx.start_vm(parked.id, host_id).await;
    let ledger = assert_ledger_matches_recount(&cptestctx, host_id).await;
    assert_eq!(cpu_ledger(&ledger), (2000, 0));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_expired_vm_destroy_leaves_other_reservations() {
    let cptestctx = NexusTestContext::new(
        "test_expired_vm_destroy_leaves_other_reservations",
    )
    .await;
    let (host_id, expired, parked) =
        park_two_vms_one_expired(&cptestctx).await;

    cptestctx.transit(expired.id, VmEvent::DestroyRequested, None).await;
    let ledger = assert_ledger_matches_recount(&cptestctx, host_id).await;
    assert_eq!(cpu_ledger(&ledger), (0, 1000));
    assert_eq!(memory_ledger(&ledger), (0, 512 * MIB));

    cptestctx.transit(parked.id, VmEvent::ExpungeOperation, None).await;
    let ledger = assert_ledger_matches_recount(&cptestctx, host_id).await;
    assert_eq!(cpu_ledger(&ledger), (0, 0));
    assert_eq!((ledger.cpu_core.used, ledger.cpu_core.reserved), (0, 0));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_lapsed_reservation_is_not_revived() {
    let cptestctx =
        NexusTestContext::new("test_lapsed_reservation_is_not_revived").await;
    let (host_id, expired, _parked) =
        park_two_vms_one_expired(&cptestctx).await;

    // Touching the stopped VM again doesn't bring the reservation back.
    cptestctx.transit(expired.id, VmEvent::AgentReportStopped, None).await;
    let ledger = assert_ledger_matches_recount(&cptestctx, host_id).await;
    assert_eq!(cpu_ledger(&ledger), (0, 1000));

    cptestctx.cleanup_successful();
}
