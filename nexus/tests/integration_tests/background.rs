// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for the periodic host capacity reconciler

use crate::common::{cpu_ledger, test_config, NexusTestContext};
use cirrus_db_model::HostCapacity;
use cirrus_nexus::app::background::{ActivationReason, LastResult};
use cirrus_test_utils::dev::poll::{wait_for_condition, CondCheckError};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const POLL_MAX: Duration = Duration::from_secs(30);

/// Waits until the reconciler has completed more than `iteration` passes.
async fn wait_for_pass(cptestctx: &NexusTestContext, iteration: u64) -> u64 {
    wait_for_condition::<_, (), _, _>(
        || async move {
            let status = cptestctx
                .nexus
                .host_capacity_reconciler_status()
                .expect("reconciler is registered");
            match status.last {
                LastResult::Completed(last) if last.iteration > iteration => {
                    Ok(last.iteration)
                }
                _ => Err(CondCheckError::NotYet),
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .expect("reconciler did not complete a pass")
}

#[tokio::test]
async fn test_reconciler_runs_when_activated() {
    let mut config = test_config();
    config.background_tasks.host_capacity_reconciler.disable = false;
    // Only the first pass is periodic.
    config.background_tasks.host_capacity_reconciler.period_secs = 3600;
    let cptestctx = NexusTestContext::new_with_config(
        "test_reconciler_runs_when_activated",
        config,
    )
    .await;
    let opctx = cptestctx.opctx();
    let first = wait_for_pass(&cptestctx, 0).await;

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
                capacity.cpu.used = 0;
                capacity.cpu.reserved = 5000;
                Ok::<_, ()>(())
            },
        )
        .await
        .unwrap();

    cptestctx.nexus.host_capacity_reconciler_activate();
    let second = wait_for_pass(&cptestctx, first).await;
    assert!(second > first);
    assert_eq!(cpu_ledger(&cptestctx.ledger(host.id).await), (1000, 0));

    let status = cptestctx.nexus.host_capacity_reconciler_status().unwrap();
    let LastResult::Completed(last) = status.last else {
        panic!("reconciler has not completed: {:?}", status.last);
    };
    assert_eq!(last.reason, ActivationReason::Signaled);
    assert_eq!(last.details["hosts_checked"], 1);
    assert_eq!(last.details["hosts_updated"], 1);
    assert_eq!(last.details["errors"].as_array().map(Vec::len), Some(0));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_disabled_reconciler_is_not_registered() {
    let cptestctx =
        NexusTestContext::new("test_disabled_reconciler_is_not_registered")
            .await;
    assert!(cptestctx.nexus.host_capacity_reconciler_status().is_none());
    let driver = cptestctx.nexus.background_tasks().driver();
    assert_eq!(driver.tasks().count(), 0);
    // Asking for a pass is harmless.
    cptestctx.nexus.host_capacity_reconciler_activate();
    cptestctx.cleanup_successful();
}
