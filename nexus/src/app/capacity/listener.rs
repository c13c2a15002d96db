// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives the capacity ledger from VM lifecycle transitions

use super::{CapacityError, CapacityManager};
use crate::app::vm_lifecycle::VmTransitionContext;
use crate::fsm::{StateListener, Transition};
use async_trait::async_trait;
use cirrus_common::api::external::Error;
use cirrus_db_model::{Vm, VmEvent, VmState};
use cirrus_db_queries::context::OpContext;
use std::sync::Arc;

/// Which of a VM's hosts a release applies to
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostRef {
    /// The host the VM was on before the transition.
    Old,
    /// The VM's last host, as recorded after the transition.
    Last,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Release {
    pub host: HostRef,
    pub move_from_reserved: bool,
    pub move_to_reserved: bool,
}

impl Release {
    const fn plain(host: HostRef) -> Self {
        Release { host, move_from_reserved: false, move_to_reserved: false }
    }

    const fn to_reserved(host: HostRef) -> Self {
        Release { host, move_from_reserved: false, move_to_reserved: true }
    }

    const fn from_reserved(host: HostRef) -> Self {
        Release { host, move_from_reserved: true, move_to_reserved: false }
    }
}

/// What a transition does to the ledger before the allocation rule runs
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Accounting {
    /// Nothing to release.
    Neutral,
    /// Release the VM's requirement on each listed host, in order.
    Release(&'static [Release]),
    /// A repeated migration request: if the destination changed, move the
    /// destination's allocation to the new one, otherwise do nothing.
    Retarget,
}

/// Classifies the edge `from --event-->` of the VM transition table.
///
/// Returns `None` for edges with no known accounting, which are logged as
/// anomalies.
pub fn accounting_for(from: VmState, event: VmEvent) -> Option<Accounting> {
    use HostRef::*;
    const OLD: &[Release] = &[Release::plain(Old)];
    const OLD_TO_RESERVED: &[Release] = &[Release::to_reserved(Old)];
    const LAST: &[Release] = &[Release::plain(Last)];
    const LAST_FROM_RESERVED: &[Release] = &[Release::from_reserved(Last)];
    const LAST_AND_OLD: &[Release] =
        &[Release::plain(Last), Release::plain(Old)];

    let accounting = match (from, event) {
        (
            VmState::Stopped,
            VmEvent::StartRequested
            | VmEvent::StopRequested
            | VmEvent::OperationFailed
            | VmEvent::AgentReportStopped
            | VmEvent::AgentReportShutdowned
            | VmEvent::StorageMigrationRequested
            | VmEvent::RestoringRequested,
        ) => Accounting::Neutral,
        (
            VmState::Stopped,
            VmEvent::DestroyRequested | VmEvent::ExpungeOperation,
        ) => Accounting::Release(LAST_FROM_RESERVED),
        (VmState::Stopped, VmEvent::AgentReportMigrated) => {
            Accounting::Release(OLD)
        }

        (
            VmState::Starting,
            VmEvent::OperationRetry
            | VmEvent::OperationFailed
            | VmEvent::AgentReportStopped
            | VmEvent::AgentReportShutdowned,
        ) => Accounting::Release(OLD),
        (
            VmState::Starting,
            VmEvent::OperationSucceeded | VmEvent::AgentReportRunning,
        ) => Accounting::Neutral,

        (
            VmState::Running,
            VmEvent::MigrationRequested
            | VmEvent::StopRequested
            | VmEvent::OperationSucceeded
            | VmEvent::AgentReportRunning,
        ) => Accounting::Neutral,
        (
            VmState::Running,
            VmEvent::AgentReportStopped | VmEvent::AgentReportShutdowned,
        ) => Accounting::Release(OLD_TO_RESERVED),
        (VmState::Running, VmEvent::AgentReportMigrated) => {
            Accounting::Release(OLD)
        }

        (VmState::Migrating, VmEvent::MigrationRequested) => {
            Accounting::Retarget
        }
        (
            VmState::Migrating,
            VmEvent::OperationSucceeded | VmEvent::AgentReportRunning,
        ) => Accounting::Release(LAST),
        (VmState::Migrating, VmEvent::OperationFailed) => {
            Accounting::Release(OLD)
        }
        (
            VmState::Migrating,
            VmEvent::AgentReportStopped
            | VmEvent::AgentReportShutdowned
            | VmEvent::AgentReportMigrated,
        ) => Accounting::Release(LAST_AND_OLD),

        (VmState::Stopping, VmEvent::OperationSucceeded) => {
            Accounting::Release(OLD_TO_RESERVED)
        }
        (
            VmState::Stopping,
            VmEvent::AgentReportStopped
            | VmEvent::AgentReportShutdowned
            | VmEvent::AgentReportMigrated,
        ) => Accounting::Release(OLD),
        (
            VmState::Stopping,
            VmEvent::OperationFailed
            | VmEvent::AgentReportRunning
            | VmEvent::StopRequested,
        ) => Accounting::Neutral,

        (VmState::Shutdown, VmEvent::DestroyRequested) => {
            Accounting::Release(LAST_FROM_RESERVED)
        }
        (
            VmState::Shutdown,
            VmEvent::StopRequested | VmEvent::AgentReportStopped,
        ) => Accounting::Neutral,

        (
            VmState::Destroyed,
            VmEvent::RecoveryRequested | VmEvent::ExpungeOperation,
        )
        | (
            VmState::Expunging,
            VmEvent::ExpungeOperation | VmEvent::OperationFailed,
        )
        | (
            VmState::Error,
            VmEvent::DestroyRequested | VmEvent::ExpungeOperation,
        )
        | (
            VmState::Unknown,
            VmEvent::AgentReportStopped | VmEvent::ExpungeOperation,
        )
        | (
            VmState::Restoring,
            VmEvent::RestoringSuccess | VmEvent::RestoringFailed,
        ) => Accounting::Neutral,

        _ => return None,
    };
    Some(accounting)
}

/// Returns whether a transition into `to` on `event` books the VM on the
/// host it is assigned to afterwards.
fn allocates(to: VmState, event: VmEvent) -> bool {
    matches!(to, VmState::Starting | VmState::Migrating)
        || event == VmEvent::AgentReportMigrated
}

/// The [`StateListener`] that keeps host capacity in step with VM state
pub struct CapacityListener {
    capacity: Arc<CapacityManager>,
}

impl CapacityListener {
    pub fn new(capacity: Arc<CapacityManager>) -> Self {
        CapacityListener { capacity }
    }

    /// Returns whether the VM still held a reservation on its last host
    /// before the transition: it was parked off any host, its reservation
    /// was never announced as freed, and the amnesty window hasn't passed.
    fn holds_reservation(&self, context: &VmTransitionContext) -> bool {
        context
            .parked_since
            .is_some_and(|since| self.capacity.within_amnesty(since))
    }

    async fn release(
        &self,
        opctx: &OpContext,
        vm: &Vm,
        context: &VmTransitionContext,
        release: Release,
    ) -> Result<(), CapacityError> {
        let host_id = match release.host {
            HostRef::Old => context.old_host_id,
            HostRef::Last => vm.last_host_id(),
        };
        if release.move_from_reserved && !self.holds_reservation(context) {
            debug!(
                opctx.log,
                "VM's reservation already lapsed; nothing to release";
                "vm_id" => %vm.id,
                "host_id" => ?host_id,
            );
            return Ok(());
        }
        self.capacity
            .release_vm_capacity(
                opctx,
                vm,
                release.move_from_reserved,
                release.move_to_reserved,
                host_id,
            )
            .await
            .map(|_| ())
    }

    async fn allocate(
        &self,
        opctx: &OpContext,
        vm: &Vm,
        context: &VmTransitionContext,
    ) -> Result<(), CapacityError> {
        let Some(host_id) = vm.host_id() else {
            return Ok(());
        };
        let from_last_host = vm.last_host_id() == Some(host_id)
            && self.holds_reservation(context);
        if from_last_host {
            debug!(
                opctx.log,
                "VM starting again on the last host it ran on";
                "vm_id" => %vm.id,
                "host_id" => %host_id,
            );
        }
        self.capacity.allocate_vm_capacity(opctx, vm, from_last_host).await
    }
}

#[async_trait]
impl StateListener<Vm> for CapacityListener {
    fn name(&self) -> &'static str {
        "capacity"
    }

    async fn after_transition(
        &self,
        opctx: &OpContext,
        transition: &Transition<VmState, VmEvent>,
        vm: &Vm,
        context: &VmTransitionContext,
        success: bool,
    ) -> Result<(), Error> {
        if !success {
            return Ok(());
        }

        let mut first_error: Option<CapacityError> = None;
        // A stopped VM migrating its storage is on no host and holds only
        // its reservation, which it keeps while it stays parked. Coming up on
        // a host books it there like a start.
        let storage_migration = transition.from == VmState::Migrating
            && context.old_host_id.is_none();
        let (accounting, mut allocate) = if storage_migration {
            (Some(Accounting::Neutral), transition.to.is_up())
        } else {
            (
                accounting_for(transition.from, transition.event),
                allocates(transition.to, transition.event),
            )
        };

        match accounting {
            Some(Accounting::Neutral) => (),
            Some(Accounting::Release(releases)) => {
                for release in releases {
                    if let Err(e) =
                        self.release(opctx, vm, context, *release).await
                    {
                        warn!(
                            opctx.log,
                            "failed to release VM capacity";
                            "vm_id" => %vm.id,
                            "release" => ?release,
                            "error" => %e,
                        );
                        first_error.get_or_insert(e);
                    }
                }
            }
            Some(Accounting::Retarget) => {
                if context.old_host_id == vm.host_id() {
                    allocate = false;
                } else if let Err(e) = self
                    .release(opctx, vm, context, Release::plain(HostRef::Old))
                    .await
                {
                    first_error.get_or_insert(e);
                }
            }
            None => {
                warn!(
                    opctx.log,
                    "no capacity accounting for VM transition";
                    "vm_id" => %vm.id,
                    "from" => %transition.from,
                    "event" => %transition.event,
                    "to" => %transition.to,
                );
            }
        }

        if allocate {
            if let Err(e) = self.allocate(opctx, vm, context).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }
}
