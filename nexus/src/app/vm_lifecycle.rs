// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM lifecycle state machine
//!
//! Every change to a VM's state goes through [`vm_transition_table`] and the
//! [`StateMachine`](crate::fsm::StateMachine) that owns it. The persistence
//! step here also decides where the VM lives afterwards: `host_id` is only
//! set while the VM is up, and `last_host_id` tracks the host whose capacity
//! a stopped VM may still hold, or the source host of a migration.
//!
//! A stopped VM whose storage is being migrated is `Migrating` with no host.
//! It stays parked off its last host until it is reported stopped, or comes
//! up on a host named by the caller; [`HostPlacementCheck`] refuses
//! anything else.

use crate::fsm::{
    Impact, StateDao, StateListener, Stateful, Transition, TransitionTable,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cirrus_common::api::external::Error;
use cirrus_db_model::{Vm, VmEvent, VmRuntimeState, VmState};
use cirrus_db_queries::context::OpContext;
use cirrus_db_queries::db::DataStore;
use cirrus_uuid_kinds::HostUuid;
use std::sync::Arc;

impl Stateful for Vm {
    type State = VmState;
    type Event = VmEvent;
    type Context = VmTransitionContext;

    fn state(&self) -> VmState {
        self.runtime.state
    }
}

/// Where a VM is before and after a transition
///
/// Listeners run after the VM record has been updated, so they can't learn
/// the pre-transition placement from the record itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VmTransitionContext {
    /// The host the VM was assigned to before the transition.
    pub old_host_id: Option<HostUuid>,
    /// The host the VM is assigned to after the transition, if it is up.
    pub new_host_id: Option<HostUuid>,
    /// When the VM was parked off its last host, if it was parked before the
    /// transition and its reservation has not been announced as freed.
    pub parked_since: Option<DateTime<Utc>>,
}

impl VmTransitionContext {
    /// Builds the context for applying `event` to `vm`.
    ///
    /// `requested_host` is the host the caller says the VM is on after the
    /// transition. When it is `None`, the VM stays where it is, except that a
    /// failed live migration returns the VM to its source host.
    pub fn for_event(
        vm: &Vm,
        event: VmEvent,
        requested_host: Option<HostUuid>,
    ) -> Self {
        let old_host_id = vm.host_id();
        let new_host_id = requested_host.or_else(|| {
            match (vm.state(), event) {
                (VmState::Migrating, VmEvent::OperationFailed)
                    if old_host_id.is_some() =>
                {
                    vm.last_host_id()
                }
                _ => old_host_id,
            }
        });
        let parked_since = (old_host_id.is_none()
            && !vm.reserved_capacity_freed_notified)
            .then_some(vm.runtime.time_updated);
        VmTransitionContext { old_host_id, new_host_id, parked_since }
    }
}

/// Refuses transitions that would leave a VM's placement inconsistent
///
/// * A VM can't be running without a host.
/// * A storage migration stays off any host while the VM is migrating.
pub struct HostPlacementCheck;

#[async_trait]
impl StateListener<Vm> for HostPlacementCheck {
    fn name(&self) -> &'static str {
        "host_placement"
    }

    async fn before_transition(
        &self,
        _opctx: &OpContext,
        transition: &Transition<VmState, VmEvent>,
        _vm: &Vm,
        context: &VmTransitionContext,
    ) -> Result<(), String> {
        if transition.to == VmState::Running && context.new_host_id.is_none()
        {
            return Err(format!(
                "VM would be running on no host after {} --{}-->",
                transition.from, transition.event,
            ));
        }
        if transition.to == VmState::Migrating
            && context.old_host_id.is_none()
            && context.new_host_id.is_some()
        {
            return Err(String::from(
                "a stopped VM migrates its storage without a host",
            ));
        }
        Ok(())
    }

    async fn after_transition(
        &self,
        _opctx: &OpContext,
        _transition: &Transition<VmState, VmEvent>,
        _vm: &Vm,
        _context: &VmTransitionContext,
        _success: bool,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Builds the VM transition table.
pub fn vm_transition_table() -> TransitionTable<VmState, VmEvent> {
    use VmEvent::*;
    use VmState::*;
    const USAGE: &[Impact] = &[Impact::Usage];
    const NONE: &[Impact] = &[];

    TransitionTable::builder()
        .add(Stopped, StartRequested, Starting, NONE)
        .add(Stopped, StopRequested, Stopped, NONE)
        .add(Stopped, DestroyRequested, Destroyed, USAGE)
        .add(Stopped, ExpungeOperation, Expunging, USAGE)
        .add(Stopped, OperationFailed, Error, NONE)
        .add(Stopped, AgentReportStopped, Stopped, NONE)
        .add(Stopped, AgentReportShutdowned, Stopped, NONE)
        .add(Stopped, AgentReportMigrated, Stopped, NONE)
        .add(Stopped, StorageMigrationRequested, Migrating, NONE)
        .add(Stopped, RestoringRequested, Restoring, NONE)
        .add(Starting, OperationRetry, Starting, NONE)
        .add(Starting, OperationSucceeded, Running, USAGE)
        .add(Starting, OperationFailed, Stopped, NONE)
        .add(Starting, AgentReportRunning, Running, USAGE)
        .add(Starting, AgentReportStopped, Stopped, NONE)
        .add(Starting, AgentReportShutdowned, Stopped, NONE)
        .add(Running, MigrationRequested, Migrating, NONE)
        .add(Running, StopRequested, Stopping, NONE)
        .add(Running, OperationSucceeded, Running, NONE)
        .add(Running, AgentReportRunning, Running, NONE)
        .add(Running, AgentReportStopped, Stopped, USAGE)
        .add(Running, AgentReportShutdowned, Shutdown, USAGE)
        .add(Running, AgentReportMigrated, Running, NONE)
        .add(Migrating, MigrationRequested, Migrating, NONE)
        .add(Migrating, OperationSucceeded, Running, NONE)
        .add(Migrating, OperationFailed, Running, NONE)
        .add(Migrating, AgentReportRunning, Running, NONE)
        .add(Migrating, AgentReportStopped, Stopped, USAGE)
        .add(Migrating, AgentReportShutdowned, Stopped, USAGE)
        .add(Migrating, AgentReportMigrated, Running, NONE)
        .add(Stopping, OperationSucceeded, Stopped, USAGE)
        .add(Stopping, OperationFailed, Running, NONE)
        .add(Stopping, AgentReportRunning, Running, NONE)
        .add(Stopping, AgentReportStopped, Stopped, USAGE)
        .add(Stopping, AgentReportShutdowned, Stopped, USAGE)
        .add(Stopping, AgentReportMigrated, Stopped, USAGE)
        .add(Stopping, StopRequested, Stopping, NONE)
        .add(Shutdown, StopRequested, Stopped, NONE)
        .add(Shutdown, AgentReportStopped, Stopped, NONE)
        .add(Shutdown, DestroyRequested, Destroyed, NONE)
        .add(Destroyed, RecoveryRequested, Stopped, NONE)
        .add(Destroyed, ExpungeOperation, Expunging, NONE)
        .add(Expunging, ExpungeOperation, Expunging, NONE)
        .add(Expunging, OperationFailed, Expunging, NONE)
        .add(VmState::Error, DestroyRequested, Expunging, NONE)
        .add(VmState::Error, ExpungeOperation, Expunging, NONE)
        .add(Unknown, AgentReportStopped, Stopped, NONE)
        .add(Unknown, ExpungeOperation, Expunging, NONE)
        .add(Restoring, RestoringSuccess, Stopped, NONE)
        .add(Restoring, RestoringFailed, Stopped, NONE)
        .build()
}

/// Computes the runtime state a VM has after `transition`.
pub fn next_runtime(
    current: &VmRuntimeState,
    transition: &Transition<VmState, VmEvent>,
    context: &VmTransitionContext,
) -> VmRuntimeState {
    let from = transition.from;
    let to = transition.to;
    let host_id = if to.is_up() { context.new_host_id } else { None };

    let last_host_id = match (from, transition.event, to) {
        (
            VmState::Starting,
            VmEvent::OperationSucceeded | VmEvent::AgentReportRunning,
            _,
        ) => context.new_host_id,
        (
            VmState::Running | VmState::Stopping,
            _,
            VmState::Stopped | VmState::Shutdown,
        ) => context.old_host_id.or(current.last_host_id),
        (VmState::Running, VmEvent::MigrationRequested, _) => {
            context.old_host_id
        }
        _ => current.last_host_id,
    };

    VmRuntimeState {
        state: to,
        host_id,
        last_host_id,
        gen: current.gen.next(),
        time_updated: Utc::now(),
    }
}

/// Persists VM transitions with a generation check
pub struct VmStateDao {
    datastore: Arc<DataStore>,
}

impl VmStateDao {
    pub fn new(datastore: Arc<DataStore>) -> Self {
        VmStateDao { datastore }
    }
}

#[async_trait]
impl StateDao<Vm> for VmStateDao {
    async fn update_state(
        &self,
        opctx: &OpContext,
        vm: &Vm,
        transition: &Transition<VmState, VmEvent>,
        context: &VmTransitionContext,
    ) -> Result<Option<Vm>, Error> {
        let runtime = next_runtime(&vm.runtime, transition, context);
        let updated =
            self.datastore.vm_update_runtime(vm.id, &runtime).await?;
        if !updated {
            debug!(
                opctx.log,
                "VM runtime update lost a race";
                "vm_id" => %vm.id,
                "gen" => %vm.runtime.gen,
            );
            return Ok(None);
        }
        self.datastore.vm_fetch(vm.id).await.map(Some)
    }

    async fn refetch(&self, vm: &Vm) -> Result<Vm, Error> {
        self.datastore.vm_fetch(vm.id).await
    }
}
