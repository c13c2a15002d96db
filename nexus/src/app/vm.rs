// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual machines and their lifecycle

use super::vm_lifecycle::VmTransitionContext;
use crate::fsm::{TransitionError, Transitioned};
use cirrus_common::api::external::{CreateResult, ListResultVec, LookupResult};
use cirrus_db_model::{Vm, VmEvent, VmState};
use cirrus_db_queries::context::OpContext;
use cirrus_uuid_kinds::{HostUuid, VmUuid};

/// Errors from [`super::Nexus::vm_transit_to`]
pub type VmTransitionError = TransitionError<VmState, VmEvent>;

impl super::Nexus {
    /// Stores a new VM. The VM starts out `Stopped` on no host.
    pub async fn vm_create(
        &self,
        opctx: &OpContext,
        vm: Vm,
    ) -> CreateResult<Vm> {
        let vm = self.db_datastore.vm_create(opctx, vm).await?;
        info!(
            opctx.log,
            "created vm";
            "vm_id" => %vm.id,
            "name" => &vm.name,
            "service_offering_id" => %vm.service_offering_id,
        );
        Ok(vm)
    }

    pub async fn vm_fetch(&self, vm_id: VmUuid) -> LookupResult<Vm> {
        self.db_datastore.vm_fetch(vm_id).await
    }

    pub async fn vm_list(&self) -> ListResultVec<Vm> {
        self.db_datastore.vm_list().await
    }

    /// Applies `event` to the VM `vm_id`.
    ///
    /// `host_id` is the host the VM is on after the transition: the
    /// placement target for a start or migration, or the host an agent
    /// reports the VM on. When `None`, the VM stays where it is (a failed
    /// migration returns it to its source). It is ignored for transitions
    /// into states that don't occupy a host.
    ///
    /// Host capacity follows the transition; see
    /// [`super::capacity::listener`]. Accounting failures are logged but do
    /// not fail the transition, which has already been persisted.
    pub async fn vm_transit_to(
        &self,
        opctx: &OpContext,
        vm_id: VmUuid,
        event: VmEvent,
        host_id: Option<HostUuid>,
    ) -> Result<Transitioned<Vm>, VmTransitionError> {
        let vm = self.db_datastore.vm_fetch(vm_id).await?;
        let context = VmTransitionContext::for_event(&vm, event, host_id);
        let transitioned = self
            .vm_fsm
            .transit_to(opctx, &self.vm_dao, &vm, event, &context)
            .await?;
        if transitioned.from != transitioned.to {
            info!(
                opctx.log,
                "vm state changed";
                "vm_id" => %vm_id,
                "from" => %transitioned.from,
                "event" => %event,
                "to" => %transitioned.to,
                "host_id" => ?transitioned.entity.host_id(),
            );
        }
        Ok(transitioned)
    }
}
