// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Vm`]s.

use super::DataStore;
use crate::context::OpContext;
use cirrus_common::api::external::{
    CreateResult, Error, ListResultVec, LookupResult, ResourceType,
    UpdateResult,
};
use cirrus_db_model::{OvercommitRatios, Vm, VmRuntimeState, VmState};
use cirrus_uuid_kinds::{GenericUuid, HostUuid, VmUuid};

fn vm_not_found(vm_id: VmUuid) -> Error {
    Error::not_found_by_id(ResourceType::Vm, vm_id.as_untyped_uuid())
}

impl DataStore {
    /// Stores a new VM record. The VM's service offering must exist.
    pub async fn vm_create(
        &self,
        opctx: &OpContext,
        vm: Vm,
    ) -> CreateResult<Vm> {
        let mut tables = self.tables();
        let offering = tables
            .service_offerings
            .get(&vm.service_offering_id)
            .ok_or_else(|| {
                Error::not_found_by_id(
                    ResourceType::ServiceOffering,
                    vm.service_offering_id.as_untyped_uuid(),
                )
            })?;
        // Fails early for a dynamic offering without a per-VM shape.
        offering.resources_for(vm.custom_compute.as_ref())?;
        if tables.vms.contains_key(&vm.id) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Vm,
                object_name: vm.name.clone(),
            });
        }
        debug!(opctx.log, "created vm"; "vm_id" => %vm.id);
        tables.vms.insert(vm.id, vm.clone());
        Ok(vm)
    }

    pub async fn vm_fetch(&self, vm_id: VmUuid) -> LookupResult<Vm> {
        self.tables()
            .vms
            .get(&vm_id)
            .cloned()
            .ok_or_else(|| vm_not_found(vm_id))
    }

    pub async fn vm_list(&self) -> ListResultVec<Vm> {
        Ok(self.tables().vms.values().cloned().collect())
    }

    /// Updates a VM's runtime state.
    ///
    /// The write only lands if the stored generation is older than the
    /// generation in `new_runtime`, so two writers that read the same record
    /// cannot both succeed.
    ///
    /// # Return value
    ///
    /// - `Ok(true)` if the update was applied.
    /// - `Ok(false)` if the record exists but was not updated because its
    ///   generation has already moved on.
    /// - `Err` if the VM does not exist.
    ///
    /// A VM placed on a host again is eligible for a new reserved-capacity
    /// notification, so this also clears the notified flag in that case.
    pub async fn vm_update_runtime(
        &self,
        vm_id: VmUuid,
        new_runtime: &VmRuntimeState,
    ) -> Result<bool, Error> {
        let mut tables = self.tables();
        let vm = tables.vms.get_mut(&vm_id).ok_or_else(|| vm_not_found(vm_id))?;
        if vm.runtime.gen >= new_runtime.gen {
            debug!(
                self.log,
                "stale VM runtime update";
                "vm_id" => %vm_id,
                "stored_gen" => %vm.runtime.gen,
                "new_gen" => %new_runtime.gen,
            );
            return Ok(false);
        }
        vm.runtime = new_runtime.clone();
        if new_runtime.state.is_up() && new_runtime.host_id.is_some() {
            vm.reserved_capacity_freed_notified = false;
        }
        Ok(true)
    }

    /// Lists VMs that occupy `host_id`: those in an up state whose current
    /// host is `host_id`.
    pub async fn vm_list_up_on_host(
        &self,
        host_id: HostUuid,
    ) -> ListResultVec<Vm> {
        Ok(self
            .tables()
            .vms
            .values()
            .filter(|vm| vm.state().is_up() && vm.host_id() == Some(host_id))
            .cloned()
            .collect())
    }

    /// Lists VMs that last ran on `host_id` and are now parked off any host,
    /// and so may hold reserved capacity there: stopped VMs, and stopped VMs
    /// whose storage is being migrated.
    pub async fn vm_list_parked_by_last_host(
        &self,
        host_id: HostUuid,
    ) -> ListResultVec<Vm> {
        Ok(self
            .tables()
            .vms
            .values()
            .filter(|vm| {
                vm.last_host_id() == Some(host_id)
                    && match vm.state() {
                        VmState::Stopped | VmState::Shutdown => true,
                        VmState::Migrating => vm.host_id().is_none(),
                        _ => false,
                    }
            })
            .cloned()
            .collect())
    }

    pub async fn vm_set_reserved_capacity_freed_notified(
        &self,
        vm_id: VmUuid,
        notified: bool,
    ) -> UpdateResult<()> {
        let mut tables = self.tables();
        let vm = tables.vms.get_mut(&vm_id).ok_or_else(|| vm_not_found(vm_id))?;
        vm.reserved_capacity_freed_notified = notified;
        Ok(())
    }

    /// Records the overcommit ratios in force when the VM was placed.
    pub async fn vm_set_overcommit(
        &self,
        vm_id: VmUuid,
        overcommit: OvercommitRatios,
    ) -> UpdateResult<()> {
        let mut tables = self.tables();
        let vm = tables.vms.get_mut(&vm_id).ok_or_else(|| vm_not_found(vm_id))?;
        vm.overcommit = Some(overcommit);
        Ok(())
    }
}
