// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recomputes a host's capacity ledger from the VMs assigned to it
//!
//! Incremental accounting in the lifecycle listener can drift: a listener
//! failure, a crash between the state write and the ledger write, or a
//! manual database edit all leave the ledger wrong. Reconciling a host
//! throws away its used and reserved counters and recomputes them:
//!
//! * used: every VM that is up on the host;
//! * reserved: every parked VM whose last host is this one and that was
//!   parked within the amnesty window (`skip_counting_secs`). Parked means
//!   stopped, or stopped with its storage being migrated.
//!
//! A VM that stays parked past the window loses its reservation, and a
//! [`CapacityEvent::ReservedCapacityFreed`] is published for it once. It
//! does not get the reservation back until it is placed on a host again.
//!
//! VMs mid-migration are only counted on their destination. The source
//! host's share is under-counted until the migration settles rather than
//! guessed at.

use super::{CapacityError, CapacityManager};
use crate::app::notify::CapacityEvent;
use cirrus_db_model::{
    CapacityType, HostCapacity, OvercommitRatios, Resources, Vm,
};
use cirrus_db_queries::context::OpContext;
use cirrus_uuid_kinds::HostUuid;
use serde::Serialize;

/// What a reconciliation pass did to one host
#[derive(Clone, Debug, Serialize)]
pub struct ReconcileOutcome {
    /// The host's capacity records after the pass.
    pub capacity: HostCapacity,
    /// Whether any record was rewritten.
    pub changed: bool,
    /// How many VMs lost their reservation in this pass.
    pub reservations_freed: usize,
}

#[derive(Debug, Default)]
struct Tally {
    cpu_mhz: u64,
    memory_bytes: u64,
    cpu_cores: u64,
}

impl Tally {
    /// Adds a VM placed under `vm_ratios`, rescaled to `cluster_ratios`.
    fn add(
        &mut self,
        required: &Resources,
        vm_ratios: OvercommitRatios,
        cluster_ratios: OvercommitRatios,
    ) {
        self.cpu_mhz +=
            rescale(required.cpu_mhz, vm_ratios.cpu, cluster_ratios.cpu);
        self.memory_bytes += rescale(
            required.memory_bytes(),
            vm_ratios.memory,
            cluster_ratios.memory,
        );
        self.cpu_cores += u64::from(required.cpu_cores);
    }

    fn get(&self, capacity_type: CapacityType) -> u64 {
        match capacity_type {
            CapacityType::Memory => self.memory_bytes,
            CapacityType::Cpu => self.cpu_mhz,
            CapacityType::CpuCore => self.cpu_cores,
        }
    }
}

fn rescale(amount: u64, from_ratio: f64, to_ratio: f64) -> u64 {
    if from_ratio == to_ratio {
        amount
    } else {
        ((amount as f64 / from_ratio) * to_ratio) as u64
    }
}

impl CapacityManager {
    /// Recomputes the capacity ledger of `host_id` from scratch.
    ///
    /// Safe to run at any time: the result depends only on the host and the
    /// VMs assigned to it, never on what the ledger said before.
    pub async fn update_capacity_for_host(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
    ) -> Result<ReconcileOutcome, CapacityError> {
        let host = self.datastore.host_fetch(host_id).await?;
        self.datastore.host_capacity_init(opctx, &host).await?;
        let cluster_ratios = self.cluster_overcommit(host.cluster_id).await?;

        let mut used = Tally::default();
        for vm in self.datastore.vm_list_up_on_host(host_id).await? {
            let required = self.resolve_requirement(&vm).await?;
            used.add(
                &required,
                vm.overcommit.unwrap_or(cluster_ratios),
                cluster_ratios,
            );
        }

        let mut reserved = Tally::default();
        let mut expired: Vec<Vm> = Vec::new();
        for vm in self.datastore.vm_list_parked_by_last_host(host_id).await? {
            if vm.reserved_capacity_freed_notified {
                continue;
            }
            if self.within_amnesty(vm.runtime.time_updated) {
                let required = self.resolve_requirement(&vm).await?;
                reserved.add(
                    &required,
                    vm.overcommit.unwrap_or(cluster_ratios),
                    cluster_ratios,
                );
            } else {
                expired.push(vm);
            }
        }

        let mut lock =
            self.datastore.host_capacity_lock_for_update(opctx, host_id).await?;
        let before = lock.capacity().clone();
        let capacity_state = host.resource_state.capacity_state();
        let working = lock.capacity_mut();
        for capacity_type in CapacityType::ALL {
            let record = working.get_mut(capacity_type);
            let total = capacity_type.total_for(&host);
            if record.total != total {
                info!(
                    opctx.log,
                    "recalibrating host capacity total";
                    "host_id" => %host_id,
                    "capacity_type" => %capacity_type,
                    "old" => record.total,
                    "new" => total,
                );
                record.total = total;
            }
            record.used = used.get(capacity_type);
            record.reserved = reserved.get(capacity_type);
            record.capacity_state = capacity_state;
        }

        let changed = *lock.capacity() != before;
        let capacity = if changed {
            let after = lock.commit();
            info!(
                opctx.log,
                "reconciled host capacity";
                "host_id" => %host_id,
                "cpu_used" => after.cpu.used,
                "cpu_used_before" => before.cpu.used,
                "cpu_reserved" => after.cpu.reserved,
                "cpu_reserved_before" => before.cpu.reserved,
                "memory_used" => after.memory.used,
                "memory_used_before" => before.memory.used,
                "memory_reserved" => after.memory.reserved,
                "memory_reserved_before" => before.memory.reserved,
            );
            after
        } else {
            drop(lock);
            before
        };

        let mut reservations_freed = 0;
        for vm in expired {
            info!(
                opctx.log,
                "VM stopped past the amnesty window; reservation freed";
                "vm_id" => %vm.id,
                "host_id" => %host_id,
            );
            self.datastore
                .vm_set_reserved_capacity_freed_notified(vm.id, true)
                .await?;
            self.events.publish(CapacityEvent::ReservedCapacityFreed {
                vm_id: vm.id,
                host_id,
            });
            reservations_freed += 1;
        }

        Ok(ReconcileOutcome { capacity, changed, reservations_freed })
    }
}
