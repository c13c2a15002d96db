// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host capacity accounting
//!
//! The [`CapacityManager`] keeps each host's capacity ledger in step with the
//! VMs placed on it. There are two primitives:
//!
//! * [`CapacityManager::allocate_vm_capacity`] books a VM's requirement as
//!   used on its current host, drawing from the host's reserved capacity when
//!   the VM is restarting where it last ran.
//! * [`CapacityManager::release_vm_capacity`] undoes that, either dropping the
//!   capacity or parking it as reserved for a later restart.
//!
//! [`listener::CapacityListener`] decides which of these to call for each VM
//! lifecycle transition. Because those calls happen after the transition has
//! been persisted, the ledger can drift if one is lost; the reconciler in
//! [`reconciler`] recomputes a host's ledger from the VMs actually on it.

use super::notify::EventBus;
use crate::config::CapacityConfig;
use chrono::{DateTime, Utc};
use cirrus_common::api::external::Error;
use cirrus_db_model::{
    CapacityRecord, CapacityType, HostCapacity, OvercommitRatios, Resources,
    Vm,
};
use cirrus_db_queries::context::OpContext;
use cirrus_db_queries::db::{DataStore, LockError, TransactionError};
use cirrus_uuid_kinds::{ClusterUuid, HostUuid};
use slog::Logger;
use std::sync::Arc;

pub mod admission;
pub mod listener;
mod overcommit;
pub mod reconciler;

pub use admission::CapacityRequest;
pub use overcommit::ClusterOvercommitCache;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum InsufficientCapacityReason {
    #[error(
        "host has {host_cores} cores at {host_speed_mhz} MHz, VM needs \
         {cores} cores at {speed_mhz} MHz"
    )]
    CpuCapability {
        cores: u32,
        speed_mhz: u32,
        host_cores: u32,
        host_speed_mhz: u32,
    },

    #[error(
        "{capacity_type} used {used} + reserved {reserved} exceeds \
         {total_with_overcommit}"
    )]
    Capacity {
        capacity_type: CapacityType,
        used: u64,
        reserved: u64,
        total_with_overcommit: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    /// The host's capacity rows stayed locked past the configured timeout.
    #[error("timed out waiting for capacity locks of host {host_id}")]
    LockTimeout { host_id: HostUuid },

    /// The VM's requirement was booked but the host is now over its limits.
    #[error("insufficient capacity on host {host_id}: {reason}")]
    InsufficientCapacity {
        host_id: HostUuid,
        reason: InsufficientCapacityReason,
    },

    #[error(transparent)]
    Store(#[from] Error),
}

impl CapacityError {
    pub fn retryable(&self) -> bool {
        match self {
            CapacityError::LockTimeout { .. } => true,
            CapacityError::InsufficientCapacity { .. } => false,
            CapacityError::Store(e) => e.retryable(),
        }
    }
}

impl From<LockError> for CapacityError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { host_id, .. } => {
                CapacityError::LockTimeout { host_id }
            }
            LockError::NotFound { .. } => CapacityError::Store(e.into()),
        }
    }
}

impl From<TransactionError<CapacityError>> for CapacityError {
    fn from(e: TransactionError<CapacityError>) -> Self {
        match e {
            TransactionError::Lock(e) => e.into(),
            TransactionError::CustomError(e) => e,
        }
    }
}

impl From<CapacityError> for Error {
    fn from(e: CapacityError) -> Self {
        match e {
            CapacityError::LockTimeout { .. } => Error::unavail(&e.to_string()),
            CapacityError::InsufficientCapacity { .. } => {
                Error::insufficient_capacity(
                    "insufficient capacity on the selected host",
                    e.to_string(),
                )
            }
            CapacityError::Store(e) => e,
        }
    }
}

/// Books VM requirements against host capacity records
pub struct CapacityManager {
    log: Logger,
    datastore: Arc<DataStore>,
    config: CapacityConfig,
    overcommit: ClusterOvercommitCache,
    events: EventBus,
}

impl CapacityManager {
    pub fn new(
        log: &Logger,
        datastore: Arc<DataStore>,
        config: CapacityConfig,
        events: EventBus,
    ) -> Self {
        let overcommit =
            ClusterOvercommitCache::new(config.default_overcommit());
        CapacityManager {
            log: log.new(o!("component" => "CapacityManager")),
            datastore,
            config,
            overcommit,
            events,
        }
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    pub fn config(&self) -> &CapacityConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Drops the cached overcommit ratios of `cluster_id`. Anything that
    /// changes a cluster's ratios must call this.
    pub fn invalidate_cluster_overcommit(&self, cluster_id: ClusterUuid) {
        debug!(
            self.log,
            "invalidating cached overcommit ratios";
            "cluster_id" => %cluster_id,
        );
        self.overcommit.invalidate(cluster_id);
    }

    pub async fn cluster_overcommit(
        &self,
        cluster_id: ClusterUuid,
    ) -> Result<OvercommitRatios, Error> {
        self.overcommit.get(&self.datastore, cluster_id).await
    }

    /// Returns whether a VM parked off its last host since `since` is still
    /// inside the amnesty window, and so still holds its reservation there.
    pub fn within_amnesty(&self, since: DateTime<Utc>) -> bool {
        let parked_for = (Utc::now() - since).to_std().unwrap_or_default();
        parked_for < self.config.skip_counting()
    }

    /// Resolves what `vm` requires from its host.
    pub async fn resolve_requirement(
        &self,
        vm: &Vm,
    ) -> Result<Resources, Error> {
        let offering = self
            .datastore
            .service_offering_fetch(vm.service_offering_id)
            .await?;
        offering.resources_for(vm.custom_compute.as_ref())
    }

    /// Books `vm`'s requirement as used on the host it is assigned to.
    ///
    /// With `from_last_host`, the VM is restarting on the host it last ran
    /// on, and the requirement moves from reserved to used if enough is
    /// reserved. Otherwise it is added to used even if that overshoots the
    /// host's limits, since the VM is already committed to the host.
    ///
    /// The host is checked afterwards. If it lacks the VM's CPU shape or is
    /// over its limits this fails with
    /// [`CapacityError::InsufficientCapacity`], but the booking stays: the
    /// caller must move the VM elsewhere (or reconcile).
    pub async fn allocate_vm_capacity(
        &self,
        opctx: &OpContext,
        vm: &Vm,
        from_last_host: bool,
    ) -> Result<(), CapacityError> {
        let Some(host_id) = vm.host_id() else {
            debug!(
                opctx.log,
                "VM has no host; nothing to allocate";
                "vm_id" => %vm.id,
            );
            return Ok(());
        };
        let host = self.datastore.host_fetch(host_id).await?;
        let ratios = self.cluster_overcommit(host.cluster_id).await?;
        self.datastore.vm_set_overcommit(vm.id, ratios).await?;
        let required = self.resolve_requirement(vm).await?;

        let log = &opctx.log;
        let capacity = self
            .datastore
            .host_capacity_transaction_with_retry(
                opctx,
                host_id,
                "allocate_vm_capacity",
                |capacity: &mut HostCapacity| {
                    book_used(log, capacity, &required, ratios, from_last_host);
                    Ok::<_, CapacityError>(capacity.clone())
                },
            )
            .await?;

        info!(
            opctx.log,
            "allocated VM capacity";
            "vm_id" => %vm.id,
            "host_id" => %host_id,
            "from_last_host" => from_last_host,
            "cpu_used" => capacity.cpu.used,
            "cpu_reserved" => capacity.cpu.reserved,
            "memory_used" => capacity.memory.used,
            "memory_reserved" => capacity.memory.reserved,
        );

        let check = if !admission::has_cpu_capability(
            &host,
            required.cpu_cores,
            required.cpu_speed_mhz,
        ) {
            Err(InsufficientCapacityReason::CpuCapability {
                cores: required.cpu_cores,
                speed_mhz: required.cpu_speed_mhz,
                host_cores: host.cpu_cores(),
                host_speed_mhz: host.cpu_speed_mhz(),
            })
        } else {
            within_limits(&capacity.cpu, ratios.cpu)
                .and_then(|()| within_limits(&capacity.memory, ratios.memory))
        };
        check.map_err(|reason| {
            warn!(
                opctx.log,
                "host over capacity after allocation";
                "vm_id" => %vm.id,
                "host_id" => %host_id,
                "reason" => %reason,
            );
            CapacityError::InsufficientCapacity { host_id, reason }
        })
    }

    /// Gives back `vm`'s requirement on `host_id`.
    ///
    /// Normally the requirement comes out of used capacity; with
    /// `move_to_reserved` it is parked as reserved (capped at the host's
    /// limit) so the VM can restart there. With `move_from_reserved` it comes
    /// out of reserved capacity instead of used. Counters never go below
    /// zero.
    ///
    /// Returns `false` if there was nothing to release against.
    pub async fn release_vm_capacity(
        &self,
        opctx: &OpContext,
        vm: &Vm,
        move_from_reserved: bool,
        move_to_reserved: bool,
        host_id: Option<HostUuid>,
    ) -> Result<bool, CapacityError> {
        let Some(host_id) = host_id else {
            return Ok(false);
        };
        let host = match self.datastore.host_fetch(host_id).await {
            Ok(host) => host,
            Err(Error::ObjectNotFound { .. }) => {
                warn!(
                    opctx.log,
                    "releasing VM capacity on a host that no longer exists";
                    "vm_id" => %vm.id,
                    "host_id" => %host_id,
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let ratios = self.cluster_overcommit(host.cluster_id).await?;
        let required = self.resolve_requirement(vm).await?;

        let log = &opctx.log;
        let capacity = self
            .datastore
            .host_capacity_transaction_with_retry(
                opctx,
                host_id,
                "release_vm_capacity",
                |capacity: &mut HostCapacity| {
                    give_back(
                        log,
                        capacity,
                        &required,
                        ratios,
                        move_from_reserved,
                        move_to_reserved,
                    );
                    Ok::<_, CapacityError>(capacity.clone())
                },
            )
            .await?;

        info!(
            opctx.log,
            "released VM capacity";
            "vm_id" => %vm.id,
            "host_id" => %host_id,
            "move_from_reserved" => move_from_reserved,
            "move_to_reserved" => move_to_reserved,
            "cpu_used" => capacity.cpu.used,
            "cpu_reserved" => capacity.cpu.reserved,
            "memory_used" => capacity.memory.used,
            "memory_reserved" => capacity.memory.reserved,
        );
        Ok(true)
    }
}

/// The amount of each capacity type `required` accounts for.
fn amounts(required: &Resources) -> [(CapacityType, u64); 3] {
    [
        (CapacityType::Memory, required.memory_bytes()),
        (CapacityType::Cpu, required.cpu_mhz),
        (CapacityType::CpuCore, u64::from(required.cpu_cores)),
    ]
}

fn ratio_for(capacity_type: CapacityType, ratios: OvercommitRatios) -> f64 {
    match capacity_type {
        CapacityType::Memory => ratios.memory,
        CapacityType::Cpu => ratios.cpu,
        CapacityType::CpuCore => 1.0,
    }
}

fn book_used(
    log: &Logger,
    capacity: &mut HostCapacity,
    required: &Resources,
    ratios: OvercommitRatios,
    from_last_host: bool,
) {
    let reserved_suffices = from_last_host
        && capacity.cpu.reserved >= required.cpu_mhz
        && capacity.memory.reserved >= required.memory_bytes();
    if from_last_host && !reserved_suffices {
        debug!(
            log,
            "not enough reserved on last host; allocating from free capacity";
            "host_id" => %capacity.host_id(),
        );
    }

    for (capacity_type, amount) in amounts(required) {
        let record = capacity.get_mut(capacity_type);
        if reserved_suffices {
            record.reserved = record.reserved.saturating_sub(amount);
        } else if record.used + record.reserved + amount
            > record.total_with_overcommit(ratio_for(capacity_type, ratios))
        {
            debug!(
                log,
                "host lacks free capacity, booking anyway since the VM is \
                 already placed";
                "host_id" => %record.host_id,
                "capacity_type" => %capacity_type,
            );
        }
        record.used += amount;
    }
}

fn give_back(
    log: &Logger,
    capacity: &mut HostCapacity,
    required: &Resources,
    ratios: OvercommitRatios,
    move_from_reserved: bool,
    move_to_reserved: bool,
) {
    for (capacity_type, amount) in amounts(required) {
        let record = capacity.get_mut(capacity_type);
        if move_from_reserved {
            record.reserved =
                clamped_sub(log, record, "reserved", record.reserved, amount);
            continue;
        }
        record.used = clamped_sub(log, record, "used", record.used, amount);
        if move_to_reserved {
            let cap = match capacity_type {
                CapacityType::CpuCore => record.total,
                _ => record
                    .total_with_overcommit(ratio_for(capacity_type, ratios)),
            };
            record.reserved = (record.reserved + amount).min(cap);
        }
    }
}

/// Subtracts `amount` from a ledger counter, clamping at zero.
fn clamped_sub(
    log: &Logger,
    record: &CapacityRecord,
    counter: &'static str,
    value: u64,
    amount: u64,
) -> u64 {
    if value < amount {
        warn!(
            log,
            "capacity counter would go negative; clamping to zero";
            "host_id" => %record.host_id,
            "capacity_type" => %record.capacity_type,
            "counter" => counter,
            "value" => value,
            "amount" => amount,
        );
    }
    value.saturating_sub(amount)
}

fn within_limits(
    record: &CapacityRecord,
    ratio: f64,
) -> Result<(), InsufficientCapacityReason> {
    let total_with_overcommit = record.total_with_overcommit(ratio);
    if record.used + record.reserved > total_with_overcommit {
        return Err(InsufficientCapacityReason::Capacity {
            capacity_type: record.capacity_type,
            used: record.used,
            reserved: record.reserved,
            total_with_overcommit,
        });
    }
    Ok(())
}
