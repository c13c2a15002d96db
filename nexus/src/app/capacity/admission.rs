// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only admission checks against the capacity ledger
//!
//! A placement planner uses these to decide whether a host (or cluster) can
//! take a VM before it commits the VM there. Nothing here writes to the
//! ledger.

use super::CapacityManager;
use cirrus_common::api::external::Error;
use cirrus_db_model::{
    CapacityRecord, CapacityState, ComputeShape, Host, HostCapacity,
    OvercommitRatios, ServiceOffering,
};
use cirrus_db_queries::context::OpContext;
use cirrus_uuid_kinds::{ClusterUuid, HostUuid};

/// An amount of CPU and memory to check for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CapacityRequest {
    pub cpu_mhz: u64,
    pub memory_bytes: u64,
}

/// Returns whether `capacity` can take `request`.
///
/// With `check_from_reserved`, only capacity already reserved on the host
/// counts: both CPU and memory reservations must cover the request. This is
/// the check for a VM going back to its last host.
///
/// Otherwise the request must fit in what is left of each of CPU and memory
/// after used capacity (and reserved, with `consider_reserved`) is taken off
/// the overcommitted total. CPU and memory are checked independently and
/// both must pass.
pub fn check_capacity(
    capacity: &HostCapacity,
    request: CapacityRequest,
    check_from_reserved: bool,
    ratios: OvercommitRatios,
    consider_reserved: bool,
) -> bool {
    let (cpu, memory) = (&capacity.cpu, &capacity.memory);
    if check_from_reserved {
        return cpu.reserved >= request.cpu_mhz
            && memory.reserved >= request.memory_bytes;
    }

    let free = |record: &CapacityRecord, ratio: f64| {
        let held = if consider_reserved {
            record.used.saturating_add(record.reserved)
        } else {
            record.used
        };
        record.total_with_overcommit(ratio).saturating_sub(held)
    };
    free(cpu, ratios.cpu) >= request.cpu_mhz
        && free(memory, ratios.memory) >= request.memory_bytes
}

/// Returns whether `host` physically has the cores and per-core speed asked
/// for. Overcommit never applies here.
pub fn has_cpu_capability(host: &Host, cores: u32, speed_mhz: u32) -> bool {
    host.cpu_cores() >= cores && host.cpu_speed_mhz() >= speed_mhz
}

/// Fraction of the overcommitted total of `records` that would be held after
/// adding `requested`, or `None` if there is no capacity at all.
fn consumption<'a>(
    records: impl Iterator<Item = &'a CapacityRecord>,
    requested: u64,
    ratio: f64,
) -> Option<f64> {
    let (held, total) = records.fold((0u64, 0u64), |(held, total), r| {
        (
            held.saturating_add(r.used).saturating_add(r.reserved),
            total.saturating_add(r.total),
        )
    });
    let total = total as f64 * ratio;
    if total <= 0.0 {
        return None;
    }
    Some(held.saturating_add(requested) as f64 / total)
}

impl CapacityManager {
    /// Checks whether a host can take `request`.
    ///
    /// Hosts whose capacity is disabled never can.
    pub async fn check_if_host_has_capacity(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
        request: CapacityRequest,
        check_from_reserved: bool,
        ratios: OvercommitRatios,
        consider_reserved: bool,
    ) -> Result<bool, Error> {
        let capacity = self.datastore.host_capacity_fetch(host_id).await?;
        if capacity.cpu.capacity_state == CapacityState::Disabled {
            debug!(
                opctx.log,
                "host capacity is disabled";
                "host_id" => %host_id,
            );
            return Ok(false);
        }
        let ok = check_capacity(
            &capacity,
            request,
            check_from_reserved,
            ratios,
            consider_reserved,
        );
        debug!(
            opctx.log,
            "checked host capacity";
            "host_id" => %host_id,
            "cpu_requested" => request.cpu_mhz,
            "memory_requested" => request.memory_bytes,
            "from_reserved" => check_from_reserved,
            "consider_reserved" => consider_reserved,
            "cpu_used" => capacity.cpu.used,
            "cpu_reserved" => capacity.cpu.reserved,
            "cpu_total" => capacity.cpu.total,
            "memory_used" => capacity.memory.used,
            "memory_reserved" => capacity.memory.reserved,
            "memory_total" => capacity.memory.total,
            "result" => ok,
        );
        Ok(ok)
    }

    /// Checks whether a host can run a VM built from `offering` (with the
    /// per-VM `custom` shape if the offering is dynamic).
    ///
    /// Returns `(cpu_capable, has_capacity)`. Capacity is only checked for a
    /// CPU-capable host, first against reserved capacity and then against
    /// free capacity under the cluster's overcommit ratios.
    pub async fn check_if_host_has_capacity_and_cpu_capability(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
        offering: &ServiceOffering,
        custom: Option<&ComputeShape>,
        consider_reserved: bool,
    ) -> Result<(bool, bool), Error> {
        let host = self.datastore.host_fetch(host_id).await?;
        let required = offering.resources_for(custom)?;
        let cpu_capable = has_cpu_capability(
            &host,
            required.cpu_cores,
            required.cpu_speed_mhz,
        );
        if !cpu_capable {
            debug!(
                opctx.log,
                "host lacks CPU capability";
                "host_id" => %host_id,
                "cores" => required.cpu_cores,
                "speed_mhz" => required.cpu_speed_mhz,
            );
            return Ok((false, false));
        }

        let ratios = self.cluster_overcommit(host.cluster_id).await?;
        let request = CapacityRequest {
            cpu_mhz: required.cpu_mhz,
            memory_bytes: required.memory_bytes(),
        };
        let has_capacity = self
            .check_if_host_has_capacity(
                opctx,
                host_id,
                request,
                true,
                ratios,
                consider_reserved,
            )
            .await?
            || self
                .check_if_host_has_capacity(
                    opctx,
                    host_id,
                    request,
                    false,
                    ratios,
                    consider_reserved,
                )
                .await?;
        Ok((cpu_capable, has_capacity))
    }

    /// Returns whether placing `request` in the cluster would push its CPU
    /// or memory consumption past the configured disable threshold.
    ///
    /// Consumption is used plus reserved plus the request, over the
    /// overcommitted total of every host in the cluster. A cluster with no
    /// capacity at all always crosses.
    pub async fn check_if_cluster_crosses_threshold(
        &self,
        opctx: &OpContext,
        cluster_id: ClusterUuid,
        request: CapacityRequest,
    ) -> Result<bool, Error> {
        let ratios = self.cluster_overcommit(cluster_id).await?;
        let hosts = self.datastore.cluster_capacity_list(cluster_id).await?;

        let cpu = consumption(
            hosts.iter().map(|h| &h.cpu),
            request.cpu_mhz,
            ratios.cpu,
        );
        let memory = consumption(
            hosts.iter().map(|h| &h.memory),
            request.memory_bytes,
            ratios.memory,
        );

        let crosses = |consumed: Option<f64>, threshold: f64| {
            consumed.map_or(true, |c| c > threshold)
        };
        let result = if crosses(cpu, self.config.cpu_disable_threshold) {
            debug!(
                opctx.log,
                "cluster CPU consumption crosses disable threshold";
                "cluster_id" => %cluster_id,
                "consumption" => ?cpu,
                "threshold" => self.config.cpu_disable_threshold,
            );
            true
        } else if crosses(memory, self.config.memory_disable_threshold) {
            debug!(
                opctx.log,
                "cluster memory consumption crosses disable threshold";
                "cluster_id" => %cluster_id,
                "consumption" => ?memory,
                "threshold" => self.config.memory_disable_threshold,
            );
            true
        } else {
            false
        };
        Ok(result)
    }

    /// Returns whether a host already runs as many VMs as allowed.
    pub async fn check_if_host_reached_max_guests(
        &self,
        host_id: HostUuid,
    ) -> Result<bool, Error> {
        let Some(limit) = self.config.max_guests_per_host else {
            return Ok(false);
        };
        let running = self.datastore.vm_list_up_on_host(host_id).await?;
        Ok(running.len() >= limit as usize)
    }
}
