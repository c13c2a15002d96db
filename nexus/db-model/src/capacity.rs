// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Host;
use chrono::{DateTime, Utc};
use cirrus_uuid_kinds::{ClusterUuid, HostUuid, PodUuid, ZoneUuid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of per-host capacity the ledger tracks.
///
/// The declaration order is the lock acquisition order: any code that locks
/// more than one capacity row of a host must lock them in ascending order of
/// this type.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum CapacityType {
    /// Memory in bytes.
    Memory,
    /// CPU in MHz.
    Cpu,
    /// Physical CPU cores.
    CpuCore,
}

impl CapacityType {
    /// All capacity types, in lock acquisition order.
    pub const ALL: [CapacityType; 3] =
        [CapacityType::Memory, CapacityType::Cpu, CapacityType::CpuCore];

    pub fn label(&self) -> &'static str {
        match self {
            CapacityType::Memory => "memory",
            CapacityType::Cpu => "cpu",
            CapacityType::CpuCore => "cpu_core",
        }
    }

    /// The physical total of this capacity type for `host`.
    pub fn total_for(&self, host: &Host) -> u64 {
        match self {
            CapacityType::Memory => host.total_memory().to_bytes(),
            CapacityType::Cpu => host.total_cpu_mhz(),
            CapacityType::CpuCore => u64::from(host.cpu_cores()),
        }
    }
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityState {
    Enabled,
    Disabled,
}

/// One row of the capacity ledger: a single capacity type on a single host.
///
/// The intended invariant is `used + reserved <= total * overcommit`, but it
/// is not enforced here: allocation for a VM that is already committed to a
/// host proceeds even when it overshoots, and the reconciler restores the
/// invariant from ground truth.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapacityRecord {
    pub host_id: HostUuid,
    pub zone_id: ZoneUuid,
    pub pod_id: PodUuid,
    pub cluster_id: ClusterUuid,
    pub capacity_type: CapacityType,
    pub used: u64,
    pub reserved: u64,
    pub total: u64,
    pub capacity_state: CapacityState,
    pub time_updated: DateTime<Utc>,
}

impl CapacityRecord {
    /// Creates an empty record sized from the host's hardware.
    pub fn new(host: &Host, capacity_type: CapacityType) -> Self {
        Self {
            host_id: host.id,
            zone_id: host.zone_id,
            pod_id: host.pod_id,
            cluster_id: host.cluster_id,
            capacity_type,
            used: 0,
            reserved: 0,
            total: capacity_type.total_for(host),
            capacity_state: host.resource_state.capacity_state(),
            time_updated: Utc::now(),
        }
    }

    /// The schedulable ceiling for this record under `ratio`.
    pub fn total_with_overcommit(&self, ratio: f64) -> u64 {
        overcommitted(self.total, ratio)
    }
}

/// Scales a physical total by an overcommit ratio, truncating toward zero.
pub fn overcommitted(total: u64, ratio: f64) -> u64 {
    (total as f64 * ratio) as u64
}

/// The three capacity records of a single host, as read or locked together.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub memory: CapacityRecord,
    pub cpu: CapacityRecord,
    pub cpu_core: CapacityRecord,
}

impl HostCapacity {
    pub fn new(host: &Host) -> Self {
        Self {
            memory: CapacityRecord::new(host, CapacityType::Memory),
            cpu: CapacityRecord::new(host, CapacityType::Cpu),
            cpu_core: CapacityRecord::new(host, CapacityType::CpuCore),
        }
    }

    pub fn host_id(&self) -> HostUuid {
        self.cpu.host_id
    }

    pub fn get(&self, capacity_type: CapacityType) -> &CapacityRecord {
        match capacity_type {
            CapacityType::Memory => &self.memory,
            CapacityType::Cpu => &self.cpu,
            CapacityType::CpuCore => &self.cpu_core,
        }
    }

    pub fn get_mut(
        &mut self,
        capacity_type: CapacityType,
    ) -> &mut CapacityRecord {
        match capacity_type {
            CapacityType::Memory => &mut self.memory,
            CapacityType::Cpu => &mut self.cpu,
            CapacityType::CpuCore => &mut self.cpu_core,
        }
    }

    /// Iterates over the records in lock acquisition order.
    pub fn records(&self) -> impl Iterator<Item = &CapacityRecord> {
        [&self.memory, &self.cpu, &self.cpu_core].into_iter()
    }

    pub fn set_capacity_state(&mut self, state: CapacityState) {
        for t in CapacityType::ALL {
            self.get_mut(t).capacity_state = state;
        }
    }
}
