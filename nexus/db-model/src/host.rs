// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::CapacityState;
use chrono::{DateTime, Utc};
use cirrus_common::api::external::ByteCount;
use cirrus_uuid_kinds::{ClusterUuid, HostUuid, PodUuid, ZoneUuid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The administrative state of a host.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostResourceState {
    Enabled,
    Disabled,
    PrepareForMaintenance,
    Maintenance,
    ErrorInMaintenance,
}

impl HostResourceState {
    /// The capacity state a host in this resource state should advertise.
    pub fn capacity_state(&self) -> CapacityState {
        match self {
            HostResourceState::Enabled => CapacityState::Enabled,
            HostResourceState::Disabled
            | HostResourceState::PrepareForMaintenance
            | HostResourceState::Maintenance
            | HostResourceState::ErrorInMaintenance => CapacityState::Disabled,
        }
    }
}

impl fmt::Display for HostResourceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            HostResourceState::Enabled => "enabled",
            HostResourceState::Disabled => "disabled",
            HostResourceState::PrepareForMaintenance => {
                "prepare_for_maintenance"
            }
            HostResourceState::Maintenance => "maintenance",
            HostResourceState::ErrorInMaintenance => "error_in_maintenance",
        };
        write!(f, "{s}")
    }
}

/// Hardware description of a host as last reported by its agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostHardware {
    pub cpu_cores: u32,
    pub cpu_speed_mhz: u32,
    pub total_memory: ByteCount,
}

/// A hypervisor host that VMs are placed on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostUuid,
    pub name: String,
    pub zone_id: ZoneUuid,
    pub pod_id: PodUuid,
    pub cluster_id: ClusterUuid,
    pub hardware: HostHardware,
    pub resource_state: HostResourceState,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

impl Host {
    pub fn new(
        id: HostUuid,
        name: impl Into<String>,
        zone_id: ZoneUuid,
        pod_id: PodUuid,
        cluster_id: ClusterUuid,
        hardware: HostHardware,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            zone_id,
            pod_id,
            cluster_id,
            hardware,
            resource_state: HostResourceState::Enabled,
            time_created: now,
            time_modified: now,
        }
    }

    pub fn cpu_cores(&self) -> u32 {
        self.hardware.cpu_cores
    }

    pub fn cpu_speed_mhz(&self) -> u32 {
        self.hardware.cpu_speed_mhz
    }

    /// Total CPU capacity in MHz: cores times per-core speed.
    pub fn total_cpu_mhz(&self) -> u64 {
        u64::from(self.hardware.cpu_cores)
            * u64::from(self.hardware.cpu_speed_mhz)
    }

    pub fn total_memory(&self) -> ByteCount {
        self.hardware.total_memory
    }
}
