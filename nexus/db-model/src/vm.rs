// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{ComputeShape, OvercommitRatios, VmState};
use chrono::{DateTime, Utc};
use cirrus_common::api::external::Generation;
use cirrus_uuid_kinds::{HostUuid, ServiceOfferingUuid, VmUuid};
use serde::{Deserialize, Serialize};

/// The part of a VM record that lifecycle transitions change.
///
/// Updates to this state are generation-checked: a writer must present the
/// generation it read, and the write only lands if nobody else has moved the
/// record in the meantime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VmRuntimeState {
    pub state: VmState,
    /// The host the VM currently occupies, if any.
    pub host_id: Option<HostUuid>,
    /// The host the VM most recently ran on. Used as the preferred host for
    /// a restart and as the owner of any capacity held for the VM while it
    /// is stopped.
    pub last_host_id: Option<HostUuid>,
    #[serde(rename = "state_generation")]
    pub gen: Generation,
    pub time_updated: DateTime<Utc>,
}

impl VmRuntimeState {
    pub fn new_stopped() -> Self {
        Self {
            state: VmState::Stopped,
            host_id: None,
            last_host_id: None,
            gen: Generation::new(),
            time_updated: Utc::now(),
        }
    }
}

/// A virtual machine record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub id: VmUuid,
    pub name: String,
    pub service_offering_id: ServiceOfferingUuid,
    /// Per-VM compute shape for dynamic offerings.
    pub custom_compute: Option<ComputeShape>,
    /// The cluster overcommit ratios in force when this VM was last placed.
    pub overcommit: Option<OvercommitRatios>,
    /// Set once we've announced that this VM's reservation on its last host
    /// was dropped for having been stopped too long.
    pub reserved_capacity_freed_notified: bool,
    pub runtime: VmRuntimeState,
    pub time_created: DateTime<Utc>,
}

impl Vm {
    /// Creates a new VM record in the `Stopped` state.
    pub fn new(
        id: VmUuid,
        name: impl Into<String>,
        service_offering_id: ServiceOfferingUuid,
        custom_compute: Option<ComputeShape>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            service_offering_id,
            custom_compute,
            overcommit: None,
            reserved_capacity_freed_notified: false,
            runtime: VmRuntimeState::new_stopped(),
            time_created: Utc::now(),
        }
    }

    pub fn state(&self) -> VmState {
        self.runtime.state
    }

    pub fn host_id(&self) -> Option<HostUuid> {
        self.runtime.host_id
    }

    pub fn last_host_id(&self) -> Option<HostUuid> {
        self.runtime.last_host_id
    }
}
