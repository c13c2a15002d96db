// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use cirrus_common::api::external::Error;
use cirrus_uuid_kinds::{ClusterUuid, PodUuid, ZoneUuid};
use serde::{Deserialize, Serialize};

/// Multipliers applied to a host's physical capacity to derive the ceiling
/// the scheduler may book against.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OvercommitRatios {
    pub cpu: f64,
    pub memory: f64,
}

impl OvercommitRatios {
    /// No overcommit: book exactly the physical capacity.
    pub const NONE: OvercommitRatios =
        OvercommitRatios { cpu: 1.0, memory: 1.0 };

    pub fn new(cpu: f64, memory: f64) -> Result<Self, Error> {
        let ratios = OvercommitRatios { cpu, memory };
        ratios.validate()?;
        Ok(ratios)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (label, value) in [
            ("cpu_overcommit_ratio", self.cpu),
            ("memory_overcommit_ratio", self.memory),
        ] {
            if !value.is_finite() || value < 1.0 {
                return Err(Error::invalid_value(
                    label,
                    &format!("must be a finite value >= 1.0, got {value}"),
                ));
            }
        }
        Ok(())
    }
}

impl Default for OvercommitRatios {
    fn default() -> Self {
        OvercommitRatios::NONE
    }
}

/// A group of hosts sharing an overcommit policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterUuid,
    pub name: String,
    pub zone_id: ZoneUuid,
    pub pod_id: PodUuid,
    /// Explicit ratios for this cluster. `None` means "use the configured
    /// defaults".
    pub overcommit: Option<OvercommitRatios>,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

impl Cluster {
    pub fn new(
        id: ClusterUuid,
        name: impl Into<String>,
        zone_id: ZoneUuid,
        pod_id: PodUuid,
        overcommit: Option<OvercommitRatios>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            zone_id,
            pod_id,
            overcommit,
            time_created: now,
            time_modified: now,
        }
    }
}
