// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use cirrus_common::api::external::{ByteCount, Error};
use cirrus_uuid_kinds::ServiceOfferingUuid;
use serde::{Deserialize, Serialize};

/// A concrete CPU and memory shape.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ComputeShape {
    pub cpu_cores: u32,
    pub cpu_speed_mhz: u32,
    pub memory: ByteCount,
}

/// How an offering sizes the VMs created from it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "shape", rename_all = "snake_case")]
pub enum OfferingCompute {
    /// Every VM gets this shape.
    Fixed(ComputeShape),
    /// Each VM supplies its own shape at creation time.
    Dynamic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: ServiceOfferingUuid,
    pub name: String,
    pub compute: OfferingCompute,
}

impl ServiceOffering {
    pub fn new(
        id: ServiceOfferingUuid,
        name: impl Into<String>,
        compute: OfferingCompute,
    ) -> Self {
        Self { id, name: name.into(), compute }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.compute, OfferingCompute::Dynamic)
    }

    /// Resolves the resources a VM built from this offering requires.
    ///
    /// Dynamic offerings take the per-VM `custom` shape; static offerings
    /// always use their own shape.
    pub fn resources_for(
        &self,
        custom: Option<&ComputeShape>,
    ) -> Result<Resources, Error> {
        match (&self.compute, custom) {
            (OfferingCompute::Fixed(shape), _) => Ok(Resources::from(*shape)),
            (OfferingCompute::Dynamic, Some(shape)) => {
                Ok(Resources::from(*shape))
            }
            (OfferingCompute::Dynamic, None) => {
                Err(Error::invalid_request(&format!(
                    "service offering {} is dynamic but the VM supplies no \
                     compute shape",
                    self.id
                )))
            }
        }
    }
}

/// The resource requirement of a single VM, in ledger units.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Total CPU demand in MHz (cores times per-core speed).
    pub cpu_mhz: u64,
    pub cpu_cores: u32,
    pub cpu_speed_mhz: u32,
    pub memory: ByteCount,
}

impl Resources {
    pub fn memory_bytes(&self) -> u64 {
        self.memory.to_bytes()
    }
}

impl From<ComputeShape> for Resources {
    fn from(shape: ComputeShape) -> Self {
        Resources {
            cpu_mhz: u64::from(shape.cpu_cores)
                * u64::from(shape.cpu_speed_mhz),
            cpu_cores: shape.cpu_cores,
            cpu_speed_mhz: shape.cpu_speed_mhz,
            memory: shape.memory,
        }
    }
}
