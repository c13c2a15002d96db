// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// The lifecycle state of a VM as recorded by the control plane.
///
/// Every change to this value goes through the VM state machine; nothing
/// else writes it.
#[derive(
    Copy,
    Clone,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
    Expunging,
    Migrating,
    Error,
    Unknown,
    Shutdown,
    Restoring,
}

impl VmState {
    pub fn label(&self) -> &'static str {
        match self {
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Destroyed => "destroyed",
            VmState::Expunging => "expunging",
            VmState::Migrating => "migrating",
            VmState::Error => "error",
            VmState::Unknown => "unknown",
            VmState::Shutdown => "shutdown",
            VmState::Restoring => "restoring",
        }
    }

    /// Returns `true` for states that are expected to be short-lived and
    /// driven toward a follow-up state by the operation that entered them.
    pub fn is_transitional(&self) -> bool {
        match self {
            VmState::Starting
            | VmState::Stopping
            | VmState::Migrating
            | VmState::Expunging
            | VmState::Restoring => true,

            VmState::Running
            | VmState::Stopped
            | VmState::Destroyed
            | VmState::Error
            | VmState::Unknown
            | VmState::Shutdown => false,
        }
    }

    /// Returns `true` if a VM in this state occupies the host it is assigned
    /// to, and therefore counts toward that host's used capacity.
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            VmState::Starting
                | VmState::Running
                | VmState::Stopping
                | VmState::Migrating
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
