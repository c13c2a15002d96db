// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Symbolic triggers that drive a VM between lifecycle states.
///
/// Events come from two places: callers asking for something to happen
/// (user intent), and hypervisor agents telling us what they observed out of
/// band. The transition table accepts both kinds uniformly.
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
pub enum VmEvent {
    StartRequested,
    StopRequested,
    DestroyRequested,
    RecoveryRequested,
    MigrationRequested,
    StorageMigrationRequested,
    ExpungeOperation,
    OperationRetry,
    OperationSucceeded,
    OperationFailed,
    RestoringRequested,
    RestoringSuccess,
    RestoringFailed,
    AgentReportRunning,
    AgentReportStopped,
    AgentReportShutdowned,
    AgentReportMigrated,
}

impl VmEvent {
    pub fn label(&self) -> &'static str {
        match self {
            VmEvent::StartRequested => "start_requested",
            VmEvent::StopRequested => "stop_requested",
            VmEvent::DestroyRequested => "destroy_requested",
            VmEvent::RecoveryRequested => "recovery_requested",
            VmEvent::MigrationRequested => "migration_requested",
            VmEvent::StorageMigrationRequested => {
                "storage_migration_requested"
            }
            VmEvent::ExpungeOperation => "expunge_operation",
            VmEvent::OperationRetry => "operation_retry",
            VmEvent::OperationSucceeded => "operation_succeeded",
            VmEvent::OperationFailed => "operation_failed",
            VmEvent::RestoringRequested => "restoring_requested",
            VmEvent::RestoringSuccess => "restoring_success",
            VmEvent::RestoringFailed => "restoring_failed",
            VmEvent::AgentReportRunning => "agent_report_running",
            VmEvent::AgentReportStopped => "agent_report_stopped",
            VmEvent::AgentReportShutdowned => "agent_report_shutdowned",
            VmEvent::AgentReportMigrated => "agent_report_migrated",
        }
    }

    /// Returns `true` for events reported by a hypervisor agent rather than
    /// requested by a caller.
    pub fn is_observed(&self) -> bool {
        matches!(
            self,
            VmEvent::AgentReportRunning
                | VmEvent::AgentReportStopped
                | VmEvent::AgentReportShutdowned
                | VmEvent::AgentReportMigrated
        )
    }

    pub fn is_user_intent(&self) -> bool {
        !self.is_observed()
    }
}

impl fmt::Display for VmEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
