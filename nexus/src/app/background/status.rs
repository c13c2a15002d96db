// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime status of background tasks (for support and debugging)

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Describes why a background task was activated
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    Signaled,
    Timeout,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    pub current: CurrentStatus,
    /// Describes the last completed activation
    pub last: LastResult,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "current_status", content = "details")]
pub enum CurrentStatus {
    /// Waiting for the next activation
    Idle,
    Running(CurrentStatusRunning),
}

impl CurrentStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, CurrentStatus::Idle)
    }

    pub fn unwrap_running(&self) -> &CurrentStatusRunning {
        match self {
            CurrentStatus::Running(r) => r,
            CurrentStatus::Idle => {
                panic!("attempted to get running state of idle task")
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CurrentStatusRunning {
    pub start_time: DateTime<Utc>,
    #[serde(skip)]
    pub start_instant: Instant,
    pub reason: ActivationReason,
    pub iteration: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "last_result", content = "details")]
pub enum LastResult {
    NeverCompleted,
    Completed(LastResultCompleted),
}

impl LastResult {
    pub fn has_completed(&self) -> bool {
        matches!(self, LastResult::Completed(_))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LastResultCompleted {
    pub iteration: u64,
    pub start_time: DateTime<Utc>,
    pub reason: ActivationReason,
    pub elapsed: Duration,
    /// whatever the task's `activate` returned
    pub details: serde_json::Value,
}
