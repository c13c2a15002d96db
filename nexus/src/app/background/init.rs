// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task initialization

use super::status::TaskStatus;
use super::tasks::host_capacity_reconciler::HostCapacityReconciler;
use super::Driver;
use super::TaskName;
use crate::app::capacity::CapacityManager;
use crate::config::BackgroundTaskConfig;
use cirrus_db_queries::context::OpContext;
use cirrus_db_queries::db::DataStore;
use std::sync::Arc;

/// Handle to the background tasks started by Nexus
///
/// Owns the [`Driver`]; dropping this stops every task.
pub struct BackgroundTasks {
    driver: Driver,
    /// `None` when the task was disabled by configuration
    task_host_capacity_reconciler: Option<TaskName>,
}

impl BackgroundTasks {
    /// Kick off all background tasks
    pub fn start(
        opctx: &OpContext,
        datastore: Arc<DataStore>,
        capacity: Arc<CapacityManager>,
        config: &BackgroundTaskConfig,
    ) -> BackgroundTasks {
        let mut driver = Driver::new();

        let reconciler_config = &config.host_capacity_reconciler;
        let task_host_capacity_reconciler = if reconciler_config.disable {
            info!(
                opctx.log,
                "background task disabled by configuration";
                "task" => "host_capacity_reconciler",
            );
            None
        } else {
            Some(driver.register(
                String::from("host_capacity_reconciler"),
                String::from(
                    "recomputes host capacity from the VMs on each host and \
                     frees expired reservations",
                ),
                reconciler_config.period(),
                Box::new(HostCapacityReconciler::new(datastore, capacity)),
                opctx,
            ))
        };

        BackgroundTasks { driver, task_host_capacity_reconciler }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Wakes up the host capacity reconciler. Does nothing if it's disabled.
    pub fn activate_host_capacity_reconciler(&self) {
        if let Some(task) = &self.task_host_capacity_reconciler {
            self.driver.activate(task);
        }
    }

    pub fn host_capacity_reconciler_status(&self) -> Option<TaskStatus> {
        self.task_host_capacity_reconciler
            .as_ref()
            .map(|task| self.driver.task_status(task))
    }

    pub fn host_capacity_reconciler(&self) -> Option<&TaskName> {
        self.task_host_capacity_reconciler.as_ref()
    }
}
