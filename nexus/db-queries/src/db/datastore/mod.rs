// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary control plane interface for datastore access
//!
//! The control plane needs three things from its store: load a record by
//! id, update a set of records transactionally, and lock a record for update
//! with a bounded wait. [`DataStore`] provides exactly that contract,
//! in-process.
//!
//! Records that are read and written whole (hosts, clusters, offerings,
//! VMs) live in ordinary maps behind a single synchronous mutex that is never
//! held across an await point. VM runtime updates are generation-checked
//! rather than locked. Capacity records are the only rows that callers lock
//! for the duration of a read-modify-write, so each one gets its own
//! asynchronous mutex; see [`capacity`] for the locking discipline.

use super::Config;
use cirrus_db_model::{Cluster, Host, ServiceOffering, Vm};
use cirrus_uuid_kinds::{ClusterUuid, HostUuid, ServiceOfferingUuid, VmUuid};
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub mod capacity;
mod cluster;
mod host;
mod service_offering;
mod vm;

pub use capacity::HostCapacityLock;

#[derive(Default)]
struct Tables {
    clusters: BTreeMap<ClusterUuid, Cluster>,
    hosts: BTreeMap<HostUuid, Host>,
    service_offerings: BTreeMap<ServiceOfferingUuid, ServiceOffering>,
    vms: BTreeMap<VmUuid, Vm>,
}

pub struct DataStore {
    log: Logger,
    lock_timeout: Duration,
    tables: Mutex<Tables>,
    capacity: Mutex<BTreeMap<HostUuid, Arc<capacity::CapacityRows>>>,
}

impl DataStore {
    pub fn new(log: &Logger, config: &Config) -> Self {
        let log = log.new(o!("component" => "datastore"));
        info!(log, "created datastore"; "lock_timeout" => ?config.lock_timeout);
        DataStore {
            log,
            lock_timeout: config.lock_timeout,
            tables: Mutex::new(Tables::default()),
            capacity: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap()
    }
}
