// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on host capacity records.
//!
//! Each host has three capacity rows (memory, CPU, CPU cores), and each row
//! has its own lock. Anything that locks more than one row of a host locks
//! them in ascending [`CapacityType`] order, and every wait for a row lock is
//! bounded by the datastore's lock timeout. Together these mean two
//! operations on the same host serialize rather than deadlock, and a stuck
//! holder surfaces as a retryable [`LockError::Timeout`] rather than a hang.
//!
//! At most one host's rows are held at a time by any operation here.

use super::DataStore;
use crate::context::OpContext;
use crate::db::{LockError, TransactionError};
use crate::transaction_retry::RetryHelper;
use chrono::Utc;
use cirrus_common::api::external::{
    CreateResult, DeleteResult, ListResultVec, LookupResult, UpdateResult,
};
use cirrus_db_model::{
    CapacityRecord, CapacityState, CapacityType, Host, HostCapacity,
};
use cirrus_uuid_kinds::{ClusterUuid, HostUuid};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Row = Arc<Mutex<CapacityRecord>>;

pub(crate) struct CapacityRows {
    cluster_id: ClusterUuid,
    memory: Row,
    cpu: Row,
    cpu_core: Row,
}

impl CapacityRows {
    fn new(capacity: HostCapacity) -> Self {
        CapacityRows {
            cluster_id: capacity.cpu.cluster_id,
            memory: Arc::new(Mutex::new(capacity.memory)),
            cpu: Arc::new(Mutex::new(capacity.cpu)),
            cpu_core: Arc::new(Mutex::new(capacity.cpu_core)),
        }
    }

    fn row(&self, capacity_type: CapacityType) -> &Row {
        match capacity_type {
            CapacityType::Memory => &self.memory,
            CapacityType::Cpu => &self.cpu,
            CapacityType::CpuCore => &self.cpu_core,
        }
    }
}

/// The capacity rows of one host, locked for update.
///
/// Changes made through [`HostCapacityLock::capacity_mut`] are written back
/// only by [`HostCapacityLock::commit`]. Dropping the lock without committing
/// discards them and releases the rows.
pub struct HostCapacityLock {
    memory: OwnedMutexGuard<CapacityRecord>,
    cpu: OwnedMutexGuard<CapacityRecord>,
    cpu_core: OwnedMutexGuard<CapacityRecord>,
    working: HostCapacity,
}

impl HostCapacityLock {
    pub fn host_id(&self) -> HostUuid {
        self.working.host_id()
    }

    pub fn capacity(&self) -> &HostCapacity {
        &self.working
    }

    pub fn capacity_mut(&mut self) -> &mut HostCapacity {
        &mut self.working
    }

    /// Writes the working copy back to the rows and releases them.
    pub fn commit(self) -> HostCapacity {
        let HostCapacityLock {
            mut memory,
            mut cpu,
            mut cpu_core,
            mut working,
        } = self;
        let now = Utc::now();
        for (guard, record) in [
            (&mut memory, &mut working.memory),
            (&mut cpu, &mut working.cpu),
            (&mut cpu_core, &mut working.cpu_core),
        ] {
            if **guard != *record {
                record.time_updated = now;
                **guard = record.clone();
            }
        }
        working
    }
}

impl DataStore {
    fn capacity_rows(
        &self,
        host_id: HostUuid,
    ) -> Result<Arc<CapacityRows>, LockError> {
        self.capacity
            .lock()
            .unwrap()
            .get(&host_id)
            .cloned()
            .ok_or(LockError::NotFound { host_id })
    }

    async fn capacity_lock_row(
        &self,
        host_id: HostUuid,
        rows: &CapacityRows,
        capacity_type: CapacityType,
    ) -> Result<OwnedMutexGuard<CapacityRecord>, LockError> {
        let row = Arc::clone(rows.row(capacity_type));
        tokio::time::timeout(self.lock_timeout, row.lock_owned()).await.map_err(
            |_| LockError::Timeout {
                host_id,
                capacity_type,
                timeout: self.lock_timeout,
            },
        )
    }

    async fn capacity_lock_rows(
        &self,
        host_id: HostUuid,
        rows: &CapacityRows,
    ) -> Result<HostCapacityLock, LockError> {
        // Lock order: memory, cpu, cpu_core. See the module docs.
        let memory =
            self.capacity_lock_row(host_id, rows, CapacityType::Memory).await?;
        let cpu =
            self.capacity_lock_row(host_id, rows, CapacityType::Cpu).await?;
        let cpu_core = self
            .capacity_lock_row(host_id, rows, CapacityType::CpuCore)
            .await?;
        let working = HostCapacity {
            memory: (*memory).clone(),
            cpu: (*cpu).clone(),
            cpu_core: (*cpu_core).clone(),
        };
        Ok(HostCapacityLock { memory, cpu, cpu_core, working })
    }

    /// Creates the capacity records of a host that has just reported in.
    ///
    /// If the host already has records they are returned unchanged.
    pub async fn host_capacity_init(
        &self,
        opctx: &OpContext,
        host: &Host,
    ) -> CreateResult<HostCapacity> {
        {
            let mut capacity = self.capacity.lock().unwrap();
            if !capacity.contains_key(&host.id) {
                let records = HostCapacity::new(host);
                info!(
                    opctx.log,
                    "created host capacity records";
                    "host_id" => %host.id,
                    "cpu_mhz" => records.cpu.total,
                    "memory_bytes" => records.memory.total,
                    "cpu_cores" => records.cpu_core.total,
                );
                capacity.insert(host.id, Arc::new(CapacityRows::new(records)));
            }
        }
        self.host_capacity_fetch(host.id).await
    }

    /// Removes the capacity records of a host. Removing records that do not
    /// exist is not an error.
    pub async fn host_capacity_delete(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
    ) -> DeleteResult {
        if self.capacity.lock().unwrap().remove(&host_id).is_some() {
            info!(
                opctx.log,
                "removed host capacity records";
                "host_id" => %host_id,
            );
        }
        Ok(())
    }

    /// Reads a consistent snapshot of a host's capacity records.
    pub async fn host_capacity_fetch(
        &self,
        host_id: HostUuid,
    ) -> LookupResult<HostCapacity> {
        let rows = self.capacity_rows(host_id)?;
        let lock = self.capacity_lock_rows(host_id, &rows).await?;
        Ok(lock.working)
    }

    /// Locks all of a host's capacity records for update.
    ///
    /// The caller may await while holding the returned lock (for example, to
    /// read VM records), but should not lock any other host's capacity in
    /// the meantime.
    pub async fn host_capacity_lock_for_update(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
    ) -> Result<HostCapacityLock, LockError> {
        let rows = self.capacity_rows(host_id)?;
        let lock = self.capacity_lock_rows(host_id, &rows).await;
        if let Err(error) = &lock {
            info!(
                opctx.log,
                "failed to lock host capacity";
                "host_id" => %host_id,
                "error" => %error,
            );
        }
        lock
    }

    /// Runs `f` against a host's capacity records with all three rows
    /// locked.
    ///
    /// If `f` succeeds, whatever it left in the records is committed. If it
    /// fails, nothing is written.
    pub async fn host_capacity_transaction<T, E, F>(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
        f: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(&mut HostCapacity) -> Result<T, E>,
    {
        let mut lock =
            self.host_capacity_lock_for_update(opctx, host_id).await?;
        let value =
            f(lock.capacity_mut()).map_err(TransactionError::CustomError)?;
        lock.commit();
        Ok(value)
    }

    /// Like [`DataStore::host_capacity_transaction`], but retries with a
    /// short randomized backoff when the row locks cannot be taken in time.
    pub async fn host_capacity_transaction_with_retry<T, E, F>(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
        name: &'static str,
        mut f: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnMut(&mut HostCapacity) -> Result<T, E>,
    {
        let retry_helper = RetryHelper::new(&opctx.log, name);
        loop {
            match self.host_capacity_transaction(opctx, host_id, &mut f).await {
                Err(err) if err.retry_transaction() => {
                    if !retry_helper.retry_callback().await {
                        return Err(err);
                    }
                }
                result => return result,
            }
        }
    }

    /// Sets the capacity state of all of a host's capacity records.
    pub async fn set_host_capacity_state(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
        state: CapacityState,
    ) -> UpdateResult<HostCapacity> {
        let mut lock =
            self.host_capacity_lock_for_update(opctx, host_id).await?;
        lock.capacity_mut().set_capacity_state(state);
        debug!(
            opctx.log,
            "set host capacity state";
            "host_id" => %host_id,
            "state" => ?state,
        );
        Ok(lock.commit())
    }

    /// Reads the capacity records of every host in a cluster.
    ///
    /// Each host's records are a consistent snapshot, but hosts are read one
    /// at a time, so the result as a whole is not.
    pub async fn cluster_capacity_list(
        &self,
        cluster_id: ClusterUuid,
    ) -> ListResultVec<HostCapacity> {
        let hosts: Vec<_> = self
            .capacity
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, rows)| rows.cluster_id == cluster_id)
            .map(|(host_id, rows)| (*host_id, Arc::clone(rows)))
            .collect();
        let mut result = Vec::with_capacity(hosts.len());
        for (host_id, rows) in hosts {
            let lock = self.capacity_lock_rows(host_id, &rows).await?;
            result.push(lock.working);
        }
        Ok(result)
    }
}
