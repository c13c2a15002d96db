// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosts, clusters, and the capacity records that go with them

use super::background::TaskStatus;
use super::capacity::reconciler::ReconcileOutcome;
use cirrus_common::api::external::{
    DeleteResult, Error, LookupResult, UpdateResult,
};
use cirrus_db_model::{
    Cluster, Host, HostCapacity, HostResourceState, OvercommitRatios,
};
use cirrus_db_queries::context::OpContext;
use cirrus_uuid_kinds::{ClusterUuid, HostUuid};

impl super::Nexus {
    // Hosts

    /// Records a host that has reported in, creating its capacity records
    /// if it's new.
    ///
    /// If a known host reports different hardware, its capacity totals are
    /// recalibrated right away instead of waiting for the next
    /// reconciliation.
    pub async fn host_report(
        &self,
        opctx: &OpContext,
        host: Host,
    ) -> Result<Host, Error> {
        let previous = match self.db_datastore.host_fetch(host.id).await {
            Ok(previous) => Some(previous),
            Err(Error::ObjectNotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let host = self.db_datastore.host_upsert(opctx, host).await?;
        self.db_datastore.host_capacity_init(opctx, &host).await?;

        if let Some(previous) = previous {
            if previous.hardware != host.hardware {
                info!(
                    opctx.log,
                    "host hardware changed";
                    "host_id" => %host.id,
                    "old" => ?previous.hardware,
                    "new" => ?host.hardware,
                );
                self.capacity.update_capacity_for_host(opctx, host.id).await?;
            }
        }
        Ok(host)
    }

    pub async fn host_fetch(&self, host_id: HostUuid) -> LookupResult<Host> {
        self.db_datastore.host_fetch(host_id).await
    }

    /// Changes a host's administrative state and enables or disables its
    /// capacity to match.
    pub async fn host_set_resource_state(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
        resource_state: HostResourceState,
    ) -> UpdateResult<Host> {
        let host = self
            .db_datastore
            .host_set_resource_state(opctx, host_id, resource_state)
            .await?;
        self.db_datastore
            .set_host_capacity_state(
                opctx,
                host_id,
                resource_state.capacity_state(),
            )
            .await?;
        Ok(host)
    }

    /// Removes a host and its capacity records.
    ///
    /// Fails if any VM still occupies the host.
    pub async fn host_remove(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
    ) -> DeleteResult {
        let occupants = self.db_datastore.vm_list_up_on_host(host_id).await?;
        if !occupants.is_empty() {
            return Err(Error::conflict(format!(
                "host {host_id} still has {} VM(s) on it",
                occupants.len()
            )));
        }
        self.db_datastore.host_delete(opctx, host_id).await
    }

    // Capacity

    pub async fn host_capacity_fetch(
        &self,
        host_id: HostUuid,
    ) -> LookupResult<HostCapacity> {
        self.db_datastore.host_capacity_fetch(host_id).await
    }

    /// Recomputes one host's capacity ledger from its VMs right now.
    pub async fn host_capacity_reconcile(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
    ) -> Result<ReconcileOutcome, Error> {
        Ok(self.capacity.update_capacity_for_host(opctx, host_id).await?)
    }

    /// Asks the periodic reconciler to sweep every host soon.
    pub fn host_capacity_reconciler_activate(&self) {
        self.background_tasks.activate_host_capacity_reconciler();
    }

    pub fn host_capacity_reconciler_status(&self) -> Option<TaskStatus> {
        self.background_tasks.host_capacity_reconciler_status()
    }

    // Clusters

    pub async fn cluster_fetch(
        &self,
        cluster_id: ClusterUuid,
    ) -> LookupResult<Cluster> {
        self.db_datastore.cluster_fetch(cluster_id).await
    }

    /// Replaces a cluster's overcommit ratios. `None` reverts to the
    /// configured defaults.
    ///
    /// Ledgers already booked under the old ratios are rescaled by the next
    /// reconciliation.
    pub async fn cluster_set_overcommit(
        &self,
        opctx: &OpContext,
        cluster_id: ClusterUuid,
        overcommit: Option<OvercommitRatios>,
    ) -> UpdateResult<Cluster> {
        let cluster = self
            .db_datastore
            .cluster_set_overcommit(opctx, cluster_id, overcommit)
            .await?;
        self.capacity.invalidate_cluster_overcommit(cluster_id);
        Ok(cluster)
    }
}
