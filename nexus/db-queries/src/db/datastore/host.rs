// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Host`]s.

use super::DataStore;
use crate::context::OpContext;
use chrono::Utc;
use cirrus_common::api::external::{
    CreateResult, DeleteResult, Error, ListResultVec, LookupResult,
    ResourceType, UpdateResult,
};
use cirrus_db_model::{Host, HostResourceState};
use cirrus_uuid_kinds::{ClusterUuid, GenericUuid, HostUuid};

impl DataStore {
    /// Stores a new host, or refreshes the hardware description and
    /// placement of a host we already know about.
    ///
    /// The host's cluster must exist.
    pub async fn host_upsert(
        &self,
        opctx: &OpContext,
        host: Host,
    ) -> CreateResult<Host> {
        let mut tables = self.tables();
        if !tables.clusters.contains_key(&host.cluster_id) {
            return Err(Error::not_found_by_id(
                ResourceType::Cluster,
                host.cluster_id.as_untyped_uuid(),
            ));
        }
        let stored = match tables.hosts.get_mut(&host.id) {
            Some(existing) => {
                existing.name = host.name;
                existing.zone_id = host.zone_id;
                existing.pod_id = host.pod_id;
                existing.cluster_id = host.cluster_id;
                existing.hardware = host.hardware;
                existing.time_modified = Utc::now();
                debug!(opctx.log, "updated host"; "host_id" => %host.id);
                existing.clone()
            }
            None => {
                info!(
                    opctx.log,
                    "new host";
                    "host_id" => %host.id,
                    "cluster_id" => %host.cluster_id,
                );
                tables.hosts.insert(host.id, host.clone());
                host
            }
        };
        Ok(stored)
    }

    pub async fn host_fetch(&self, host_id: HostUuid) -> LookupResult<Host> {
        self.tables().hosts.get(&host_id).cloned().ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::Host,
                host_id.as_untyped_uuid(),
            )
        })
    }

    pub async fn host_list(&self) -> ListResultVec<Host> {
        Ok(self.tables().hosts.values().cloned().collect())
    }

    pub async fn host_list_by_cluster(
        &self,
        cluster_id: ClusterUuid,
    ) -> ListResultVec<Host> {
        Ok(self
            .tables()
            .hosts
            .values()
            .filter(|h| h.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    /// Changes the administrative state of a host.
    ///
    /// This does not touch the host's capacity records; see
    /// [`DataStore::set_host_capacity_state`].
    pub async fn host_set_resource_state(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
        resource_state: HostResourceState,
    ) -> UpdateResult<Host> {
        let mut tables = self.tables();
        let host = tables.hosts.get_mut(&host_id).ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::Host,
                host_id.as_untyped_uuid(),
            )
        })?;
        let old = host.resource_state;
        host.resource_state = resource_state;
        host.time_modified = Utc::now();
        info!(
            opctx.log,
            "host resource state changed";
            "host_id" => %host_id,
            "old" => %old,
            "new" => %resource_state,
        );
        Ok(host.clone())
    }

    /// Removes a host along with its capacity records.
    pub async fn host_delete(
        &self,
        opctx: &OpContext,
        host_id: HostUuid,
    ) -> DeleteResult {
        let removed = self.tables().hosts.remove(&host_id);
        if removed.is_none() {
            return Err(Error::not_found_by_id(
                ResourceType::Host,
                host_id.as_untyped_uuid(),
            ));
        }
        self.host_capacity_delete(opctx, host_id).await?;
        info!(opctx.log, "removed host"; "host_id" => %host_id);
        Ok(())
    }
}
