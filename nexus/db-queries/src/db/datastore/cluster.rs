// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Cluster`]s.

use super::DataStore;
use crate::context::OpContext;
use chrono::Utc;
use cirrus_common::api::external::{
    CreateResult, Error, ListResultVec, LookupResult, ResourceType,
    UpdateResult,
};
use cirrus_db_model::{Cluster, OvercommitRatios};
use cirrus_uuid_kinds::{ClusterUuid, GenericUuid};

impl DataStore {
    pub async fn cluster_create(
        &self,
        opctx: &OpContext,
        cluster: Cluster,
    ) -> CreateResult<Cluster> {
        if let Some(ratios) = &cluster.overcommit {
            ratios.validate()?;
        }
        let mut tables = self.tables();
        if tables.clusters.contains_key(&cluster.id) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Cluster,
                object_name: cluster.id.to_string(),
            });
        }
        debug!(opctx.log, "created cluster"; "cluster_id" => %cluster.id);
        tables.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    pub async fn cluster_fetch(
        &self,
        cluster_id: ClusterUuid,
    ) -> LookupResult<Cluster> {
        self.tables().clusters.get(&cluster_id).cloned().ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::Cluster,
                cluster_id.as_untyped_uuid(),
            )
        })
    }

    pub async fn cluster_list(&self) -> ListResultVec<Cluster> {
        Ok(self.tables().clusters.values().cloned().collect())
    }

    /// Replaces the overcommit ratios of a cluster. `None` reverts the
    /// cluster to the configured defaults.
    ///
    /// Callers holding cached ratios for this cluster must invalidate them.
    pub async fn cluster_set_overcommit(
        &self,
        opctx: &OpContext,
        cluster_id: ClusterUuid,
        overcommit: Option<OvercommitRatios>,
    ) -> UpdateResult<Cluster> {
        if let Some(ratios) = &overcommit {
            ratios.validate()?;
        }
        let mut tables = self.tables();
        let cluster = tables.clusters.get_mut(&cluster_id).ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::Cluster,
                cluster_id.as_untyped_uuid(),
            )
        })?;
        cluster.overcommit = overcommit;
        cluster.time_modified = Utc::now();
        info!(
            opctx.log,
            "updated cluster overcommit ratios";
            "cluster_id" => %cluster_id,
            "overcommit" => ?overcommit,
        );
        Ok(cluster.clone())
    }
}
