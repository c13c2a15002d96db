// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use cirrus_common::api::external::LookupResult;
use cirrus_db_model::OvercommitRatios;
use cirrus_db_queries::db::DataStore;
use cirrus_uuid_kinds::ClusterUuid;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Read-through cache of per-cluster overcommit ratios
///
/// Entries live until explicitly invalidated; anything that changes a
/// cluster's ratios must call [`ClusterOvercommitCache::invalidate`].
pub struct ClusterOvercommitCache {
    defaults: OvercommitRatios,
    ratios: Mutex<BTreeMap<ClusterUuid, OvercommitRatios>>,
}

impl ClusterOvercommitCache {
    pub fn new(defaults: OvercommitRatios) -> Self {
        ClusterOvercommitCache { defaults, ratios: Mutex::new(BTreeMap::new()) }
    }

    pub fn defaults(&self) -> OvercommitRatios {
        self.defaults
    }

    pub async fn get(
        &self,
        datastore: &DataStore,
        cluster_id: ClusterUuid,
    ) -> LookupResult<OvercommitRatios> {
        let cached = self.ratios.lock().unwrap().get(&cluster_id).copied();
        if let Some(ratios) = cached {
            return Ok(ratios);
        }
        let cluster = datastore.cluster_fetch(cluster_id).await?;
        let ratios = cluster.overcommit.unwrap_or(self.defaults);
        self.ratios.lock().unwrap().insert(cluster_id, ratios);
        Ok(ratios)
    }

    pub fn invalidate(&self, cluster_id: ClusterUuid) {
        self.ratios.lock().unwrap().remove(&cluster_id);
    }

    pub fn invalidate_all(&self) {
        self.ratios.lock().unwrap().clear();
    }
}
