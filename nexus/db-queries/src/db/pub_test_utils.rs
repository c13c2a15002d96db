// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support code that can be enabled by dependencies via this crate's
//! `testing` feature.
//!
//! This feature should only be enabled under `dev-dependencies` to avoid this
//! test support code leaking into release binaries.

use crate::context::OpContext;
use crate::db::{Config, DataStore};
use cirrus_common::api::external::ByteCount;
use cirrus_db_model::{
    Cluster, ComputeShape, Host, HostHardware, OfferingCompute,
    OvercommitRatios, ServiceOffering, Vm,
};
use cirrus_uuid_kinds::{
    ClusterUuid, HostUuid, PodUuid, ServiceOfferingUuid, VmUuid, ZoneUuid,
};
use slog::Logger;
use std::sync::Arc;

/// The shape of the offering [`TestDatabase::create_vm`] uses.
pub const SMALL_SHAPE: ComputeShape = ComputeShape {
    cpu_cores: 1,
    cpu_speed_mhz: 1000,
    memory: ByteCount::from_mebibytes_u32(512),
};

/// A datastore preloaded with one cluster and one service offering.
pub struct TestDatabase {
    opctx: OpContext,
    datastore: Arc<DataStore>,
    cluster: Cluster,
    small_offering: ServiceOffering,
}

impl TestDatabase {
    pub async fn new(log: &Logger) -> Self {
        Self::new_with_config(log, &Config::default()).await
    }

    pub async fn new_with_config(log: &Logger, config: &Config) -> Self {
        let datastore = Arc::new(DataStore::new(log, config));
        let opctx = OpContext::for_tests(log.new(o!()));
        let cluster = datastore
            .cluster_create(
                &opctx,
                Cluster::new(
                    ClusterUuid::new_v4(),
                    "test-cluster",
                    ZoneUuid::new_v4(),
                    PodUuid::new_v4(),
                    None,
                ),
            )
            .await
            .unwrap();
        let small_offering = datastore
            .service_offering_create(ServiceOffering::new(
                ServiceOfferingUuid::new_v4(),
                "small",
                OfferingCompute::Fixed(SMALL_SHAPE),
            ))
            .await
            .unwrap();
        TestDatabase { opctx, datastore, cluster, small_offering }
    }

    pub fn opctx(&self) -> &OpContext {
        &self.opctx
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn small_offering(&self) -> &ServiceOffering {
        &self.small_offering
    }

    /// Creates another cluster in the same zone and pod as the default one.
    pub async fn create_cluster(
        &self,
        opctx: &OpContext,
        overcommit: Option<OvercommitRatios>,
    ) -> Cluster {
        self.datastore
            .cluster_create(
                opctx,
                Cluster::new(
                    ClusterUuid::new_v4(),
                    "extra-cluster",
                    self.cluster.zone_id,
                    self.cluster.pod_id,
                    overcommit,
                ),
            )
            .await
            .unwrap()
    }

    /// Creates a host with its capacity records in the default cluster.
    pub async fn create_host(
        &self,
        opctx: &OpContext,
        cpu_cores: u32,
        cpu_speed_mhz: u32,
        memory_gib: u32,
    ) -> Host {
        self.create_host_in(
            opctx,
            &self.cluster,
            cpu_cores,
            cpu_speed_mhz,
            memory_gib,
        )
        .await
    }

    pub async fn create_host_in(
        &self,
        opctx: &OpContext,
        cluster: &Cluster,
        cpu_cores: u32,
        cpu_speed_mhz: u32,
        memory_gib: u32,
    ) -> Host {
        let id = HostUuid::new_v4();
        let host = Host::new(
            id,
            format!("host-{id}"),
            cluster.zone_id,
            cluster.pod_id,
            cluster.id,
            HostHardware {
                cpu_cores,
                cpu_speed_mhz,
                total_memory: ByteCount::from_gibibytes_u32(memory_gib),
            },
        );
        let host = self.datastore.host_upsert(opctx, host).await.unwrap();
        self.datastore.host_capacity_init(opctx, &host).await.unwrap();
        host
    }

    /// Creates a stopped VM from the small offering.
    pub async fn create_vm(&self, opctx: &OpContext, name: &str) -> Vm {
        self.datastore
            .vm_create(
                opctx,
                Vm::new(VmUuid::new_v4(), name, self.small_offering.id, None),
            )
            .await
            .unwrap()
    }
}
