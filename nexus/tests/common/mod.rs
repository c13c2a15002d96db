// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared setup for the integration tests

use chrono::Utc;
use cirrus_common::api::external::ByteCount;
use cirrus_db_model::{
    ComputeShape, Host, HostCapacity, OfferingCompute, ServiceOffering, Vm,
    VmEvent, VmRuntimeState,
};
use cirrus_db_queries::context::OpContext;
use cirrus_db_queries::db;
use cirrus_db_queries::db::pub_test_utils::TestDatabase;
use cirrus_nexus::config::NexusConfig;
use cirrus_nexus::fsm::Transitioned;
use cirrus_nexus::Nexus;
use cirrus_test_utils::dev::test_setup_log;
use cirrus_uuid_kinds::{HostUuid, ServiceOfferingUuid, VmUuid};
use dropshot::test_util::LogContext;

/// A Nexus over a fresh datastore holding one cluster and a small offering
pub struct NexusTestContext {
    pub logctx: LogContext,
    pub db: TestDatabase,
    pub nexus: Nexus,
}

impl NexusTestContext {
    /// Sets up a Nexus whose periodic reconciler is disabled, so tests see
    /// exactly the ledger changes they cause.
    pub async fn new(test_name: &str) -> NexusTestContext {
        NexusTestContext::new_with_config(test_name, test_config()).await
    }

    pub async fn new_with_config(
        test_name: &str,
        config: NexusConfig,
    ) -> NexusTestContext {
        let db_config = db::Config::default();
        NexusTestContext::new_with_db_config(test_name, config, db_config)
            .await
    }

    pub async fn new_with_db_config(
        test_name: &str,
        config: NexusConfig,
        db_config: db::Config,
    ) -> NexusTestContext {
        let logctx = test_setup_log(test_name);
        let db = TestDatabase::new_with_config(&logctx.log, &db_config).await;
        let nexus = Nexus::new_with_datastore(
            logctx.log.new(o!("component" => "nexus")),
            &config,
            db.datastore().clone(),
        )
        .await;
        NexusTestContext { logctx, db, nexus }
    }

    pub fn opctx(&self) -> &OpContext {
        self.db.opctx()
    }

    pub async fn create_host(
        &self,
        cpu_cores: u32,
        cpu_speed_mhz: u32,
        memory_gib: u32,
    ) -> Host {
        self.db
            .create_host(self.opctx(), cpu_cores, cpu_speed_mhz, memory_gib)
            .await
    }

    /// Creates a VM from the default 1 core, 1000 MHz, 512 MiB offering.
    pub async fn create_vm(&self, name: &str) -> Vm {
        self.db.create_vm(self.opctx(), name).await
    }

    /// Creates a VM from a new fixed offering of the given shape.
    pub async fn create_vm_with_shape(
        &self,
        name: &str,
        cpu_cores: u32,
        cpu_speed_mhz: u32,
        memory_mib: u32,
    ) -> Vm {
        let shape = ComputeShape {
            cpu_cores,
            cpu_speed_mhz,
            memory: ByteCount::from_mebibytes_u32(memory_mib),
        };
        let offering = self
            .db
            .datastore()
            .service_offering_create(ServiceOffering::new(
                ServiceOfferingUuid::new_v4(),
                format!("{name}-offering"),
                OfferingCompute::Fixed(shape),
            ))
            .await
            .unwrap();
        self.nexus
            .vm_create(
                self.opctx(),
                Vm::new(VmUuid::new_v4(), name, offering.id, None),
            )
            .await
            .unwrap()
    }

    pub async fn transit(
        &self,
        vm_id: VmUuid,
        event: VmEvent,
        host_id: Option<HostUuid>,
    ) -> Transitioned<Vm> {
        self.nexus
            .vm_transit_to(self.opctx(), vm_id, event, host_id)
            .await
            .unwrap_or_else(|e| {
                panic!("transition {event} of VM {vm_id} failed: {e}")
            })
    }

    /// Starts a stopped VM on `host_id` and brings it to `Running`.
    pub async fn start_vm(&self, vm_id: VmUuid, host_id: HostUuid) -> Vm {
        self.transit(vm_id, VmEvent::StartRequested, Some(host_id)).await;
        self.transit(vm_id, VmEvent::OperationSucceeded, None).await.entity
    }

    /// Stops a running VM the way a user would.
    pub async fn stop_vm(&self, vm_id: VmUuid) -> Vm {
        self.transit(vm_id, VmEvent::StopRequested, None).await;
        self.transit(vm_id, VmEvent::OperationSucceeded, None).await.entity
    }

    /// Rewrites a VM's last update so it looks parked for `parked_for`.
    pub async fn backdate_vm(
        &self,
        vm_id: VmUuid,
        parked_for: chrono::Duration,
    ) {
        let datastore = self.nexus.datastore();
        let vm = datastore.vm_fetch(vm_id).await.unwrap();
        let runtime = VmRuntimeState {
            gen: vm.runtime.gen.next(),
            time_updated: Utc::now() - parked_for,
            ..vm.runtime.clone()
        };
        assert!(datastore.vm_update_runtime(vm_id, &runtime).await.unwrap());
    }

    pub async fn ledger(&self, host_id: HostUuid) -> HostCapacity {
        self.nexus.host_capacity_fetch(host_id).await.unwrap()
    }

    pub fn cleanup_successful(self) {
        let NexusTestContext { logctx, db, nexus } = self;
        drop(nexus);
        drop(db);
        logctx.cleanup_successful();
    }
}

/// Default configuration with the periodic reconciler disabled
pub fn test_config() -> NexusConfig {
    let mut config = NexusConfig::default();
    config.background_tasks.host_capacity_reconciler.disable = true;
    config
}

/// The CPU ledger of a host as `(used, reserved)`
pub fn cpu_ledger(capacity: &HostCapacity) -> (u64, u64) {
    (capacity.cpu.used, capacity.cpu.reserved)
}

/// The memory ledger of a host as `(used, reserved)`
pub fn memory_ledger(capacity: &HostCapacity) -> (u64, u64) {
    (capacity.memory.used, capacity.memory.reserved)
}

pub const MIB: u64 = 1024 * 1024;
