// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nexus, the service that operates the cloud control plane

use crate::config::NexusConfig;
use crate::fsm::StateMachine;
use cirrus_db_model::Vm;
use cirrus_db_queries::context::OpContext;
use cirrus_db_queries::db;
use cirrus_db_queries::db::DataStore;
use slog::Logger;
use std::sync::Arc;

// The implementation of Nexus is large, and split into a number of submodules
// by resource.
mod host;
mod vm;

// Sub-components that don't hang directly off of Nexus.
pub mod background;
pub mod capacity;
pub mod notify;
pub mod vm_lifecycle;

use background::BackgroundTasks;
use capacity::listener::CapacityListener;
use capacity::CapacityManager;
use notify::EventBus;
use vm_lifecycle::{vm_transition_table, HostPlacementCheck, VmStateDao};

pub use vm::VmTransitionError;

/// Manages VM lifecycles and the host capacity they consume
pub struct Nexus {
    log: Logger,

    /// persistent storage for hosts, clusters, VMs, and capacity records
    db_datastore: Arc<DataStore>,

    /// books VM requirements against host capacity
    capacity: Arc<CapacityManager>,

    /// drives VM records through the VM transition table
    vm_fsm: StateMachine<Vm>,

    /// persists VM transitions
    vm_dao: VmStateDao,

    /// handles to the background tasks
    background_tasks: BackgroundTasks,
}

impl Nexus {
    /// Creates a Nexus with a fresh datastore, logging as `config` says.
    ///
    /// Must be called from within a tokio runtime: this starts the
    /// background tasks.
    pub async fn new(config: &NexusConfig) -> Result<Nexus, String> {
        let log = config
            .log
            .to_logger("cirrus-nexus")
            .map_err(|message| format!("initializing logger: {}", message))?;
        let db_config =
            db::Config { lock_timeout: config.capacity.lock_timeout() };
        let datastore = Arc::new(DataStore::new(&log, &db_config));
        Ok(Nexus::new_with_datastore(log, config, datastore).await)
    }

    /// Creates a Nexus on top of an existing datastore.
    pub async fn new_with_datastore(
        log: Logger,
        config: &NexusConfig,
        datastore: Arc<DataStore>,
    ) -> Nexus {
        let events = EventBus::new();
        let capacity = Arc::new(CapacityManager::new(
            &log,
            Arc::clone(&datastore),
            config.capacity.clone(),
            events,
        ));

        let mut vm_fsm = StateMachine::new(vm_transition_table());
        vm_fsm.register_listener(Arc::new(HostPlacementCheck));
        vm_fsm.register_listener(Arc::new(CapacityListener::new(
            Arc::clone(&capacity),
        )));
        let vm_dao = VmStateDao::new(Arc::clone(&datastore));

        let background_ctx = OpContext::for_background(
            log.new(o!("component" => "BackgroundTasks")),
        );
        let background_tasks = BackgroundTasks::start(
            &background_ctx,
            Arc::clone(&datastore),
            Arc::clone(&capacity),
            &config.background_tasks,
        );

        info!(
            log,
            "nexus started";
            "vm_transitions" => vm_fsm.table().len(),
        );

        Nexus {
            log,
            db_datastore: datastore,
            capacity,
            vm_fsm,
            vm_dao,
            background_tasks,
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.db_datastore
    }

    pub fn capacity(&self) -> &Arc<CapacityManager> {
        &self.capacity
    }

    pub fn events(&self) -> &EventBus {
        self.capacity.events()
    }

    pub fn vm_state_machine(&self) -> &StateMachine<Vm> {
        &self.vm_fsm
    }

    pub fn background_tasks(&self) -> &BackgroundTasks {
        &self.background_tasks
    }

    /// Returns an [`OpContext`] for work done on behalf of a host agent
    pub fn opctx_for_agent_report(&self, host: &str) -> OpContext {
        OpContext::for_agent_report(&self.log, host)
    }

    /// Returns an [`OpContext`] for work done on behalf of a user
    pub fn opctx_for_external_request(&self, operation: &str) -> OpContext {
        OpContext::for_external_request(&self.log, operation)
    }
}
