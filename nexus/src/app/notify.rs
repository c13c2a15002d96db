// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fire-and-forget notifications for downstream consumers (usage, billing)

use cirrus_uuid_kinds::{HostUuid, VmUuid};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapacityEvent {
    /// A stopped VM stayed stopped past the amnesty window, so the capacity
    /// held for it on its last host is no longer reserved.
    ReservedCapacityFreed { vm_id: VmUuid, host_id: HostUuid },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<CapacityEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        EventBus { tx }
    }

    /// Publishes `event` to current subscribers, returning how many there
    /// were. Nobody listening is fine.
    pub fn publish(&self, event: CapacityEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CapacityEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
