// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structures stored in the control plane's datastore.

mod capacity;
mod cluster;
mod host;
mod service_offering;
mod vm;
mod vm_event;
mod vm_state;

pub use capacity::*;
pub use cluster::*;
pub use host::*;
pub use service_offering::*;
pub use vm::*;
pub use vm_event::*;
pub use vm_state::*;
