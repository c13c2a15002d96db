// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background tasks
//!
//! A background task is a piece of periodic work that runs independently of
//! any caller. Each task implements [`BackgroundTask`], whose `activate`
//! function does one unit of work and returns a JSON summary of what it did.
//! The [`Driver`] runs every task in its own tokio task and activates it
//! when its period elapses or when somebody explicitly asks, never running
//! two activations of the same task at once. If an explicit activation
//! arrives while the task is running, the task runs again when it finishes.
//!
//! Tasks should be idempotent and should not assume anything about when
//! they last ran: they are for converging state, like recomputing the host
//! capacity ledger, not for one-shot operations.

mod driver;
mod init;
mod status;
mod tasks;

pub use driver::Driver;
pub use init::BackgroundTasks;
pub use status::{
    ActivationReason, CurrentStatus, CurrentStatusRunning, LastResult,
    LastResultCompleted, TaskStatus,
};

use cirrus_db_queries::context::OpContext;
use futures::future::BoxFuture;

/// An operation activated both periodically and by an explicit signal
pub trait BackgroundTask: Send + Sync {
    fn activate<'a>(
        &'a mut self,
        opctx: &'a OpContext,
    ) -> BoxFuture<'a, serde_json::Value>;
}

/// Identifies a background task registered with a [`Driver`]
#[derive(Clone, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub struct TaskName(String);

impl TaskName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
