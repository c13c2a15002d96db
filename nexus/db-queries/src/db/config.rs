// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Datastore configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a transaction waits for a capacity row lock before giving up,
/// unless configured otherwise.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the in-process datastore
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// bound on the wait for any single row lock
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config { lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }
}
