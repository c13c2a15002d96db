// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for working with the control plane's datastore

mod config;
// This is marked public for use by the integration tests
pub mod datastore;
mod error;

#[cfg(any(test, feature = "testing"))]
pub mod pub_test_utils;

pub use cirrus_db_model as model;

pub use config::Config;
pub use datastore::DataStore;
pub use error::LockError;
pub use error::TransactionError;
