// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing control plane
//! resources
//!
//! The contents here are transport-agnostic: nothing in this module knows
//! whether a value is headed for a database row, a log line, or a caller of
//! the library.

mod error;
pub use error::*;

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FormatResult;

// The type aliases below exist primarily to ensure consistency among return
// types for functions in the `DataStore` and the lifecycle machinery.

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

/// A count of bytes, typically used for memory capacity
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct ByteCount(u64);

impl ByteCount {
    pub const fn from_mebibytes_u32(mebibytes: u32) -> ByteCount {
        ByteCount(1024 * 1024 * (mebibytes as u64))
    }

    pub const fn from_gibibytes_u32(gibibytes: u32) -> ByteCount {
        ByteCount(1024 * 1024 * 1024 * (gibibytes as u64))
    }

    pub fn to_bytes(&self) -> u64 {
        self.0
    }
}

impl Display for ByteCount {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "{} bytes", self.0)
    }
}

/// Generation numbers stored alongside records, used for optimistic
/// concurrency control
#[derive(
    Copy,
    Clone,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Generation(u64);

impl Generation {
    pub const fn new() -> Generation {
        Generation(1)
    }

    pub fn next(&self) -> Generation {
        // It should technically be an operational error if this wraps or even
        // exceeds the value allowed by an i64.  But it seems unlikely enough
        // to happen in practice that we can probably feel safe with this.
        let next_gen = self.0 + 1;
        assert!(next_gen <= i64::MAX as u64);
        Generation(next_gen)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation::new()
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(&self.0.to_string())
    }
}

/// Identifies a type of control plane resource
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ResourceType {
    Cluster,
    Host,
    HostCapacity,
    ServiceOffering,
    Vm,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                ResourceType::Cluster => "cluster",
                ResourceType::Host => "host",
                ResourceType::HostCapacity => "host capacity",
                ResourceType::ServiceOffering => "service offering",
                ResourceType::Vm => "vm",
            }
        )
    }
}
