// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types produced by datastore transactions

use cirrus_common::api::external::Error as PublicError;
use cirrus_db_model::CapacityType;
use cirrus_uuid_kinds::{GenericUuid, HostUuid};
use std::time::Duration;

/// Failure to acquire the capacity row locks of a host.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum LockError {
    /// The bounded wait for a row lock elapsed. Retryable.
    #[error(
        "timed out after {timeout:?} waiting for the {capacity_type} \
         capacity row of host {host_id}"
    )]
    Timeout {
        host_id: HostUuid,
        capacity_type: CapacityType,
        timeout: Duration,
    },

    /// The host has no capacity rows.
    #[error("no capacity records for host {host_id}")]
    NotFound { host_id: HostUuid },
}

impl LockError {
    pub fn retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}

impl From<LockError> for PublicError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { .. } => {
                PublicError::unavail(&e.to_string())
            }
            LockError::NotFound { host_id } => PublicError::not_found_by_id(
                cirrus_common::api::external::ResourceType::HostCapacity,
                host_id.as_untyped_uuid(),
            ),
        }
    }
}

/// Result of a capacity transaction.
///
/// Separates failures of the transaction machinery itself from errors the
/// caller's closure produced, so callers can tell "try again" apart from "the
/// business rule said no".
#[derive(Debug, thiserror::Error)]
pub enum TransactionError<T> {
    /// The transaction could not take its locks.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The caller's closure failed; nothing was written.
    #[error("custom transaction error; {0:?}")]
    CustomError(T),
}

impl<T> TransactionError<T> {
    /// Returns true if the transaction failed only because of lock
    /// contention and may succeed if attempted again.
    pub fn retry_transaction(&self) -> bool {
        match self {
            TransactionError::Lock(e) => e.retryable(),
            TransactionError::CustomError(_) => false,
        }
    }
}

impl From<TransactionError<PublicError>> for PublicError {
    fn from(err: TransactionError<PublicError>) -> Self {
        match err {
            TransactionError::CustomError(err) => err,
            TransactionError::Lock(err) => err.into(),
        }
    }
}
