// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Cirrus Control Plane
//!
//! This crate implements common facilities used across the control plane:
//! the operational [`api::external::Error`] type and the small value types
//! (generation numbers, byte counts) that are shared between the data model,
//! the datastore, and the lifecycle and capacity machinery built on top of
//! them.

pub mod api;
