// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the control plane: VM lifecycle and host capacity
//! accounting

pub mod app;
pub mod config;
pub mod fsm;

#[macro_use]
extern crate slog;

pub use app::Nexus;
pub use config::NexusConfig;
