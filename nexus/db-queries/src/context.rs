// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state used by API request handlers and background tasks

use chrono::{DateTime, Utc};
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Instant;

/// Provides general facilities scoped to whatever operation Nexus is
/// currently doing
///
/// The idea is that whatever code path you're looking at in Nexus, it should
/// eventually have an OpContext that allows it to log with the right
/// context for the operation it's doing.
pub struct OpContext {
    pub log: Logger,
    created_instant: Instant,
    created_walltime: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
    kind: OpKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// Handling an external request (e.g. a user asking to start a VM)
    ExternalApiRequest,
    /// Handling a report from a host agent
    AgentReport,
    /// Background operations in Nexus
    Background,
    /// Automated testing
    Test,
}

impl OpContext {
    fn new(
        log: &Logger,
        kind: OpKind,
        metadata: BTreeMap<String, String>,
    ) -> OpContext {
        let created_instant = Instant::now();
        let created_walltime = Utc::now();
        let log = log.new(o!(
            "operation_kind" => format!("{:?}", kind),
            "metadata" => format!("{:?}", metadata),
        ));
        OpContext { log, created_instant, created_walltime, metadata, kind }
    }

    /// Returns a context suitable for use in background operations in Nexus
    pub fn for_background(log: Logger) -> OpContext {
        OpContext::new(&log, OpKind::Background, BTreeMap::new())
    }

    /// Returns a context for handling a user's request
    pub fn for_external_request(log: &Logger, operation: &str) -> OpContext {
        let mut metadata = BTreeMap::new();
        metadata.insert(String::from("operation"), operation.to_string());
        OpContext::new(log, OpKind::ExternalApiRequest, metadata)
    }

    /// Returns a context for processing a state report from a host agent
    pub fn for_agent_report(log: &Logger, host: &str) -> OpContext {
        let mut metadata = BTreeMap::new();
        metadata.insert(String::from("reporting_host"), host.to_string());
        OpContext::new(log, OpKind::AgentReport, metadata)
    }

    /// Returns a context suitable for automated tests
    pub fn for_tests(log: Logger) -> OpContext {
        OpContext::new(&log, OpKind::Test, BTreeMap::new())
    }

    /// Creates a new `OpContext` just like the given one, but with additional
    /// metadata.
    ///
    /// This is useful when a caller fans out into several sub-operations
    /// (e.g., one per host) and wants each logged distinctly.
    pub fn child(&self, new_metadata: BTreeMap<String, String>) -> OpContext {
        let created_instant = Instant::now();
        let created_walltime = Utc::now();
        let mut metadata = self.metadata.clone();
        let mut log = self.log.clone();

        for (k, v) in new_metadata {
            metadata.insert(k.clone(), v.clone());
            log = log.new(o!(k => v));
        }

        OpContext {
            log,
            created_instant,
            created_walltime,
            metadata,
            kind: self.kind,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// How long this operation has been running
    pub fn elapsed(&self) -> std::time::Duration {
        self.created_instant.elapsed()
    }

    pub fn time_started(&self) -> DateTime<Utc> {
        self.created_walltime
    }
}
