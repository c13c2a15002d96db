// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files

use camino::Utf8Path;
use camino::Utf8PathBuf;
use cirrus_db_model::OvercommitRatios;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level control plane configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NexusConfig {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    pub capacity: CapacityConfig,
    pub background_tasks: BackgroundTaskConfig,
}

impl Default for NexusConfig {
    fn default() -> Self {
        NexusConfig {
            log: ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            },
            capacity: CapacityConfig::default(),
            background_tasks: BackgroundTaskConfig::default(),
        }
    }
}

impl NexusConfig {
    /// Load a `NexusConfig` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<NexusConfig, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config: NexusConfig = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        config.validate().map_err(|message| LoadError::Invalid {
            path: path.into(),
            message,
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.capacity.validate()
    }
}

/// Knobs for capacity accounting and admission control
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// How long a stopped VM keeps its reservation on its last host.
    pub skip_counting_secs: u64,
    /// Fraction of a cluster's overcommitted CPU beyond which new placements
    /// are refused.
    pub cpu_disable_threshold: f64,
    /// Same, for memory.
    pub memory_disable_threshold: f64,
    /// Upper bound on how long a capacity update waits for a host's row
    /// locks.
    pub lock_timeout_ms: u64,
    /// Ratios for clusters that don't set their own.
    pub default_cpu_overcommit_ratio: f64,
    pub default_memory_overcommit_ratio: f64,
    /// Maximum number of running VMs per host. `None` means no limit.
    pub max_guests_per_host: Option<u32>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        CapacityConfig {
            skip_counting_secs: 3600,
            cpu_disable_threshold: 0.85,
            memory_disable_threshold: 0.85,
            lock_timeout_ms: 5000,
            default_cpu_overcommit_ratio: 1.0,
            default_memory_overcommit_ratio: 1.0,
            max_guests_per_host: None,
        }
    }
}

impl CapacityConfig {
    pub fn skip_counting(&self) -> Duration {
        Duration::from_secs(self.skip_counting_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn default_overcommit(&self) -> OvercommitRatios {
        OvercommitRatios {
            cpu: self.default_cpu_overcommit_ratio,
            memory: self.default_memory_overcommit_ratio,
        }
    }

    fn validate(&self) -> Result<(), String> {
        self.default_overcommit().validate().map_err(|e| e.to_string())?;
        for (label, value) in [
            ("cpu_disable_threshold", self.cpu_disable_threshold),
            ("memory_disable_threshold", self.memory_disable_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(format!("{label} must be in (0, 1], got {value}"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct BackgroundTaskConfig {
    pub host_capacity_reconciler: HostCapacityReconcilerConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct HostCapacityReconcilerConfig {
    /// period (in seconds) for periodic activations of this background task
    pub period_secs: u64,
    /// Skip registering the task. Explicit activation is then a no-op.
    pub disable: bool,
}

impl Default for HostCapacityReconcilerConfig {
    fn default() -> Self {
        HostCapacityReconcilerConfig { period_secs: 300, disable: false }
    }
}

impl HostCapacityReconcilerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid config in \"{path}\": {message}")]
    Invalid { path: Utf8PathBuf, message: String },
}
