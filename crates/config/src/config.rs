/*
 * Copyright 2024 Fluence Labs Limited
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

use crate::defaults::default_dev_cpu_path;
use crate::defaults::default_interface;
use crate::defaults::default_lock_file;
use crate::defaults::default_log_level;
use crate::defaults::default_perf_counter_policy;
use crate::defaults::default_perf_rdt_path;
use crate::defaults::default_proc_path;
use crate::defaults::default_resctrl_path;
use crate::defaults::default_sysfs_cpu_path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PqosConfig {
    pub interface: Interface,
    pub lock_file: PathBuf,
    pub paths: Paths,
    pub monitoring: Monitoring,
    pub logs: Logs,
}

/// Control plane used to program RDT.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    /// Model specific registers are programmed directly.
    Msr,
    /// The kernel does it on our behalf through resctrl and perf.
    Os,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paths {
    pub resctrl: PathBuf,
    pub proc: PathBuf,
    pub sysfs_cpu: PathBuf,
    pub perf_rdt: PathBuf,
    pub dev_cpu: PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Monitoring {
    pub perf_counters_in_use: PerfCounterPolicy,
}

/// What to do when the core performance counters are already enabled by
/// someone else at monitoring start.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfCounterPolicy {
    /// Log a warning and take the counters over.
    #[default]
    Warn,
    /// Refuse to start monitoring.
    Fail,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Logs {
    pub log_level: tracing_subscriber::filter::LevelFilter,
}

#[derive(Debug, ThisError)]
#[error("unknown RDT interface '{value}', expected 'msr' or 'os'")]
pub struct InterfaceParseError {
    value: String,
}

impl std::str::FromStr for Interface {
    type Err = InterfaceParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "msr" => Ok(Interface::Msr),
            "os" => Ok(Interface::Os),
            _ => Err(InterfaceParseError {
                value: value.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interface::Msr => write!(f, "MSR"),
            Interface::Os => write!(f, "OS"),
        }
    }
}

impl Default for PqosConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            lock_file: default_lock_file(),
            paths: Paths::default(),
            monitoring: Monitoring::default(),
            logs: Logs::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            resctrl: default_resctrl_path(),
            proc: default_proc_path(),
            sysfs_cpu: default_sysfs_cpu_path(),
            perf_rdt: default_perf_rdt_path(),
            dev_cpu: default_dev_cpu_path(),
        }
    }
}

impl Default for Monitoring {
    fn default() -> Self {
        Self {
            perf_counters_in_use: default_perf_counter_policy(),
        }
    }
}

impl Default for Logs {
    fn default() -> Self {
        Self {
            log_level: default_log_level().to_tracing_filter(),
        }
    }
}
