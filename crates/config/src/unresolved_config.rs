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

use std::path::Path;
use std::path::PathBuf;

use eyre::eyre;
use serde::Deserialize;
use serde::Serialize;

use super::defaults::default_dev_cpu_path;
use super::defaults::default_interface;
use super::defaults::default_lock_file;
use super::defaults::default_log_level;
use super::defaults::default_perf_counter_policy;
use super::defaults::default_perf_rdt_path;
use super::defaults::default_proc_path;
use super::defaults::default_resctrl_path;
use super::defaults::default_sysfs_cpu_path;
use crate::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnresolvedPqosConfig {
    #[serde(default = "default_interface")]
    pub interface: Interface,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    #[serde(default)]
    pub paths: UnresolvedPaths,
    #[serde(default)]
    pub monitoring: UnresolvedMonitoring,
    #[serde(default)]
    pub logs: UnresolvedLogs,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnresolvedPaths {
    #[serde(default = "default_resctrl_path")]
    pub resctrl: PathBuf,
    #[serde(default = "default_proc_path")]
    pub proc: PathBuf,
    #[serde(default = "default_sysfs_cpu_path")]
    pub sysfs_cpu: PathBuf,
    #[serde(default = "default_perf_rdt_path")]
    pub perf_rdt: PathBuf,
    #[serde(default = "default_dev_cpu_path")]
    pub dev_cpu: PathBuf,
}

impl Default for UnresolvedPaths {
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

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnresolvedMonitoring {
    #[serde(default = "default_perf_counter_policy")]
    pub perf_counters_in_use: PerfCounterPolicy,
}

impl Default for UnresolvedMonitoring {
    fn default() -> Self {
        Self {
            perf_counters_in_use: default_perf_counter_policy(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnresolvedLogs {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

impl Default for UnresolvedLogs {
    fn default() -> Self {
        UnresolvedLogs {
            log_level: default_log_level(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl UnresolvedPqosConfig {
    /// Relative paths in the config are taken relative to the config file directory.
    pub fn resolve(self, config_path: impl AsRef<Path>) -> eyre::Result<PqosConfig> {
        let config_dir = config_path.as_ref().parent().ok_or_else(|| {
            eyre!(
                "config resolver was provided with invalid config path: {}",
                config_path.as_ref().display()
            )
        })?;

        let config = PqosConfig {
            interface: self.interface,
            lock_file: config_dir.join(self.lock_file),
            paths: self.paths.resolve(config_dir),
            monitoring: self.monitoring.resolve(),
            logs: self.logs.resolve(),
        };
        Ok(config)
    }
}

impl UnresolvedPaths {
    pub fn resolve(self, config_dir: &Path) -> Paths {
        Paths {
            resctrl: config_dir.join(self.resctrl),
            proc: config_dir.join(self.proc),
            sysfs_cpu: config_dir.join(self.sysfs_cpu),
            perf_rdt: config_dir.join(self.perf_rdt),
            dev_cpu: config_dir.join(self.dev_cpu),
        }
    }
}

impl UnresolvedMonitoring {
    pub fn resolve(self) -> Monitoring {
        Monitoring {
            perf_counters_in_use: self.perf_counters_in_use,
        }
    }
}

impl LogLevel {
    pub fn to_tracing_filter(&self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;

        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl UnresolvedLogs {
    pub fn resolve(self) -> Logs {
        Logs {
            log_level: self.log_level.to_tracing_filter(),
        }
    }
}
