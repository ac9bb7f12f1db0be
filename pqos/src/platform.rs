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

use std::sync::Arc;

use pqos_config::PqosConfig;
use pqos_cpu_utils::CpuInfo;
use pqos_msr::CpuIdSource;
use pqos_msr::LinuxMsr;
use pqos_msr::MsrAccess;
use pqos_msr::NativeCpuId;

use crate::perf::PerfEvents;
use crate::perf::SyscallPerfEvents;
use crate::resctrl::ResctrlMount;
use crate::resctrl::SysResctrlMount;
use crate::PqosResult;

/// Everything the library touches outside of plain files.
#[derive(Clone)]
pub struct Platform {
    pub cpuid: Arc<dyn CpuIdSource>,
    pub msr: Arc<dyn MsrAccess>,
    pub mounter: Arc<dyn ResctrlMount>,
    pub perf: Arc<dyn PerfEvents>,
    pub cpu: Arc<CpuInfo>,
}

impl Platform {
    /// The running machine, with topology and device paths taken from `config`.
    pub fn native(config: &PqosConfig) -> PqosResult<Self> {
        let cpu = CpuInfo::from_sysfs(&config.paths.sysfs_cpu)?;

        Ok(Self {
            cpuid: Arc::new(NativeCpuId),
            msr: Arc::new(LinuxMsr::with_root(config.paths.dev_cpu.clone())),
            mounter: Arc::new(SysResctrlMount),
            perf: Arc::new(SyscallPerfEvents),
            cpu: Arc::new(cpu),
        })
    }
}
