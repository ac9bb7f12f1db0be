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

mod utils;

use std::path::PathBuf;

use raw_cpuid::CpuIdReader;
use raw_cpuid::CpuIdReaderNative;
use raw_cpuid::CpuIdResult;

use pqos_cpu_utils::LogicalCoreId;

use crate::CpuIdSource;
use crate::MSRResult;
use crate::MsrAccess;

const DEFAULT_DEV_CPU_ROOT: &str = "/dev/cpu";

/// Register access through the msr driver, one `/dev/cpu/<n>/msr` file per logical core.
#[derive(Clone, Debug)]
pub struct LinuxMsr {
    dev_cpu_root: PathBuf,
}

impl LinuxMsr {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_DEV_CPU_ROOT)
    }

    pub fn with_root(dev_cpu_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_cpu_root: dev_cpu_root.into(),
        }
    }
}

impl Default for LinuxMsr {
    fn default() -> Self {
        Self::new()
    }
}

impl MsrAccess for LinuxMsr {
    fn read(&self, core_id: LogicalCoreId, register_id: u32) -> MSRResult<u64> {
        utils::read_msr(&self.dev_cpu_root, register_id, core_id)
    }

    fn write(&self, core_id: LogicalCoreId, register_id: u32, value: u64) -> MSRResult<()> {
        utils::write_msr(&self.dev_cpu_root, register_id, value, core_id)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NativeCpuId;

impl CpuIdSource for NativeCpuId {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        CpuIdReaderNative.cpuid2(leaf, subleaf)
    }
}
