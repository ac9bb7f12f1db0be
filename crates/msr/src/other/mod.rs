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

use raw_cpuid::CpuIdResult;

use pqos_cpu_utils::LogicalCoreId;

use crate::CpuIdSource;
use crate::MSRError;
use crate::MSRResult;
use crate::MsrAccess;

#[derive(Clone, Debug, Default)]
pub struct LinuxMsr {
    _dev_cpu_root: PathBuf,
}

impl LinuxMsr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(dev_cpu_root: impl Into<PathBuf>) -> Self {
        Self {
            _dev_cpu_root: dev_cpu_root.into(),
        }
    }
}

impl MsrAccess for LinuxMsr {
    fn read(&self, _core_id: LogicalCoreId, _register_id: u32) -> MSRResult<u64> {
        Err(MSRError::UnsupportedPlatform)
    }

    fn write(&self, _core_id: LogicalCoreId, _register_id: u32, _value: u64) -> MSRResult<()> {
        Err(MSRError::UnsupportedPlatform)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NativeCpuId;

impl CpuIdSource for NativeCpuId {
    fn cpuid(&self, _leaf: u32, _subleaf: u32) -> CpuIdResult {
        CpuIdResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        }
    }
}
