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

use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;

use crate::CTResult;
use crate::LogicalCoreId;

/// Placement of one logical core in the socket/cache hierarchy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreInfo {
    pub lcore: LogicalCoreId,
    pub socket: u32,
    pub l2_id: u32,
    pub l3_id: u32,
}

/// Geometry of one cache level, identical for all instances of that level.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub detected: bool,
    pub num_ways: u32,
    pub num_sets: u32,
    pub num_partitions: u32,
    pub line_size: u32,
    pub total_size: u32,
    pub way_size: u32,
}

impl CacheInfo {
    pub fn new(num_ways: u32, num_sets: u32, num_partitions: u32, line_size: u32) -> Self {
        let total_size = num_ways * num_sets * num_partitions * line_size;
        let way_size = if num_ways > 0 {
            total_size / num_ways
        } else {
            0
        };

        Self {
            detected: true,
            num_ways,
            num_sets,
            num_partitions,
            line_size,
            total_size,
            way_size,
        }
    }
}

/// Read-only snapshot of the machine topology, taken once at library init.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    cores: Vec<CoreInfo>,
    l2: CacheInfo,
    l3: CacheInfo,
}

impl CpuInfo {
    pub fn new(mut cores: Vec<CoreInfo>, l2: CacheInfo, l3: CacheInfo) -> Self {
        cores.sort_by_key(|core| core.lcore);
        Self { cores, l2, l3 }
    }

    /// Builds the topology from a sysfs cpu directory, typically
    /// `/sys/devices/system/cpu`.
    pub fn from_sysfs(cpu_root: impl AsRef<Path>) -> CTResult<Self> {
        crate::sysfs::discover(cpu_root.as_ref())
    }

    pub fn cores(&self) -> &[CoreInfo] {
        &self.cores
    }

    pub fn l2(&self) -> &CacheInfo {
        &self.l2
    }

    pub fn l3(&self) -> &CacheInfo {
        &self.l3
    }

    pub fn core(&self, lcore: LogicalCoreId) -> Option<&CoreInfo> {
        self.cores.iter().find(|core| core.lcore == lcore)
    }

    pub fn check_core(&self, lcore: LogicalCoreId) -> bool {
        self.core(lcore).is_some()
    }

    pub fn max_lcore(&self) -> Option<LogicalCoreId> {
        self.cores.iter().map(|core| core.lcore).max()
    }

    pub fn sockets(&self) -> Vec<u32> {
        self.cores
            .iter()
            .map(|core| core.socket)
            .sorted()
            .dedup()
            .collect()
    }

    pub fn l2_ids(&self) -> Vec<u32> {
        self.cores
            .iter()
            .map(|core| core.l2_id)
            .sorted()
            .dedup()
            .collect()
    }

    pub fn l3_ids(&self) -> Vec<u32> {
        self.cores
            .iter()
            .map(|core| core.l3_id)
            .sorted()
            .dedup()
            .collect()
    }

    pub fn cores_on_socket(&self, socket: u32) -> impl Iterator<Item = &CoreInfo> + '_ {
        self.cores.iter().filter(move |core| core.socket == socket)
    }

    pub fn cores_on_l2(&self, l2_id: u32) -> impl Iterator<Item = &CoreInfo> + '_ {
        self.cores.iter().filter(move |core| core.l2_id == l2_id)
    }

    pub fn cores_on_l3(&self, l3_id: u32) -> impl Iterator<Item = &CoreInfo> + '_ {
        self.cores.iter().filter(move |core| core.l3_id == l3_id)
    }

    pub fn one_core_on_socket(&self, socket: u32) -> Option<LogicalCoreId> {
        self.cores_on_socket(socket).map(|core| core.lcore).next()
    }

    pub fn one_core_on_l2(&self, l2_id: u32) -> Option<LogicalCoreId> {
        self.cores_on_l2(l2_id).map(|core| core.lcore).next()
    }
}
