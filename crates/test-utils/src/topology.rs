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

use pqos_cpu_utils::CacheInfo;
use pqos_cpu_utils::CoreInfo;
use pqos_cpu_utils::CpuInfo;
use pqos_cpu_utils::LogicalCoreId;

/// `sockets * cores_per_socket` cores numbered consecutively, one L3 per socket
/// and one L2 per pair of cores.
pub fn uniform_cpuinfo(sockets: u32, cores_per_socket: u32) -> CpuInfo {
    let cores = (0..sockets * cores_per_socket)
        .map(|lcore| CoreInfo {
            lcore: LogicalCoreId::new(lcore),
            socket: lcore / cores_per_socket,
            l2_id: lcore / 2,
            l3_id: lcore / cores_per_socket,
        })
        .collect();

    CpuInfo::new(
        cores,
        CacheInfo::new(8, 1024, 1, 64),
        CacheInfo::new(16, 16384, 1, 64),
    )
}

/// Two sockets with four cores each.
pub fn two_socket_cpuinfo() -> CpuInfo {
    uniform_cpuinfo(2, 4)
}
