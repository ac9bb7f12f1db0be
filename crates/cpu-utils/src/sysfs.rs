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

use crate::errors::CPUTopologyError;
use crate::CTResult;
use crate::CacheInfo;
use crate::CoreInfo;
use crate::CpuInfo;
use crate::LogicalCoreId;

struct CacheEntry {
    level: u32,
    id: u32,
    geometry: CacheInfo,
}

pub(crate) fn discover(cpu_root: &Path) -> CTResult<CpuInfo> {
    let online_path = cpu_root.join("online");
    let online = read_trimmed(&online_path)?;
    let lcores = parse_cpulist(&online)
        .ok_or_else(|| CPUTopologyError::malformed_content(&online_path, online.as_str()))?;
    if lcores.is_empty() {
        return Err(CPUTopologyError::no_online_cores(cpu_root));
    }

    let mut cores = Vec::with_capacity(lcores.len());
    let mut l2 = CacheInfo::default();
    let mut l3 = CacheInfo::default();

    for lcore in lcores {
        let cpu_dir = cpu_root.join(format!("cpu{lcore}"));
        let socket = read_u32(&cpu_dir.join("topology").join("physical_package_id"))?;
        let caches = read_caches(&cpu_dir)?;

        let l2_entry = caches.iter().find(|cache| cache.level == 2);
        let l3_entry = caches.iter().find(|cache| cache.level == 3);

        if let (false, Some(entry)) = (l2.detected, l2_entry) {
            l2 = entry.geometry;
        }
        if let (false, Some(entry)) = (l3.detected, l3_entry) {
            l3 = entry.geometry;
        }

        cores.push(CoreInfo {
            lcore: LogicalCoreId::new(lcore),
            socket,
            // without cache ids every core is its own L2 cluster and each socket one L3 cluster
            l2_id: l2_entry.map(|entry| entry.id).unwrap_or(lcore),
            l3_id: l3_entry.map(|entry| entry.id).unwrap_or(socket),
        });
    }

    tracing::debug!(
        "discovered {} logical cores, L2 {:?}, L3 {:?}",
        cores.len(),
        l2,
        l3
    );

    Ok(CpuInfo::new(cores, l2, l3))
}

fn read_caches(cpu_dir: &Path) -> CTResult<Vec<CacheEntry>> {
    let cache_dir = cpu_dir.join("cache");
    let entries = match std::fs::read_dir(&cache_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(CPUTopologyError::read_failed(&cache_dir, error)),
    };

    let mut caches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|error| CPUTopologyError::read_failed(&cache_dir, error))?;
        if !entry.file_name().to_string_lossy().starts_with("index") {
            continue;
        }

        let index_dir = entry.path();
        let level = read_u32(&index_dir.join("level"))?;
        if level != 2 && level != 3 {
            continue;
        }
        if read_trimmed(&index_dir.join("type"))? == "Instruction" {
            continue;
        }

        let geometry = CacheInfo::new(
            read_u32(&index_dir.join("ways_of_associativity"))?,
            read_u32(&index_dir.join("number_of_sets"))?,
            read_u32(&index_dir.join("physical_line_partition"))?,
            read_u32(&index_dir.join("coherency_line_size"))?,
        );

        caches.push(CacheEntry {
            level,
            id: cache_id(&index_dir)?,
            geometry,
        });
    }

    Ok(caches)
}

/// Older kernels have no `id` file, the lowest cpu sharing the cache is used instead.
fn cache_id(index_dir: &Path) -> CTResult<u32> {
    let id_path = index_dir.join("id");
    if id_path.exists() {
        return read_u32(&id_path);
    }

    let list_path = index_dir.join("shared_cpu_list");
    let list = read_trimmed(&list_path)?;
    parse_cpulist(&list)
        .and_then(|cpus| cpus.into_iter().min())
        .ok_or_else(|| CPUTopologyError::malformed_content(&list_path, list))
}

fn read_trimmed(path: &Path) -> CTResult<String> {
    std::fs::read_to_string(path)
        .map(|content| content.trim().to_string())
        .map_err(|error| CPUTopologyError::read_failed(path, error))
}

fn read_u32(path: &Path) -> CTResult<u32> {
    let content = read_trimmed(path)?;
    content
        .parse::<u32>()
        .map_err(|_| CPUTopologyError::malformed_content(path, content))
}

/// Parses the kernel cpu list format, e.g. `0-3,8,10-11`.
pub(crate) fn parse_cpulist(list: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();

    for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        match item.split_once('-') {
            Some((first, last)) => {
                let first = first.parse::<u32>().ok()?;
                let last = last.parse::<u32>().ok()?;
                if first > last {
                    return None;
                }
                cpus.extend(first..=last);
            }
            None => cpus.push(item.parse::<u32>().ok()?),
        }
    }

    Some(cpus)
}
