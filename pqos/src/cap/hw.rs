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

use pqos_cpu_utils::CpuInfo;
use pqos_msr::processor_brand_string;
use pqos_msr::CpuIdSource;
use pqos_msr::MsrAccess;

use super::types::*;
use crate::errors::PqosError;
use crate::hw::registers::*;
use crate::types::MonEvent;
use crate::PqosResult;

/// Parts with 4 L3 classes that do not enumerate CAT through CPUID.
const L3CA_BRAND_ALLOW_LIST: [&str; 8] = [
    "E5-2658 v3",
    "E5-2648L v3",
    "E5-2628L v3",
    "E5-2618L v3",
    "E5-2608L v3",
    "E5-2658A v3",
    "E3-1258L v4",
    "E3-1278L v4",
];
const L3CA_BRAND_CLASSES: u32 = 4;

/// Builds the hardware capability table. Missing features are left out,
/// any other failure aborts discovery. Without `msr` neither the L3 class
/// count is probed nor the CDP state read, the OS interface takes both from resctrl.
pub(crate) fn discover(
    cpuid: &dyn CpuIdSource,
    msr: Option<&dyn MsrAccess>,
    cpu: &CpuInfo,
) -> PqosResult<Capabilities> {
    let mut caps = Vec::new();

    if let Some(mon) = optional(discover_monitoring(cpuid, cpu))? {
        caps.push(Capability::Mon(mon));
    }
    if let Some(l3ca) = optional(discover_l3ca(cpuid, msr, cpu))? {
        caps.push(Capability::L3ca(l3ca));
    }
    if let Some(l2ca) = optional(discover_l2ca(cpuid, cpu))? {
        caps.push(Capability::L2ca(l2ca));
    }
    if let Some(mba) = optional(discover_mba(cpuid))? {
        caps.push(Capability::Mba(mba));
    }

    tracing::info!(
        "discovered capabilities: {:?}",
        caps.iter().map(Capability::cap_type).collect::<Vec<_>>()
    );

    Ok(Capabilities::new(caps))
}

fn optional<T>(result: PqosResult<T>) -> PqosResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(PqosError::Resource(reason)) => {
            tracing::debug!("{reason}");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

fn rdt_allocation_resources(cpuid: &dyn CpuIdSource) -> u32 {
    let features = cpuid.cpuid(CPUID_EXT_FEATURES, 0);
    if features.ebx & EXT_FEATURES_EBX_PQE == 0 {
        return 0;
    }
    cpuid.cpuid(CPUID_RDT_ALLOCATION, 0).ebx
}

fn discover_monitoring(cpuid: &dyn CpuIdSource, cpu: &CpuInfo) -> PqosResult<MonCap> {
    let features = cpuid.cpuid(CPUID_EXT_FEATURES, 0);
    if features.ebx & EXT_FEATURES_EBX_PQM == 0 {
        return Err(PqosError::resource("CPUID doesn't report monitoring"));
    }

    let leaf = cpuid.cpuid(CPUID_RDT_MONITORING, 0);
    if leaf.edx & (1 << 1) == 0 {
        return Err(PqosError::resource("CPUID doesn't report L3 monitoring"));
    }
    let max_rmid = leaf.ebx + 1;

    let l3 = cpuid.cpuid(CPUID_RDT_MONITORING, 1);
    let event_cap = |event| MonEventCap {
        event,
        max_rmid: l3.ecx + 1,
        scale_factor: l3.ebx,
        os_support: false,
    };

    let mut events = Vec::new();
    if l3.edx & (1 << 0) != 0 {
        events.push(event_cap(MonEvent::L3_OCCUP));
    }
    if l3.edx & (1 << 1) != 0 {
        events.push(event_cap(MonEvent::TMEM_BW));
    }
    if l3.edx & (1 << 2) != 0 {
        events.push(event_cap(MonEvent::LMEM_BW));
    }
    if l3.edx & 0b110 == 0b110 {
        events.push(event_cap(MonEvent::RMEM_BW));
    }
    if events.is_empty() {
        return Err(PqosError::resource("no L3 monitoring events reported"));
    }

    let (ipc, llc_miss) = perfmon_events(cpuid);
    let perf_cap = |event| MonEventCap {
        event,
        max_rmid: 0,
        scale_factor: 1,
        os_support: false,
    };
    if ipc {
        events.push(perf_cap(MonEvent::IPC));
    }
    if llc_miss {
        events.push(perf_cap(MonEvent::LLC_MISS));
    }

    Ok(MonCap {
        max_rmid,
        l3_size: cpu.l3().total_size,
        events,
    })
}

/// IPC needs the instructions and core cycles events plus two fixed counters,
/// LLC misses one programmable counter.
fn perfmon_events(cpuid: &dyn CpuIdSource) -> (bool, bool) {
    let leaf = cpuid.cpuid(CPUID_ARCH_PERFMON, 0);
    let version = leaf.eax & 0xff;
    if version == 0 {
        return (false, false);
    }

    let events_available = leaf.ebx & 0b11 == 0;
    let fixed_counters = leaf.edx & 0x1f;
    let ipc = events_available && fixed_counters > 1;
    let llc_miss = (leaf.eax >> 8) & 0xff > 0;
    (ipc, llc_miss)
}

fn discover_l3ca(
    cpuid: &dyn CpuIdSource,
    msr: Option<&dyn MsrAccess>,
    cpu: &CpuInfo,
) -> PqosResult<L3CaCap> {
    let mut l3ca = if rdt_allocation_resources(cpuid) & (1 << 1) != 0 {
        l3ca_from_cpuid(cpuid, cpu)
    } else {
        l3ca_from_brand_or_probe(cpuid, msr, cpu)?
    };

    if let (true, Some(msr)) = (l3ca.cdp, msr) {
        l3ca.cdp_on = detect_l3_cdp_on(msr, cpu)?;
        if l3ca.cdp_on {
            l3ca.num_classes /= 2;
        }
    }

    Ok(l3ca)
}

fn l3ca_from_cpuid(cpuid: &dyn CpuIdSource, cpu: &CpuInfo) -> L3CaCap {
    let leaf = cpuid.cpuid(CPUID_RDT_ALLOCATION, 1);
    let num_ways = (leaf.eax & 0x1f) + 1;

    L3CaCap {
        num_classes: (leaf.edx & 0xffff) + 1,
        num_ways,
        way_size: cpu.l3().total_size / num_ways,
        way_contention: leaf.ebx as u64,
        cdp: leaf.ecx & (1 << 2) != 0,
        cdp_on: false,
        os_support: false,
    }
}

fn l3ca_from_brand_or_probe(
    cpuid: &dyn CpuIdSource,
    msr: Option<&dyn MsrAccess>,
    cpu: &CpuInfo,
) -> PqosResult<L3CaCap> {
    let brand = processor_brand_string(cpuid).unwrap_or_default();
    let num_classes = if L3CA_BRAND_ALLOW_LIST
        .iter()
        .any(|model| brand.contains(model))
    {
        tracing::info!("L3 CAT detected from brand string '{brand}'");
        L3CA_BRAND_CLASSES
    } else if let Some(msr) = msr {
        probe_l3ca_classes(msr, cpu)?
    } else {
        return Err(PqosError::resource("CPUID doesn't report L3 CAT"));
    };

    let l3 = cpu.l3();
    if !l3.detected || l3.num_ways == 0 {
        return Err(PqosError::resource("L3 cache geometry is unknown"));
    }

    Ok(L3CaCap {
        num_classes,
        num_ways: l3.num_ways,
        way_size: l3.way_size,
        way_contention: 0,
        cdp: false,
        cdp_on: false,
        os_support: false,
    })
}

/// Counts the class mask registers that can be read and written back.
fn probe_l3ca_classes(msr: &dyn MsrAccess, cpu: &CpuInfo) -> PqosResult<u32> {
    let core_id = cpu
        .cores()
        .first()
        .map(|core| core.lcore)
        .ok_or_else(|| PqosError::failed("no cores in the topology"))?;

    let mut num_classes = 0;
    for class_id in 0..L3_PROBE_MAX_CLASSES {
        let register_id = L3_MASK_BASE + class_id;
        let accessible = msr
            .read(core_id, register_id)
            .and_then(|value| msr.write(core_id, register_id, value));
        if accessible.is_err() {
            break;
        }
        num_classes += 1;
    }

    if num_classes == 0 {
        return Err(PqosError::resource("L3 CAT is not present"));
    }
    tracing::info!("L3 CAT detected by probing, {num_classes} classes");
    Ok(num_classes)
}

/// CDP state of every socket, they have to agree.
fn detect_l3_cdp_on(msr: &dyn MsrAccess, cpu: &CpuInfo) -> PqosResult<bool> {
    let mut states = Vec::new();
    for socket in cpu.sockets() {
        let Some(core_id) = cpu.one_core_on_socket(socket) else {
            continue;
        };
        let qos_cfg = msr.read(core_id, L3_QOS_CFG)?;
        states.push(qos_cfg & L3_QOS_CFG_CDP_ENABLE != 0);
    }

    match (states.iter().all(|on| *on), states.iter().any(|on| *on)) {
        (true, _) => Ok(!states.is_empty()),
        (false, false) => Ok(false),
        (false, true) => {
            tracing::error!("L3 CDP is enabled on some sockets only, CAT reset is required");
            Err(PqosError::failed(
                "inconsistent L3 CDP state across sockets, reset CAT",
            ))
        }
    }
}

fn discover_l2ca(cpuid: &dyn CpuIdSource, cpu: &CpuInfo) -> PqosResult<L2CaCap> {
    if rdt_allocation_resources(cpuid) & (1 << 2) == 0 {
        return Err(PqosError::resource("CPUID doesn't report L2 CAT"));
    }

    let leaf = cpuid.cpuid(CPUID_RDT_ALLOCATION, 2);
    let num_ways = (leaf.eax & 0x1f) + 1;
    let l2 = cpu.l2();
    let way_size = if l2.detected {
        l2.total_size / num_ways
    } else {
        0
    };

    Ok(L2CaCap {
        num_classes: (leaf.edx & 0xffff) + 1,
        num_ways,
        way_size,
        way_contention: leaf.ebx as u64,
        os_support: false,
    })
}

fn discover_mba(cpuid: &dyn CpuIdSource) -> PqosResult<MbaCap> {
    if rdt_allocation_resources(cpuid) & (1 << 3) == 0 {
        return Err(PqosError::resource("CPUID doesn't report MBA"));
    }

    let leaf = cpuid.cpuid(CPUID_RDT_ALLOCATION, 3);
    let throttle_max = (leaf.eax & 0xfff) + 1;
    let is_linear = leaf.ecx & (1 << 2) != 0;
    if !is_linear {
        tracing::info!("non-linear MBA is not supported");
        return Err(PqosError::resource("MBA is not linear"));
    }

    Ok(MbaCap {
        num_classes: (leaf.edx & 0xffff) + 1,
        throttle_max,
        throttle_step: 100 - throttle_max,
        is_linear,
        os_support: false,
    })
}
