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

//! Model specific registers and CPUID leaves of Intel RDT and the core PMU.

pub(crate) const L3_QOS_CFG: u32 = 0xC81;
pub(crate) const L3_QOS_CFG_CDP_ENABLE: u64 = 1;

pub(crate) const QM_EVTSEL: u32 = 0xC8D;
pub(crate) const QM_EVTSEL_RMID_SHIFT: u32 = 32;

pub(crate) const QM_CTR: u32 = 0xC8E;
pub(crate) const QM_CTR_ERROR: u64 = 1 << 63;
pub(crate) const QM_CTR_UNAVAILABLE: u64 = 1 << 62;
pub(crate) const QM_CTR_DATA_MASK: u64 = (1 << 62) - 1;

pub(crate) const PQR_ASSOC: u32 = 0xC8F;
pub(crate) const PQR_ASSOC_COS_SHIFT: u32 = 32;
pub(crate) const PQR_ASSOC_RMID_MASK: u64 = 0x3ff;

pub(crate) const L3_MASK_BASE: u32 = 0xC90;
pub(crate) const L2_MASK_BASE: u32 = 0xD10;
pub(crate) const MBA_BASE: u32 = 0xD50;

/// Upper bound of classes probed when CPUID does not enumerate L3 CAT.
pub(crate) const L3_PROBE_MAX_CLASSES: u32 = 16;

pub(crate) const INST_RETIRED_ANY: u32 = 0x309;
pub(crate) const CPU_UNHALTED_THREAD: u32 = 0x30A;
pub(crate) const FIXED_CTR_CTRL: u32 = 0x38D;
pub(crate) const PERF_GLOBAL_CTRL: u32 = 0x38F;
pub(crate) const PMC0: u32 = 0xC1;
pub(crate) const PERFEVTSEL0: u32 = 0x186;

/// Fixed counters 0 and 1 counting in both user and kernel mode.
pub(crate) const FIXED_CTR_CTRL_ENABLE: u64 = 0x33;
pub(crate) const GLOBAL_CTRL_IPC: u64 = 0x3 << 32;
pub(crate) const GLOBAL_CTRL_LLC_MISS: u64 = 0x1;

/// LONGEST_LAT_CACHE.MISS in user and kernel mode, enabled.
pub(crate) const LLC_MISS_EVTSEL: u64 = 0x2E | (0x41 << 8) | (1 << 16) | (1 << 17) | (1 << 22);

/// Hardware event ids programmed into `QM_EVTSEL`.
pub(crate) const EVENT_ID_L3_OCCUP: u64 = 1;
pub(crate) const EVENT_ID_TMEM: u64 = 2;
pub(crate) const EVENT_ID_LMEM: u64 = 3;

pub(crate) const CPUID_EXT_FEATURES: u32 = 0x7;
pub(crate) const CPUID_ARCH_PERFMON: u32 = 0xA;
pub(crate) const CPUID_RDT_MONITORING: u32 = 0xF;
pub(crate) const CPUID_RDT_ALLOCATION: u32 = 0x10;

pub(crate) const EXT_FEATURES_EBX_PQM: u32 = 1 << 12;
pub(crate) const EXT_FEATURES_EBX_PQE: u32 = 1 << 15;
