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

use pqos_cpu_utils::LogicalCoreId;
use pqos_msr::MsrAccess;

use super::registers::*;
use crate::types::MonEvent;
use crate::PqosResult;

pub(crate) fn global_ctrl_mask(event: MonEvent) -> u64 {
    let mut mask = 0;
    if event.contains(MonEvent::IPC) {
        mask |= GLOBAL_CTRL_IPC;
    }
    if event.contains(MonEvent::LLC_MISS) {
        mask |= GLOBAL_CTRL_LLC_MISS;
    }
    mask
}

/// Someone else already enabled the counters `event` needs.
pub(crate) fn counters_in_use(
    msr: &dyn MsrAccess,
    core_id: LogicalCoreId,
    event: MonEvent,
) -> PqosResult<bool> {
    let global_ctrl = msr.read(core_id, PERF_GLOBAL_CTRL)?;
    Ok(global_ctrl & global_ctrl_mask(event) != 0)
}

pub(crate) fn start_counters(
    msr: &dyn MsrAccess,
    core_id: LogicalCoreId,
    event: MonEvent,
) -> PqosResult<()> {
    msr.write(core_id, PERF_GLOBAL_CTRL, 0)?;

    if event.contains(MonEvent::IPC) {
        msr.write(core_id, INST_RETIRED_ANY, 0)?;
        msr.write(core_id, CPU_UNHALTED_THREAD, 0)?;
        msr.write(core_id, FIXED_CTR_CTRL, FIXED_CTR_CTRL_ENABLE)?;
    }
    if event.contains(MonEvent::LLC_MISS) {
        msr.write(core_id, PMC0, 0)?;
        msr.write(core_id, PERFEVTSEL0, LLC_MISS_EVTSEL)?;
    }

    msr.write(core_id, PERF_GLOBAL_CTRL, global_ctrl_mask(event))?;
    Ok(())
}

pub(crate) fn stop_counters(
    msr: &dyn MsrAccess,
    core_id: LogicalCoreId,
    event: MonEvent,
) -> PqosResult<()> {
    msr.write(core_id, PERF_GLOBAL_CTRL, 0)?;
    if event.contains(MonEvent::IPC) {
        msr.write(core_id, FIXED_CTR_CTRL, 0)?;
    }
    if event.contains(MonEvent::LLC_MISS) {
        msr.write(core_id, PERFEVTSEL0, 0)?;
    }
    Ok(())
}

/// Retired instructions and unhalted cycles.
pub(crate) fn read_ipc_counters(
    msr: &dyn MsrAccess,
    core_id: LogicalCoreId,
) -> PqosResult<(u64, u64)> {
    let retired = msr.read(core_id, INST_RETIRED_ANY)?;
    let unhalted = msr.read(core_id, CPU_UNHALTED_THREAD)?;
    Ok((retired, unhalted))
}

pub(crate) fn read_llc_misses(msr: &dyn MsrAccess, core_id: LogicalCoreId) -> PqosResult<u64> {
    Ok(msr.read(core_id, PMC0)?)
}
