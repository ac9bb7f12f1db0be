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
use pqos_cpu_utils::LogicalCoreId;

use crate::cap::Capabilities;
use crate::errors::PqosError;
use crate::mon_group::MonGroup;
use crate::types::*;
use crate::PqosResult;

/// One control plane: direct register access or the kernel interfaces.
/// Parameters are validated by the caller, class ids excepted.
pub(crate) trait Backend: Send {
    fn l3ca_set(&self, cap: &Capabilities, socket: u32, cas: &[L3Ca]) -> PqosResult<()>;

    fn l3ca_get(&self, cap: &Capabilities, socket: u32) -> PqosResult<Vec<L3Ca>>;

    fn l3ca_get_min_cbm_bits(&self, cap: &Capabilities) -> PqosResult<u32>;

    fn l2ca_set(&self, cap: &Capabilities, l2_id: u32, cas: &[L2Ca]) -> PqosResult<()>;

    fn l2ca_get(&self, cap: &Capabilities, l2_id: u32) -> PqosResult<Vec<L2Ca>>;

    fn l2ca_get_min_cbm_bits(&self, cap: &Capabilities) -> PqosResult<u32>;

    /// Returns the rates actually applied.
    fn mba_set(&self, cap: &Capabilities, socket: u32, requested: &[Mba]) -> PqosResult<Vec<Mba>>;

    fn mba_get(&self, cap: &Capabilities, socket: u32) -> PqosResult<Vec<Mba>>;

    fn alloc_assoc_set(
        &self,
        cap: &Capabilities,
        core_id: LogicalCoreId,
        class_id: ClassId,
    ) -> PqosResult<()>;

    fn alloc_assoc_get(&self, cap: &Capabilities, core_id: LogicalCoreId) -> PqosResult<ClassId>;

    fn alloc_assign(
        &self,
        cap: &Capabilities,
        technology: Technology,
        cores: &[LogicalCoreId],
    ) -> PqosResult<ClassId>;

    fn alloc_release(&self, cap: &Capabilities, cores: &[LogicalCoreId]) -> PqosResult<()>;

    fn alloc_reset(&self, cap: &mut Capabilities, l3_cdp: CdpConfig) -> PqosResult<()>;

    fn alloc_assoc_set_pid(&self, _cap: &Capabilities, _pid: Pid, _class_id: ClassId) -> PqosResult<()> {
        Err(tasks_unsupported())
    }

    fn alloc_assoc_get_pid(&self, _cap: &Capabilities, _pid: Pid) -> PqosResult<ClassId> {
        Err(tasks_unsupported())
    }

    fn alloc_assign_pid(
        &self,
        _cap: &Capabilities,
        _technology: Technology,
        _pids: &[Pid],
    ) -> PqosResult<ClassId> {
        Err(tasks_unsupported())
    }

    fn alloc_release_pid(&self, _cap: &Capabilities, _pids: &[Pid]) -> PqosResult<()> {
        Err(tasks_unsupported())
    }

    fn mon_reset(&self, cap: &Capabilities) -> PqosResult<()>;

    fn mon_assoc_get(&self, core_id: LogicalCoreId) -> PqosResult<Rmid>;

    fn mon_start(
        &self,
        cap: &Capabilities,
        cores: &[LogicalCoreId],
        event: MonEvent,
        group: &mut MonGroup,
    ) -> PqosResult<()>;

    fn mon_start_pid(
        &self,
        _cap: &Capabilities,
        _pid: Pid,
        _event: MonEvent,
        _group: &mut MonGroup,
    ) -> PqosResult<()> {
        Err(tasks_unsupported())
    }

    fn mon_stop(&self, group: &mut MonGroup) -> PqosResult<()>;

    fn mon_poll(&self, cap: &Capabilities, group: &mut MonGroup) -> PqosResult<()>;
}

fn tasks_unsupported() -> PqosError {
    PqosError::resource("task level control requires the OS interface")
}

/// Cores assigned together have to share one socket, or one L2 cluster when
/// L2 CAT is among the technologies.
pub(crate) fn check_assign_scope(
    cpu: &CpuInfo,
    technology: Technology,
    cores: &[LogicalCoreId],
) -> PqosResult<()> {
    let infos = cores
        .iter()
        .map(|core_id| {
            cpu.core(*core_id)
                .ok_or_else(|| PqosError::param(format!("core {core_id} doesn't exist")))
        })
        .collect::<PqosResult<Vec<_>>>()?;

    let scope = |info: &&pqos_cpu_utils::CoreInfo| {
        if technology.contains(Technology::L2CA) {
            info.l2_id
        } else {
            info.socket
        }
    };
    let Some(first) = infos.first().map(scope) else {
        return Err(PqosError::param("no cores to assign"));
    };
    if infos.iter().any(|info| scope(info) != first) {
        return Err(PqosError::param(
            "cores have to share one socket, or one L2 cluster for L2 CAT",
        ));
    }
    Ok(())
}

/// Classes usable for all of `technology`, i.e. the smallest class count.
pub(crate) fn class_limit(cap: &Capabilities, technology: Technology) -> PqosResult<u32> {
    let mut limit = u32::MAX;
    if technology.contains(Technology::L3CA) {
        let l3ca = cap
            .l3ca()
            .ok_or_else(|| PqosError::resource("L3 CAT is not supported"))?;
        limit = limit.min(l3ca.num_classes);
    }
    if technology.contains(Technology::L2CA) {
        let l2ca = cap
            .l2ca()
            .ok_or_else(|| PqosError::resource("L2 CAT is not supported"))?;
        limit = limit.min(l2ca.num_classes);
    }
    if technology.contains(Technology::MBA) {
        let mba = cap
            .mba()
            .ok_or_else(|| PqosError::resource("MBA is not supported"))?;
        limit = limit.min(mba.num_classes);
    }
    Ok(limit)
}

/// Highest class in `1..limit` not in `used`. Lower ids are left for manual setup.
pub(crate) fn highest_unused_class(used: &[bool], limit: u32) -> PqosResult<ClassId> {
    (1..limit)
        .rev()
        .find(|class_id| !used.get(*class_id as usize).copied().unwrap_or(false))
        .ok_or_else(|| PqosError::resource("no free class of service"))
}

/// L3 CDP can be changed only where CAT, and for enabling CDP, is present.
pub(crate) fn check_cdp_request(cap: &Capabilities, l3_cdp: CdpConfig) -> PqosResult<()> {
    if l3_cdp == CdpConfig::Any {
        return Ok(());
    }
    let l3ca = cap
        .l3ca()
        .ok_or_else(|| PqosError::param("L3 CDP setting requires L3 CAT"))?;
    if l3_cdp == CdpConfig::On && !l3ca.cdp {
        return Err(PqosError::resource("L3 CDP is not supported"));
    }
    Ok(())
}
