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

mod allocation;
mod monitoring;

use std::path::Path;
use std::sync::Arc;

use pqos_cpu_utils::CpuInfo;
use pqos_cpu_utils::LogicalCoreId;

pub(crate) use monitoring::PerfMonState;

use allocation::OsAllocation;
use monitoring::OsMonitoring;

use crate::backend::Backend;
use crate::cap::Capabilities;
use crate::errors::PqosError;
use crate::mon_group::MonGroup;
use crate::perf::PerfEvents;
use crate::perf::PerfRdt;
use crate::resctrl::ResctrlMount;
use crate::types::*;
use crate::PqosResult;

/// The OS interface: resctrl for allocation, perf for monitoring.
pub(crate) struct OsBackend {
    allocation: OsAllocation,
    monitoring: OsMonitoring,
}

pub(crate) struct OsBackendPaths<'p> {
    pub(crate) resctrl: &'p Path,
    pub(crate) proc: &'p Path,
}

impl OsBackend {
    /// Brings resctrl up and aligns `cap` with it.
    pub(crate) fn init(
        cap: &mut Capabilities,
        paths: OsBackendPaths<'_>,
        cpu: Arc<CpuInfo>,
        mounter: Arc<dyn ResctrlMount>,
        perf: Arc<dyn PerfEvents>,
        perf_rdt: Option<PerfRdt>,
    ) -> PqosResult<Self> {
        let allocation = OsAllocation::new(paths.resctrl, cpu.clone(), mounter);
        allocation.init(cap)?;

        Ok(Self {
            allocation,
            monitoring: OsMonitoring::new(perf_rdt, perf, paths.proc, cpu),
        })
    }
}

impl Backend for OsBackend {
    fn l3ca_set(&self, cap: &Capabilities, socket: u32, cas: &[L3Ca]) -> PqosResult<()> {
        self.allocation.l3ca_set(cap, socket, cas)
    }

    fn l3ca_get(&self, cap: &Capabilities, socket: u32) -> PqosResult<Vec<L3Ca>> {
        self.allocation.l3ca_get(cap, socket)
    }

    fn l3ca_get_min_cbm_bits(&self, cap: &Capabilities) -> PqosResult<u32> {
        self.allocation.l3ca_get_min_cbm_bits(cap)
    }

    fn l2ca_set(&self, cap: &Capabilities, l2_id: u32, cas: &[L2Ca]) -> PqosResult<()> {
        self.allocation.l2ca_set(cap, l2_id, cas)
    }

    fn l2ca_get(&self, cap: &Capabilities, l2_id: u32) -> PqosResult<Vec<L2Ca>> {
        self.allocation.l2ca_get(cap, l2_id)
    }

    fn l2ca_get_min_cbm_bits(&self, cap: &Capabilities) -> PqosResult<u32> {
        self.allocation.l2ca_get_min_cbm_bits(cap)
    }

    fn mba_set(&self, cap: &Capabilities, socket: u32, requested: &[Mba]) -> PqosResult<Vec<Mba>> {
        self.allocation.mba_set(cap, socket, requested)
    }

    fn mba_get(&self, cap: &Capabilities, socket: u32) -> PqosResult<Vec<Mba>> {
        self.allocation.mba_get(cap, socket)
    }

    fn alloc_assoc_set(
        &self,
        cap: &Capabilities,
        core_id: LogicalCoreId,
        class_id: ClassId,
    ) -> PqosResult<()> {
        self.allocation.assoc_set(cap, core_id, class_id)
    }

    fn alloc_assoc_get(&self, cap: &Capabilities, core_id: LogicalCoreId) -> PqosResult<ClassId> {
        self.allocation.assoc_get(cap, core_id)
    }

    fn alloc_assign(
        &self,
        cap: &Capabilities,
        technology: Technology,
        cores: &[LogicalCoreId],
    ) -> PqosResult<ClassId> {
        self.allocation.assign(cap, technology, cores)
    }

    fn alloc_release(&self, cap: &Capabilities, cores: &[LogicalCoreId]) -> PqosResult<()> {
        self.allocation.release(cap, cores)
    }

    fn alloc_reset(&self, cap: &mut Capabilities, l3_cdp: CdpConfig) -> PqosResult<()> {
        self.allocation.reset(cap, l3_cdp)
    }

    fn alloc_assoc_set_pid(&self, cap: &Capabilities, pid: Pid, class_id: ClassId) -> PqosResult<()> {
        self.allocation.assoc_set_pid(cap, pid, class_id)
    }

    fn alloc_assoc_get_pid(&self, cap: &Capabilities, pid: Pid) -> PqosResult<ClassId> {
        self.allocation.assoc_get_pid(cap, pid)
    }

    fn alloc_assign_pid(
        &self,
        cap: &Capabilities,
        technology: Technology,
        pids: &[Pid],
    ) -> PqosResult<ClassId> {
        self.allocation.assign_pid(cap, technology, pids)
    }

    fn alloc_release_pid(&self, _cap: &Capabilities, pids: &[Pid]) -> PqosResult<()> {
        self.allocation.release_pid(pids)
    }

    /// The kernel owns RMIDs, there is nothing to reset.
    fn mon_reset(&self, _cap: &Capabilities) -> PqosResult<()> {
        Ok(())
    }

    fn mon_assoc_get(&self, _core_id: LogicalCoreId) -> PqosResult<Rmid> {
        Err(PqosError::resource(
            "RMIDs are not visible through the OS interface",
        ))
    }

    fn mon_start(
        &self,
        cap: &Capabilities,
        cores: &[LogicalCoreId],
        event: MonEvent,
        group: &mut MonGroup,
    ) -> PqosResult<()> {
        self.monitoring.start(cap, cores, event, group)
    }

    fn mon_start_pid(
        &self,
        cap: &Capabilities,
        pid: Pid,
        event: MonEvent,
        group: &mut MonGroup,
    ) -> PqosResult<()> {
        self.monitoring.start_pid(cap, pid, event, group)
    }

    fn mon_stop(&self, group: &mut MonGroup) -> PqosResult<()> {
        self.monitoring.stop(group)
    }

    fn mon_poll(&self, _cap: &Capabilities, group: &mut MonGroup) -> PqosResult<()> {
        self.monitoring.poll(group)
    }
}
