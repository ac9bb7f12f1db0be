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
mod perf_counters;
pub(crate) mod registers;

use std::sync::Arc;

use pqos_config::PerfCounterPolicy;
use pqos_cpu_utils::CpuInfo;
use pqos_cpu_utils::LogicalCoreId;
use pqos_msr::MsrAccess;

pub(crate) use monitoring::HwMonState;

use allocation::HwAllocation;
use monitoring::HwMonitoring;

use crate::backend::Backend;
use crate::cap::Capabilities;
use crate::mon_group::MonGroup;
use crate::types::*;
use crate::PqosResult;

/// The MSR interface.
pub(crate) struct HwBackend {
    allocation: HwAllocation,
    monitoring: HwMonitoring,
}

impl HwBackend {
    pub(crate) fn new(
        msr: Arc<dyn MsrAccess>,
        cpu: Arc<CpuInfo>,
        perf_policy: PerfCounterPolicy,
    ) -> Self {
        Self {
            allocation: HwAllocation::new(msr.clone(), cpu.clone()),
            monitoring: HwMonitoring::new(msr, cpu, perf_policy),
        }
    }
}

impl Backend for HwBackend {
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

    fn alloc_assoc_get(&self, _cap: &Capabilities, core_id: LogicalCoreId) -> PqosResult<ClassId> {
        self.allocation.assoc_get(core_id)
    }

    fn alloc_assign(
        &self,
        cap: &Capabilities,
        technology: Technology,
        cores: &[LogicalCoreId],
    ) -> PqosResult<ClassId> {
        self.allocation.assign(cap, technology, cores)
    }

    fn alloc_release(&self, _cap: &Capabilities, cores: &[LogicalCoreId]) -> PqosResult<()> {
        self.allocation.release(cores)
    }

    fn alloc_reset(&self, cap: &mut Capabilities, l3_cdp: CdpConfig) -> PqosResult<()> {
        self.allocation.reset(cap, l3_cdp)
    }

    fn mon_reset(&self, _cap: &Capabilities) -> PqosResult<()> {
        self.monitoring.reset()
    }

    fn mon_assoc_get(&self, core_id: LogicalCoreId) -> PqosResult<Rmid> {
        self.monitoring.assoc_get(core_id)
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

    fn mon_stop(&self, group: &mut MonGroup) -> PqosResult<()> {
        self.monitoring.stop(group)
    }

    fn mon_poll(&self, cap: &Capabilities, group: &mut MonGroup) -> PqosResult<()> {
        self.monitoring.poll(cap, group)
    }
}
