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

use std::collections::BTreeMap;
use std::sync::Arc;

use pqos_config::PerfCounterPolicy;
use pqos_cpu_utils::CpuInfo;
use pqos_cpu_utils::LogicalCoreId;
use pqos_msr::MsrAccess;

use super::perf_counters;
use super::registers::*;
use crate::cap::Capabilities;
use crate::errors::PqosError;
use crate::mon_group::GroupState;
use crate::mon_group::MonGroup;
use crate::mon_group::MonTarget;
use crate::types::MonEvent;
use crate::types::Rmid;
use crate::utils::get_delta;
use crate::PqosResult;

const QM_CTR_READ_ATTEMPTS: usize = 3;

/// One RMID on one L3 cluster, read through `lcore`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PollContext {
    pub(crate) lcore: LogicalCoreId,
    pub(crate) rmid: Rmid,
    last_local: u64,
    last_total: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HwMonState {
    pub(crate) cores: Vec<LogicalCoreId>,
    pub(crate) contexts: Vec<PollContext>,
    polled: bool,
}

/// RMID based monitoring through model specific registers.
pub(crate) struct HwMonitoring {
    msr: Arc<dyn MsrAccess>,
    cpu: Arc<CpuInfo>,
    perf_policy: PerfCounterPolicy,
}

impl HwMonitoring {
    pub(crate) fn new(
        msr: Arc<dyn MsrAccess>,
        cpu: Arc<CpuInfo>,
        perf_policy: PerfCounterPolicy,
    ) -> Self {
        Self {
            msr,
            cpu,
            perf_policy,
        }
    }

    fn check_core(&self, core_id: LogicalCoreId) -> PqosResult<()> {
        if self.cpu.check_core(core_id) {
            Ok(())
        } else {
            Err(PqosError::param(format!("core {core_id} doesn't exist")))
        }
    }

    fn read_rmid(&self, core_id: LogicalCoreId) -> PqosResult<Rmid> {
        let assoc = self.msr.read(core_id, PQR_ASSOC)?;
        Ok((assoc & PQR_ASSOC_RMID_MASK) as Rmid)
    }

    /// The class half of the register is kept.
    fn write_rmid(&self, core_id: LogicalCoreId, rmid: Rmid) -> PqosResult<()> {
        let assoc = self.msr.read(core_id, PQR_ASSOC)?;
        let assoc = (assoc & !PQR_ASSOC_RMID_MASK) | (rmid as u64 & PQR_ASSOC_RMID_MASK);
        self.msr.write(core_id, PQR_ASSOC, assoc)?;
        Ok(())
    }

    /// Highest RMID below `max_rmid` no core of the cluster uses, RMID 0 is never handed out.
    fn alloc_rmid(&self, cluster: u32, max_rmid: u32) -> PqosResult<Rmid> {
        let mut used = vec![false; max_rmid as usize];
        for core in self.cpu.cores_on_l3(cluster) {
            let rmid = self.read_rmid(core.lcore)?;
            if let Some(slot) = used.get_mut(rmid as usize) {
                *slot = true;
            }
        }

        (1..max_rmid)
            .rev()
            .find(|rmid| !used[*rmid as usize])
            .ok_or_else(|| PqosError::resource(format!("no free RMID on L3 cluster {cluster}")))
    }

    /// Reads one event counter, retrying while the hardware reports no data yet.
    pub(crate) fn mon_read(
        &self,
        core_id: LogicalCoreId,
        rmid: Rmid,
        event_id: u64,
    ) -> PqosResult<u64> {
        let evtsel = ((rmid as u64 & PQR_ASSOC_RMID_MASK) << QM_EVTSEL_RMID_SHIFT) | event_id;
        self.msr.write(core_id, QM_EVTSEL, evtsel)?;

        for _ in 0..QM_CTR_READ_ATTEMPTS {
            let counter = self.msr.read(core_id, QM_CTR)?;
            if counter & QM_CTR_ERROR != 0 {
                return Err(PqosError::failed(format!(
                    "RMID {rmid} and event {event_id} can't be read together"
                )));
            }
            if counter & QM_CTR_UNAVAILABLE == 0 {
                return Ok(counter & QM_CTR_DATA_MASK);
            }
        }

        Err(PqosError::failed(format!(
            "monitoring data for RMID {rmid} is unavailable"
        )))
    }

    pub(crate) fn start(
        &self,
        cap: &Capabilities,
        cores: &[LogicalCoreId],
        event: MonEvent,
        group: &mut MonGroup,
    ) -> PqosResult<()> {
        let mut max_rmid = u32::MAX;
        for single in event.iter() {
            let event_cap = cap.get_event(single)?;
            if MonEvent::RDT.contains(single) {
                max_rmid = max_rmid.min(event_cap.max_rmid);
            }
        }
        if max_rmid == u32::MAX {
            return Err(PqosError::param(
                "at least one RDT monitoring event is required",
            ));
        }

        for core_id in cores {
            self.check_core(*core_id)?;
            let rmid = self.read_rmid(*core_id)?;
            if rmid != 0 {
                tracing::info!("core {core_id} is already monitored with RMID {rmid}");
                return Err(PqosError::resource(format!(
                    "core {core_id} is already monitored"
                )));
            }
        }

        let perf_event = event & MonEvent::PERF;
        if !perf_event.is_empty() {
            self.check_perf_counters(cores, perf_event)?;
        }

        let mut touched = Vec::new();
        match self.setup(cores, event, max_rmid, &mut touched) {
            Ok(contexts) => {
                let state = HwMonState {
                    cores: cores.to_vec(),
                    contexts,
                    polled: false,
                };
                group.activate(event, MonTarget::Cores(cores.to_vec()), GroupState::Msr(state));
                Ok(())
            }
            Err(error) => {
                tracing::error!("monitoring start failed, rolling back: {error}");
                for core_id in touched {
                    if let Err(rollback_error) = self.write_rmid(core_id, 0) {
                        tracing::error!("restoring RMID of core {core_id} failed: {rollback_error}");
                    }
                }
                if !perf_event.is_empty() {
                    for core_id in cores {
                        if let Err(stop_error) =
                            perf_counters::stop_counters(self.msr.as_ref(), *core_id, perf_event)
                        {
                            tracing::warn!(
                                "stopping performance counters of core {core_id} failed: {stop_error}"
                            );
                        }
                    }
                }
                Err(error)
            }
        }
    }

    fn check_perf_counters(&self, cores: &[LogicalCoreId], event: MonEvent) -> PqosResult<()> {
        for core_id in cores {
            if !perf_counters::counters_in_use(self.msr.as_ref(), *core_id, event)? {
                continue;
            }
            match self.perf_policy {
                PerfCounterPolicy::Warn => {
                    tracing::warn!(
                        "performance counters on core {core_id} are in use by another agent, taking them over"
                    );
                }
                PerfCounterPolicy::Fail => {
                    tracing::error!("performance counters on core {core_id} are in use");
                    return Err(PqosError::PerfCountersInUse {
                        core_id: core_id.get(),
                    });
                }
            }
        }
        Ok(())
    }

    fn setup(
        &self,
        cores: &[LogicalCoreId],
        event: MonEvent,
        max_rmid: u32,
        touched: &mut Vec<LogicalCoreId>,
    ) -> PqosResult<Vec<PollContext>> {
        let mut clusters: BTreeMap<u32, Vec<LogicalCoreId>> = BTreeMap::new();
        for core_id in cores {
            if let Some(core) = self.cpu.core(*core_id) {
                clusters.entry(core.l3_id).or_default().push(*core_id);
            }
        }

        let mut contexts = Vec::with_capacity(clusters.len());
        for (cluster, cluster_cores) in clusters {
            let rmid = self.alloc_rmid(cluster, max_rmid)?;
            for core_id in &cluster_cores {
                self.write_rmid(*core_id, rmid)?;
                touched.push(*core_id);
            }
            tracing::debug!("L3 cluster {cluster} monitored with RMID {rmid}");
            contexts.push(PollContext {
                lcore: cluster_cores[0],
                rmid,
                last_local: 0,
                last_total: 0,
            });
        }

        let perf_event = event & MonEvent::PERF;
        if !perf_event.is_empty() {
            for core_id in cores {
                perf_counters::start_counters(self.msr.as_ref(), *core_id, perf_event)?;
            }
        }

        Ok(contexts)
    }

    pub(crate) fn poll(&self, cap: &Capabilities, group: &mut MonGroup) -> PqosResult<()> {
        let event = group.event();
        let Some(GroupState::Msr(state)) = group.state.as_mut() else {
            return Err(PqosError::param("group is not monitored through MSRs"));
        };
        let values = &mut group.values;
        let scale = |single: MonEvent| {
            cap.get_event(single)
                .map(|event_cap| event_cap.scale_factor as u64)
        };

        if event.contains(MonEvent::L3_OCCUP) {
            let mut occupancy = 0;
            for context in &state.contexts {
                occupancy += self.mon_read(context.lcore, context.rmid, EVENT_ID_L3_OCCUP)?;
            }
            values.llc = occupancy * scale(MonEvent::L3_OCCUP)?;
        }

        if event.intersects(MonEvent::LMEM_BW | MonEvent::RMEM_BW) {
            let (mut raw, mut delta) = (0, 0);
            for context in state.contexts.iter_mut() {
                let counter = self.mon_read(context.lcore, context.rmid, EVENT_ID_LMEM)?;
                delta += get_delta(context.last_local, counter);
                context.last_local = counter;
                raw += counter;
            }
            let factor = scale(MonEvent::LMEM_BW)?;
            values.mbm_local = raw * factor;
            values.mbm_local_delta = delta * factor;
        }

        if event.intersects(MonEvent::TMEM_BW | MonEvent::RMEM_BW) {
            let (mut raw, mut delta) = (0, 0);
            for context in state.contexts.iter_mut() {
                let counter = self.mon_read(context.lcore, context.rmid, EVENT_ID_TMEM)?;
                delta += get_delta(context.last_total, counter);
                context.last_total = counter;
                raw += counter;
            }
            let factor = scale(MonEvent::TMEM_BW)?;
            values.mbm_total = raw * factor;
            values.mbm_total_delta = delta * factor;
        }

        if event.contains(MonEvent::RMEM_BW) {
            values.update_remote();
        }
        if !state.polled {
            values.clear_bandwidth_deltas();
            state.polled = true;
        }

        if event.contains(MonEvent::IPC) {
            let (mut retired, mut unhalted) = (0u64, 0u64);
            for core_id in &state.cores {
                let (core_retired, core_unhalted) =
                    perf_counters::read_ipc_counters(self.msr.as_ref(), *core_id)?;
                retired = retired.wrapping_add(core_retired);
                unhalted = unhalted.wrapping_add(core_unhalted);
            }
            values.update_ipc(retired, unhalted);
        }

        if event.contains(MonEvent::LLC_MISS) {
            let mut misses = 0u64;
            for core_id in &state.cores {
                misses = misses
                    .wrapping_add(perf_counters::read_llc_misses(self.msr.as_ref(), *core_id)?);
            }
            values.update_llc_misses(misses);
        }

        Ok(())
    }

    /// The group is invalidated even when some core can't be restored.
    pub(crate) fn stop(&self, group: &mut MonGroup) -> PqosResult<()> {
        let event = group.event();
        let state = match group.state.take() {
            Some(GroupState::Msr(state)) => state,
            other => {
                group.state = other;
                return Err(PqosError::param("group is not monitored through MSRs"));
            }
        };

        let mut result = Ok(());
        for core_id in &state.cores {
            if let Err(error) = self.write_rmid(*core_id, 0) {
                tracing::error!("releasing RMID of core {core_id} failed: {error}");
                result = result.and(Err(error));
            }
        }

        let perf_event = event & MonEvent::PERF;
        if !perf_event.is_empty() {
            for core_id in &state.cores {
                if let Err(error) =
                    perf_counters::stop_counters(self.msr.as_ref(), *core_id, perf_event)
                {
                    tracing::error!("stopping counters on core {core_id} failed: {error}");
                    result = result.and(Err(error));
                }
            }
        }

        result
    }

    pub(crate) fn reset(&self) -> PqosResult<()> {
        for core in self.cpu.cores() {
            self.write_rmid(core.lcore, 0)?;
        }
        Ok(())
    }

    pub(crate) fn assoc_get(&self, core_id: LogicalCoreId) -> PqosResult<Rmid> {
        self.check_core(core_id)?;
        self.read_rmid(core_id)
    }
}

#[cfg(test)]
mod tests;
