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
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use pqos_cpu_utils::CpuInfo;
use pqos_cpu_utils::LogicalCoreId;

use crate::cap::Capabilities;
use crate::errors::PqosError;
use crate::mon_group::GroupState;
use crate::mon_group::MonGroup;
use crate::mon_group::MonTarget;
use crate::perf::PerfCounter;
use crate::perf::PerfEventConfig;
use crate::perf::PerfEventKind;
use crate::perf::PerfEvents;
use crate::perf::PerfRdt;
use crate::perf::PerfTarget;
use crate::types::MonEvent;
use crate::types::Pid;
use crate::utils::counter_delta;
use crate::PqosResult;

/// Open perf counters of one group, one per kind and core or thread.
pub(crate) struct PerfMonState {
    counters: BTreeMap<PerfEventKind, Vec<Box<dyn PerfCounter>>>,
    last: BTreeMap<PerfEventKind, u64>,
    polled: bool,
}

/// Monitoring through perf_event_open on cores or on all threads of a task.
pub(crate) struct OsMonitoring {
    perf_rdt: Option<PerfRdt>,
    perf: Arc<dyn PerfEvents>,
    proc_root: PathBuf,
    cpu: Arc<CpuInfo>,
}

impl OsMonitoring {
    pub(crate) fn new(
        perf_rdt: Option<PerfRdt>,
        perf: Arc<dyn PerfEvents>,
        proc_root: &Path,
        cpu: Arc<CpuInfo>,
    ) -> Self {
        Self {
            perf_rdt,
            perf,
            proc_root: proc_root.to_path_buf(),
            cpu,
        }
    }

    fn check_events(&self, cap: &Capabilities, event: MonEvent) -> PqosResult<()> {
        for single in event.iter() {
            let event_cap = cap.get_event(single)?;
            if !event_cap.os_support {
                return Err(PqosError::resource(format!(
                    "event {single:?} is not supported by the kernel"
                )));
            }
        }
        Ok(())
    }

    fn event_config(&self, kind: PerfEventKind) -> PqosResult<PerfEventConfig> {
        if let Some(config) = kind.hardware_config() {
            return Ok(config);
        }
        self.perf_rdt
            .as_ref()
            .and_then(|perf_rdt| perf_rdt.event(kind))
            .map(|rdt_event| rdt_event.config)
            .ok_or_else(|| PqosError::resource(format!("perf doesn't offer {kind:?}")))
    }

    fn scale(&self, kind: PerfEventKind) -> f64 {
        self.perf_rdt
            .as_ref()
            .and_then(|perf_rdt| perf_rdt.event(kind))
            .map_or(1.0, |rdt_event| rdt_event.scale)
    }

    pub(crate) fn start(
        &self,
        cap: &Capabilities,
        cores: &[LogicalCoreId],
        event: MonEvent,
        group: &mut MonGroup,
    ) -> PqosResult<()> {
        self.check_events(cap, event)?;
        for core_id in cores {
            if !self.cpu.check_core(*core_id) {
                return Err(PqosError::param(format!("core {core_id} doesn't exist")));
            }
        }

        let targets = cores
            .iter()
            .map(|core_id| PerfTarget::Core(*core_id))
            .collect::<Vec<_>>();
        let state = self.open_counters(event, &targets)?;
        group.activate(event, MonTarget::Cores(cores.to_vec()), GroupState::Perf(state));
        Ok(())
    }

    /// Every thread of the task is monitored, as listed in `/proc/<pid>/task`.
    pub(crate) fn start_pid(
        &self,
        cap: &Capabilities,
        pid: Pid,
        event: MonEvent,
        group: &mut MonGroup,
    ) -> PqosResult<()> {
        self.check_events(cap, event)?;

        let targets = self
            .task_threads(pid)?
            .into_iter()
            .map(PerfTarget::Task)
            .collect::<Vec<_>>();
        let state = self.open_counters(event, &targets)?;
        group.activate(event, MonTarget::Pid(pid), GroupState::Perf(state));
        Ok(())
    }

    fn task_threads(&self, pid: Pid) -> PqosResult<Vec<Pid>> {
        let task_dir = self.proc_root.join(pid.to_string()).join("task");
        let entries = std::fs::read_dir(&task_dir)
            .map_err(|_| PqosError::param(format!("task {pid} doesn't exist")))?;

        let mut tids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| PqosError::io("listing", &task_dir, error))?;
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<Pid>() {
                tids.push(tid);
            }
        }
        tids.sort_unstable();

        if tids.is_empty() {
            return Err(PqosError::param(format!("task {pid} has no threads")));
        }
        Ok(tids)
    }

    /// Every requested kind is attempted. A kind with a counter that fails to
    /// open is closed, and unless all kinds started nothing stays open.
    fn open_counters(&self, event: MonEvent, targets: &[PerfTarget]) -> PqosResult<PerfMonState> {
        let requested = event_kinds(event);
        let mut counters = BTreeMap::new();
        let mut first_error = None;

        for kind in requested.iter().copied() {
            let opened = self.event_config(kind).and_then(|config| {
                targets
                    .iter()
                    .map(|target| self.perf.open(config, *target))
                    .collect::<PqosResult<Vec<_>>>()
            });

            match opened {
                Ok(opened) => {
                    counters.insert(kind, opened);
                }
                Err(error) => {
                    tracing::warn!("{kind:?} counters can't be started: {error}");
                    first_error.get_or_insert(error);
                }
            }
        }

        if counters.len() != requested.len() {
            let started = counters.keys().copied().collect::<Vec<_>>();
            tracing::error!("started {started:?} out of {requested:?}, closing all counters");
            drop(counters);
            return Err(first_error
                .unwrap_or_else(|| PqosError::failed("not every monitoring event started")));
        }

        tracing::debug!(
            "opened {:?} counters on {} targets",
            requested,
            targets.len()
        );
        Ok(PerfMonState {
            counters,
            last: BTreeMap::new(),
            polled: false,
        })
    }

    pub(crate) fn poll(&self, group: &mut MonGroup) -> PqosResult<()> {
        let event = group.event();
        let Some(GroupState::Perf(state)) = group.state.as_mut() else {
            return Err(PqosError::param("group is not monitored through perf"));
        };
        let values = &mut group.values;

        let mut sums = BTreeMap::new();
        for (kind, counters) in state.counters.iter_mut() {
            let mut sum = 0u64;
            for counter in counters.iter_mut() {
                sum = sum.wrapping_add(counter.read()?);
            }
            sums.insert(*kind, sum);
        }
        let scaled = |kind: PerfEventKind, raw: u64| (raw as f64 * self.scale(kind)) as u64;

        if let Some(occupancy) = sums.get(&PerfEventKind::LlcOccupancy) {
            values.llc = scaled(PerfEventKind::LlcOccupancy, *occupancy);
        }
        if let Some(local) = sums.get(&PerfEventKind::LocalBytes) {
            let last = state.last.insert(PerfEventKind::LocalBytes, *local).unwrap_or(0);
            values.mbm_local = scaled(PerfEventKind::LocalBytes, *local);
            values.mbm_local_delta =
                scaled(PerfEventKind::LocalBytes, counter_delta(last, *local, 64));
        }
        if let Some(total) = sums.get(&PerfEventKind::TotalBytes) {
            let last = state.last.insert(PerfEventKind::TotalBytes, *total).unwrap_or(0);
            values.mbm_total = scaled(PerfEventKind::TotalBytes, *total);
            values.mbm_total_delta =
                scaled(PerfEventKind::TotalBytes, counter_delta(last, *total, 64));
        }
        if event.contains(MonEvent::RMEM_BW) {
            values.update_remote();
        }
        if !state.polled {
            values.clear_bandwidth_deltas();
            state.polled = true;
        }

        if let (Some(instructions), Some(cycles)) = (
            sums.get(&PerfEventKind::Instructions),
            sums.get(&PerfEventKind::Cycles),
        ) {
            values.update_ipc(*instructions, *cycles);
        }
        if let Some(misses) = sums.get(&PerfEventKind::CacheMisses) {
            values.update_llc_misses(*misses);
        }

        Ok(())
    }

    /// Dropping the state closes every counter.
    pub(crate) fn stop(&self, group: &mut MonGroup) -> PqosResult<()> {
        match group.state.take() {
            Some(GroupState::Perf(state)) => {
                tracing::debug!("closing {} perf counter kinds", state.counters.len());
                Ok(())
            }
            other => {
                group.state = other;
                Err(PqosError::param("group is not monitored through perf"))
            }
        }
    }
}

/// Counters needed for `event`. Remote bandwidth is local subtracted from total.
fn event_kinds(event: MonEvent) -> Vec<PerfEventKind> {
    let mut kinds = Vec::new();
    if event.contains(MonEvent::L3_OCCUP) {
        kinds.push(PerfEventKind::LlcOccupancy);
    }
    if event.intersects(MonEvent::LMEM_BW | MonEvent::RMEM_BW) {
        kinds.push(PerfEventKind::LocalBytes);
    }
    if event.intersects(MonEvent::TMEM_BW | MonEvent::RMEM_BW) {
        kinds.push(PerfEventKind::TotalBytes);
    }
    if event.contains(MonEvent::IPC) {
        kinds.push(PerfEventKind::Instructions);
        kinds.push(PerfEventKind::Cycles);
    }
    if event.contains(MonEvent::LLC_MISS) {
        kinds.push(PerfEventKind::CacheMisses);
    }
    kinds
}

#[cfg(test)]
mod tests;
