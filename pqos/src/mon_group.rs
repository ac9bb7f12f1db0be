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

use crate::hw::HwMonState;
use crate::os::PerfMonState;
use crate::types::MonEvent;
use crate::types::Pid;
use crate::utils::counter_delta;

/// Counters of one monitoring group as of the last poll. Sizes are in bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MonValues {
    pub llc: u64,
    pub mbm_local: u64,
    pub mbm_total: u64,
    pub mbm_remote: u64,
    pub mbm_local_delta: u64,
    pub mbm_total_delta: u64,
    pub mbm_remote_delta: u64,
    pub ipc_retired: u64,
    pub ipc_retired_delta: u64,
    pub ipc_unhalted: u64,
    pub ipc_unhalted_delta: u64,
    pub ipc: f64,
    pub llc_misses: u64,
    pub llc_misses_delta: u64,
}

impl MonValues {
    pub(crate) fn update_ipc(&mut self, retired: u64, unhalted: u64) {
        self.ipc_retired_delta = counter_delta(self.ipc_retired, retired, 64);
        self.ipc_unhalted_delta = counter_delta(self.ipc_unhalted, unhalted, 64);
        self.ipc_retired = retired;
        self.ipc_unhalted = unhalted;
        self.ipc = if self.ipc_unhalted_delta > 0 {
            self.ipc_retired_delta as f64 / self.ipc_unhalted_delta as f64
        } else {
            0.0
        };
    }

    pub(crate) fn update_llc_misses(&mut self, misses: u64) {
        self.llc_misses_delta = counter_delta(self.llc_misses, misses, 64);
        self.llc_misses = misses;
    }

    pub(crate) fn update_remote(&mut self) {
        self.mbm_remote = self.mbm_total.saturating_sub(self.mbm_local);
        self.mbm_remote_delta = self.mbm_total_delta.saturating_sub(self.mbm_local_delta);
    }

    /// There is no baseline before the first poll.
    pub(crate) fn clear_bandwidth_deltas(&mut self) {
        self.mbm_local_delta = 0;
        self.mbm_total_delta = 0;
        self.mbm_remote_delta = 0;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonTarget {
    Cores(Vec<LogicalCoreId>),
    Pid(Pid),
}

pub(crate) enum GroupState {
    Msr(HwMonState),
    Perf(PerfMonState),
}

/// A monitoring session owned by the caller. It becomes valid on a successful
/// start and invalid again on stop.
#[derive(Default)]
pub struct MonGroup {
    pub(crate) event: Option<MonEvent>,
    pub(crate) target: Option<MonTarget>,
    pub(crate) values: MonValues,
    pub(crate) state: Option<GroupState>,
}

impl MonGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    pub fn event(&self) -> MonEvent {
        self.event.unwrap_or(MonEvent::empty())
    }

    pub fn target(&self) -> Option<&MonTarget> {
        self.target.as_ref()
    }

    pub fn values(&self) -> &MonValues {
        &self.values
    }

    pub(crate) fn activate(&mut self, event: MonEvent, target: MonTarget, state: GroupState) {
        self.event = Some(event);
        self.target = Some(target);
        self.values = MonValues::default();
        self.state = Some(state);
    }
}

impl std::fmt::Debug for MonGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonGroup")
            .field("event", &self.event)
            .field("target", &self.target)
            .field("values", &self.values)
            .field("valid", &self.is_valid())
            .finish()
    }
}
