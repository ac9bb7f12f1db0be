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

//! Fixtures shared by the unit tests of both interfaces.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use pqos_config::Interface;
use pqos_config::Paths;
use pqos_config::PqosConfig;
use pqos_test_utils::two_socket_cpuinfo;
use pqos_test_utils::FakeCpuId;
use pqos_test_utils::FakeMsr;
use pqos_test_utils::PerfRdtTree;
use pqos_test_utils::ProcTree;
use pqos_test_utils::ResctrlTree;

use crate::errors::PqosError;
use crate::perf::PerfCounter;
use crate::perf::PerfEventConfig;
use crate::perf::PerfEvents;
use crate::perf::PerfTarget;
use crate::platform::Platform;
use crate::resctrl::ResctrlMount;
use crate::PqosResult;

pub(crate) const RDT_PERF_TYPE: u32 = 9;
pub(crate) const LLC_OCCUPANCY_CONFIG: u64 = 1;
pub(crate) const TOTAL_BYTES_CONFIG: u64 = 2;
pub(crate) const LOCAL_BYTES_CONFIG: u64 = 3;

/// Mounting builds the tree anew, unmounting wipes it.
pub(crate) struct FakeMount {
    tree: ResctrlTree,
    mounts: Mutex<Vec<bool>>,
}

impl FakeMount {
    pub(crate) fn new(tree: ResctrlTree) -> Self {
        Self {
            tree,
            mounts: Mutex::new(Vec::new()),
        }
    }

    /// The `cdp` option of every mount so far.
    pub(crate) fn mounts(&self) -> Vec<bool> {
        self.mounts.lock().clone()
    }
}

impl ResctrlMount for FakeMount {
    fn mount(&self, _root: &Path, cdp: bool) -> PqosResult<()> {
        self.tree.clone().with_cdp(cdp).build();
        self.mounts.lock().push(cdp);
        Ok(())
    }

    fn unmount(&self, _root: &Path) -> PqosResult<()> {
        self.tree.clear();
        Ok(())
    }
}

#[derive(Default)]
struct FakePerfState {
    values: HashMap<(u32, u64), u64>,
    failing: HashSet<(u32, u64)>,
    opened: Vec<(PerfEventConfig, PerfTarget)>,
    open_now: usize,
}

/// Every counter of one event config reads the same settable value.
#[derive(Clone, Default)]
pub(crate) struct FakePerfEvents {
    state: Arc<Mutex<FakePerfState>>,
}

impl FakePerfEvents {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_value(&self, perf_type: u32, config: u64, value: u64) {
        self.state.lock().values.insert((perf_type, config), value);
    }

    pub(crate) fn fail_on(&self, perf_type: u32, config: u64) {
        self.state.lock().failing.insert((perf_type, config));
    }

    pub(crate) fn opened(&self) -> Vec<(PerfEventConfig, PerfTarget)> {
        self.state.lock().opened.clone()
    }

    /// Counters opened and not yet dropped.
    pub(crate) fn open_now(&self) -> usize {
        self.state.lock().open_now
    }
}

impl PerfEvents for FakePerfEvents {
    fn open(&self, event: PerfEventConfig, target: PerfTarget) -> PqosResult<Box<dyn PerfCounter>> {
        let mut state = self.state.lock();
        if state.failing.contains(&(event.perf_type, event.config)) {
            return Err(PqosError::sys("perf_event_open", nix::errno::Errno::ENOENT));
        }
        state.opened.push((event, target));
        state.open_now += 1;

        Ok(Box::new(FakeCounter {
            key: (event.perf_type, event.config),
            state: self.state.clone(),
        }))
    }
}

struct FakeCounter {
    key: (u32, u64),
    state: Arc<Mutex<FakePerfState>>,
}

impl PerfCounter for FakeCounter {
    fn read(&mut self) -> PqosResult<u64> {
        Ok(self.state.lock().values.get(&self.key).copied().unwrap_or(0))
    }
}

impl Drop for FakeCounter {
    fn drop(&mut self) {
        self.state.lock().open_now -= 1;
    }
}

/// Paths inside `dir`, nothing below them exists yet.
pub(crate) fn test_config(dir: &Path, interface: Interface) -> PqosConfig {
    PqosConfig {
        interface,
        lock_file: dir.join("libpqos"),
        paths: Paths {
            resctrl: dir.join("resctrl"),
            proc: dir.join("proc"),
            sysfs_cpu: dir.join("cpu"),
            perf_rdt: dir.join("intel_cqm"),
            dev_cpu: dir.join("dev_cpu"),
        },
        ..Default::default()
    }
}

/// resctrl matching `FakeCpuId::rdt_server` on `two_socket_cpuinfo`, not built yet.
pub(crate) fn server_resctrl_tree(root: &Path) -> ResctrlTree {
    ResctrlTree::new(root, 8)
        .with_l3(4, 16, &[0, 1])
        .with_l2(4, 8, &[0, 1, 2, 3])
        .with_mba(8, &[0, 1])
        .with_groups(4)
}

/// A kernel with resctrl and the perf RDT pmu, process 1234 has threads 1234 and 1235.
pub(crate) fn build_os_support(config: &PqosConfig) {
    ProcTree::new()
        .with_cpu_flags(&["cqm", "cqm_llc", "cqm_occup_llc", "cat_l3", "cdp_l3", "cat_l2", "mba"])
        .with_filesystems(&["sysfs", "resctrl"])
        .with_process(1234, &[1234, 1235])
        .build(&config.paths.proc);
    PerfRdtTree::new(RDT_PERF_TYPE)
        .with_event("llc_occupancy", LLC_OCCUPANCY_CONFIG as u32, 1.0)
        .with_event("total_bytes", TOTAL_BYTES_CONFIG as u32, 2.0)
        .with_event("local_bytes", LOCAL_BYTES_CONFIG as u32, 2.0)
        .build(&config.paths.perf_rdt);
}

pub(crate) fn fake_platform(
    msr: Arc<FakeMsr>,
    mount: Arc<FakeMount>,
    perf: FakePerfEvents,
) -> Platform {
    Platform {
        cpuid: Arc::new(FakeCpuId::rdt_server()),
        msr,
        mounter: mount,
        perf: Arc::new(perf),
        cpu: Arc::new(two_socket_cpuinfo()),
    }
}
