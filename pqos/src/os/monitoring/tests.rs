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

use std::sync::Arc;

use pqos_test_utils::two_socket_cpuinfo;
use pqos_test_utils::FakeCpuId;
use pqos_test_utils::PerfRdtTree;
use pqos_test_utils::ProcTree;
use tempfile::TempDir;
use test_log::test;

use super::*;
use crate::cap::apply_os_support;
use crate::cap::discover;
use crate::cap::OsSupport;
use crate::test_support::FakePerfEvents;
use crate::test_support::LLC_OCCUPANCY_CONFIG;
use crate::test_support::LOCAL_BYTES_CONFIG;
use crate::test_support::RDT_PERF_TYPE;
use crate::test_support::TOTAL_BYTES_CONFIG;
use crate::Status;

struct Setup {
    _dir: TempDir,
    perf: FakePerfEvents,
    cap: Capabilities,
    monitoring: OsMonitoring,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let proc_root = dir.path().join("proc");
    let perf_root = dir.path().join("intel_cqm");
    ProcTree::new()
        .with_process(1234, &[1235, 1234])
        .build(&proc_root);
    PerfRdtTree::new(RDT_PERF_TYPE)
        .with_event("llc_occupancy", LLC_OCCUPANCY_CONFIG as u32, 1.0)
        .with_event("local_bytes", LOCAL_BYTES_CONFIG as u32, 2.0)
        .with_event("total_bytes", TOTAL_BYTES_CONFIG as u32, 2.0)
        .build(&perf_root);
    let perf_rdt = PerfRdt::discover(&perf_root).unwrap().unwrap();

    let cpu = Arc::new(two_socket_cpuinfo());
    let mut cap = discover(&FakeCpuId::rdt_server(), None, &cpu).unwrap();
    let support = OsSupport {
        cqm: true,
        resctrl: true,
        ..Default::default()
    };
    apply_os_support(&mut cap, &support, perf_rdt.supported_events());

    let perf = FakePerfEvents::new();
    let monitoring = OsMonitoring::new(Some(perf_rdt), Arc::new(perf.clone()), &proc_root, cpu);
    Setup {
        _dir: dir,
        perf,
        cap,
        monitoring,
    }
}

fn core(id: u32) -> LogicalCoreId {
    LogicalCoreId::new(id)
}

fn rdt(config: u64) -> PerfEventConfig {
    PerfEventConfig {
        perf_type: RDT_PERF_TYPE,
        config,
    }
}

#[test]
fn start_opens_counter_per_core_and_event() {
    let Setup { _dir, perf, cap, monitoring, .. } = setup();
    let mut group = MonGroup::new();

    monitoring
        .start(
            &cap,
            &[core(0), core(5)],
            MonEvent::L3_OCCUP | MonEvent::LMEM_BW,
            &mut group,
        )
        .unwrap();

    assert!(group.is_valid());
    assert_eq!(group.target(), Some(&MonTarget::Cores(vec![core(0), core(5)])));
    assert_eq!(
        perf.opened(),
        vec![
            (rdt(LLC_OCCUPANCY_CONFIG), PerfTarget::Core(core(0))),
            (rdt(LLC_OCCUPANCY_CONFIG), PerfTarget::Core(core(5))),
            (rdt(LOCAL_BYTES_CONFIG), PerfTarget::Core(core(0))),
            (rdt(LOCAL_BYTES_CONFIG), PerfTarget::Core(core(5))),
        ]
    );
    assert_eq!(perf.open_now(), 4);
}

#[test]
fn start_pid_follows_every_thread() {
    let Setup { _dir, perf, cap, monitoring, .. } = setup();
    let mut group = MonGroup::new();

    monitoring
        .start_pid(&cap, 1234, MonEvent::L3_OCCUP, &mut group)
        .unwrap();

    assert_eq!(group.target(), Some(&MonTarget::Pid(1234)));
    let targets = perf
        .opened()
        .into_iter()
        .map(|(_, target)| target)
        .collect::<Vec<_>>();
    assert_eq!(targets, vec![PerfTarget::Task(1234), PerfTarget::Task(1235)]);
}

#[test]
fn start_pid_of_missing_task() {
    let Setup { _dir, cap, monitoring, .. } = setup();
    let mut group = MonGroup::new();

    let error = monitoring
        .start_pid(&cap, 999, MonEvent::L3_OCCUP, &mut group)
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::Param);
    assert!(!group.is_valid());
}

#[test]
fn start_checks_cores_and_events() {
    let Setup { _dir, mut cap, monitoring, .. } = setup();
    let mut group = MonGroup::new();

    let error = monitoring
        .start(&cap, &[core(42)], MonEvent::L3_OCCUP, &mut group)
        .err()
        .unwrap();
    assert_eq!(error.status(), Status::Param);

    if let Some(mon) = cap.mon_mut() {
        for event in mon.events.iter_mut() {
            event.os_support = false;
        }
    }
    let error = monitoring
        .start(&cap, &[core(0)], MonEvent::L3_OCCUP, &mut group)
        .err()
        .unwrap();
    assert_eq!(error.status(), Status::Resource);
}

#[test]
fn partial_start_closes_everything() {
    let Setup { _dir, perf, cap, monitoring, .. } = setup();
    perf.fail_on(RDT_PERF_TYPE, TOTAL_BYTES_CONFIG);
    let mut group = MonGroup::new();

    let error = monitoring
        .start(
            &cap,
            &[core(0), core(1)],
            MonEvent::L3_OCCUP | MonEvent::TMEM_BW,
            &mut group,
        )
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::Error);
    assert!(!group.is_valid());
    assert_eq!(perf.opened().len(), 2);
    assert_eq!(perf.open_now(), 0);
}

#[test]
fn poll_sums_and_scales() {
    let Setup { _dir, perf, cap, monitoring, .. } = setup();
    let mut group = MonGroup::new();
    monitoring
        .start(
            &cap,
            &[core(0), core(1)],
            MonEvent::L3_OCCUP | MonEvent::RMEM_BW,
            &mut group,
        )
        .unwrap();

    perf.set_value(RDT_PERF_TYPE, LLC_OCCUPANCY_CONFIG, 100);
    perf.set_value(RDT_PERF_TYPE, LOCAL_BYTES_CONFIG, 50);
    perf.set_value(RDT_PERF_TYPE, TOTAL_BYTES_CONFIG, 70);
    monitoring.poll(&mut group).unwrap();

    let values = *group.values();
    assert_eq!(values.llc, 200);
    assert_eq!(values.mbm_local, 200);
    assert_eq!(values.mbm_total, 280);
    assert_eq!(values.mbm_remote, 80);
    assert_eq!(values.mbm_local_delta, 0);
    assert_eq!(values.mbm_remote_delta, 0);

    perf.set_value(RDT_PERF_TYPE, LOCAL_BYTES_CONFIG, 80);
    perf.set_value(RDT_PERF_TYPE, TOTAL_BYTES_CONFIG, 120);
    monitoring.poll(&mut group).unwrap();

    let values = *group.values();
    assert_eq!(values.mbm_local_delta, 120);
    assert_eq!(values.mbm_total_delta, 200);
    assert_eq!(values.mbm_remote_delta, 80);
}

#[test]
fn poll_computes_ipc_from_hardware_events() {
    let Setup { _dir, perf, cap, monitoring, .. } = setup();
    let mut group = MonGroup::new();
    monitoring
        .start(&cap, &[core(3)], MonEvent::IPC | MonEvent::LLC_MISS, &mut group)
        .unwrap();
    let hardware = |kind: PerfEventKind| kind.hardware_config().unwrap();

    let instructions = hardware(PerfEventKind::Instructions);
    let cycles = hardware(PerfEventKind::Cycles);
    let misses = hardware(PerfEventKind::CacheMisses);
    perf.set_value(instructions.perf_type, instructions.config, 300);
    perf.set_value(cycles.perf_type, cycles.config, 600);
    perf.set_value(misses.perf_type, misses.config, 9);
    monitoring.poll(&mut group).unwrap();

    let values = *group.values();
    assert_eq!(values.ipc, 0.5);
    assert_eq!(values.llc_misses, 9);
    assert_eq!(values.llc_misses_delta, 9);
}

#[test]
fn stop_closes_counters() {
    let Setup { _dir, perf, cap, monitoring, .. } = setup();
    let mut group = MonGroup::new();
    monitoring
        .start(&cap, &[core(0)], MonEvent::L3_OCCUP | MonEvent::TMEM_BW, &mut group)
        .unwrap();
    assert_eq!(perf.open_now(), 2);

    monitoring.stop(&mut group).unwrap();

    assert_eq!(perf.open_now(), 0);
    assert!(!group.is_valid());
    let error = monitoring.stop(&mut group).err().unwrap();
    assert_eq!(error.status(), Status::Param);
    let error = monitoring.poll(&mut group).err().unwrap();
    assert_eq!(error.status(), Status::Param);
}
