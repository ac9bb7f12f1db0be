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
use pqos_test_utils::FakeMsr;
use test_log::test;

use super::*;
use crate::cap::discover;
use crate::cap::Capability;
use crate::cap::MonCap;
use crate::cap::MonEventCap;
use crate::Status;

const SCALE: u64 = 65536;

fn setup(policy: PerfCounterPolicy) -> (Arc<FakeMsr>, Capabilities, HwMonitoring) {
    let msr = Arc::new(FakeMsr::new());
    let cpu = Arc::new(two_socket_cpuinfo());
    let cap = discover(&FakeCpuId::rdt_server(), Some(msr.as_ref()), &cpu).unwrap();
    let monitoring = HwMonitoring::new(msr.clone(), cpu, policy);
    (msr, cap, monitoring)
}

fn core(id: u32) -> LogicalCoreId {
    LogicalCoreId::new(id)
}

#[test]
fn start_allocates_rmid_per_cluster() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    msr.set(core(0), PQR_ASSOC, 2 << 32);
    let mut group = MonGroup::new();

    monitoring
        .start(&cap, &[core(0), core(1), core(4)], MonEvent::L3_OCCUP, &mut group)
        .unwrap();

    assert!(group.is_valid());
    assert_eq!(monitoring.assoc_get(core(0)).unwrap(), 127);
    assert_eq!(monitoring.assoc_get(core(4)).unwrap(), 127);
    // the class of service is preserved
    assert_eq!(msr.get(core(0), PQR_ASSOC), (2 << 32) | 127);
    let Some(GroupState::Msr(state)) = &group.state else {
        panic!("expected an MSR group");
    };
    assert_eq!(state.contexts.len(), 2);

    let mut second = MonGroup::new();
    monitoring
        .start(&cap, &[core(2), core(5)], MonEvent::L3_OCCUP, &mut second)
        .unwrap();
    assert_eq!(monitoring.assoc_get(core(2)).unwrap(), 126);
    assert_eq!(monitoring.assoc_get(core(5)).unwrap(), 126);
}

#[test]
fn start_refuses_monitored_core() {
    let (_msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    let mut first = MonGroup::new();
    monitoring
        .start(&cap, &[core(0)], MonEvent::L3_OCCUP, &mut first)
        .unwrap();

    let mut second = MonGroup::new();
    let error = monitoring
        .start(&cap, &[core(1), core(0)], MonEvent::L3_OCCUP, &mut second)
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::Resource);
    assert!(!second.is_valid());
    assert_eq!(monitoring.assoc_get(core(1)).unwrap(), 0);
}

#[test]
fn start_needs_rdt_event() {
    let (_msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    let mut group = MonGroup::new();

    let error = monitoring
        .start(&cap, &[core(0)], MonEvent::IPC, &mut group)
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::Param);
}

#[test]
fn busy_perf_counters_with_fail_policy() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Fail);
    msr.set(core(0), PERF_GLOBAL_CTRL, GLOBAL_CTRL_IPC);
    let mut group = MonGroup::new();

    let error = monitoring
        .start(&cap, &[core(0)], MonEvent::L3_OCCUP | MonEvent::IPC, &mut group)
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::PerfCtr);
    assert_eq!(monitoring.assoc_get(core(0)).unwrap(), 0);
}

#[test]
fn busy_perf_counters_with_warn_policy() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    msr.set(core(0), PERF_GLOBAL_CTRL, GLOBAL_CTRL_IPC);
    let mut group = MonGroup::new();

    monitoring
        .start(&cap, &[core(0)], MonEvent::L3_OCCUP | MonEvent::IPC, &mut group)
        .unwrap();

    assert_eq!(msr.get(core(0), FIXED_CTR_CTRL), FIXED_CTR_CTRL_ENABLE);
    assert_eq!(msr.get(core(0), PERF_GLOBAL_CTRL), GLOBAL_CTRL_IPC);
}

#[test]
fn start_rolls_back_on_failure() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    msr.reject_writes(core(4), PQR_ASSOC);
    let mut group = MonGroup::new();

    let error = monitoring
        .start(&cap, &[core(0), core(4)], MonEvent::L3_OCCUP, &mut group)
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::Error);
    assert!(!group.is_valid());
    assert_eq!(msr.get(core(0), PQR_ASSOC), 0);
    assert_eq!(msr.writes_to(PQR_ASSOC), vec![(core(0), 127), (core(0), 0)]);
}

#[test]
fn rollback_continues_past_failed_counter_stop() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    msr.reject_writes(core(0), PERF_GLOBAL_CTRL);
    let mut group = MonGroup::new();

    let error = monitoring
        .start(
            &cap,
            &[core(0), core(1)],
            MonEvent::L3_OCCUP | MonEvent::IPC,
            &mut group,
        )
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::Error);
    assert!(!group.is_valid());
    assert_eq!(monitoring.assoc_get(core(0)).unwrap(), 0);
    assert_eq!(monitoring.assoc_get(core(1)).unwrap(), 0);
    // core 0 refuses the stop, core 1 is still stopped after it
    assert_eq!(msr.writes_to(FIXED_CTR_CTRL), vec![(core(1), 0)]);
}

#[test]
fn start_fails_when_rmids_run_out() {
    let (msr, _, monitoring) = setup(PerfCounterPolicy::Warn);
    let max_rmid = 4;
    let cap = Capabilities::new(vec![Capability::Mon(MonCap {
        max_rmid,
        l3_size: 1 << 20,
        events: vec![MonEventCap {
            event: MonEvent::L3_OCCUP,
            max_rmid,
            scale_factor: SCALE as u32,
            os_support: false,
        }],
    })]);

    // RMID 0 is never handed out, the first cluster has room for three groups
    let mut groups = Vec::new();
    for lcore in 0..max_rmid - 1 {
        let mut group = MonGroup::new();
        monitoring
            .start(&cap, &[core(lcore)], MonEvent::L3_OCCUP, &mut group)
            .unwrap();
        groups.push(group);
    }
    assert_eq!(monitoring.assoc_get(core(0)).unwrap(), 3);
    assert_eq!(monitoring.assoc_get(core(2)).unwrap(), 1);
    let assoc_writes = msr.writes_to(PQR_ASSOC);

    let mut group = MonGroup::new();
    let error = monitoring
        .start(&cap, &[core(3)], MonEvent::L3_OCCUP, &mut group)
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::Resource);
    assert!(!group.is_valid());
    assert_eq!(msr.writes_to(PQR_ASSOC), assoc_writes);
    assert_eq!(monitoring.assoc_get(core(3)).unwrap(), 0);

    // the other socket is a separate cluster with its own RMIDs
    monitoring
        .start(&cap, &[core(4)], MonEvent::L3_OCCUP, &mut group)
        .unwrap();
    assert_eq!(monitoring.assoc_get(core(4)).unwrap(), 3);
}

#[test]
fn poll_scales_and_tracks_deltas() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    let event = MonEvent::L3_OCCUP | MonEvent::LMEM_BW | MonEvent::TMEM_BW | MonEvent::RMEM_BW;
    let mut group = MonGroup::new();
    monitoring.start(&cap, &[core(0)], event, &mut group).unwrap();

    msr.push_qm_counter(127, EVENT_ID_L3_OCCUP as u32, 10);
    msr.push_qm_counter(127, EVENT_ID_LMEM as u32, 100);
    msr.push_qm_counter(127, EVENT_ID_LMEM as u32, 150);
    msr.push_qm_counter(127, EVENT_ID_TMEM as u32, 0xFF_FFF0);
    msr.push_qm_counter(127, EVENT_ID_TMEM as u32, 0x90);

    monitoring.poll(&cap, &mut group).unwrap();
    let values = *group.values();
    assert_eq!(values.llc, 10 * SCALE);
    assert_eq!(values.mbm_local, 100 * SCALE);
    assert_eq!(values.mbm_local_delta, 0);
    assert_eq!(values.mbm_total_delta, 0);
    assert_eq!(values.mbm_remote_delta, 0);

    monitoring.poll(&cap, &mut group).unwrap();
    let values = *group.values();
    assert_eq!(values.mbm_local_delta, 50 * SCALE);
    // the total counter wrapped around its 24 bits
    assert_eq!(values.mbm_total_delta, 0xA0 * SCALE);
    assert_eq!(values.mbm_remote_delta, 0x6E * SCALE);
}

#[test]
fn poll_sums_clusters() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    let mut group = MonGroup::new();
    monitoring
        .start(&cap, &[core(0), core(4)], MonEvent::L3_OCCUP, &mut group)
        .unwrap();
    // both clusters use RMID 127 and the fake shares counters by RMID
    msr.push_qm_counter(127, EVENT_ID_L3_OCCUP as u32, 3);

    monitoring.poll(&cap, &mut group).unwrap();

    assert_eq!(group.values().llc, 6 * SCALE);
}

#[test]
fn poll_fails_while_data_is_unavailable() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    let mut group = MonGroup::new();
    monitoring
        .start(&cap, &[core(0)], MonEvent::L3_OCCUP, &mut group)
        .unwrap();
    msr.push_qm_counter(127, EVENT_ID_L3_OCCUP as u32, QM_CTR_UNAVAILABLE);

    let error = monitoring.poll(&cap, &mut group).err().unwrap();

    assert_eq!(error.status(), Status::Error);
    assert!(group.is_valid());
}

#[test]
fn poll_computes_ipc() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    let mut group = MonGroup::new();
    monitoring
        .start(
            &cap,
            &[core(0), core(1)],
            MonEvent::L3_OCCUP | MonEvent::IPC | MonEvent::LLC_MISS,
            &mut group,
        )
        .unwrap();
    assert_eq!(
        msr.get(core(1), PERF_GLOBAL_CTRL),
        GLOBAL_CTRL_IPC | GLOBAL_CTRL_LLC_MISS
    );
    assert_eq!(msr.get(core(1), PERFEVTSEL0), LLC_MISS_EVTSEL);

    msr.set(core(0), INST_RETIRED_ANY, 100);
    msr.set(core(1), INST_RETIRED_ANY, 200);
    msr.set(core(0), CPU_UNHALTED_THREAD, 200);
    msr.set(core(1), CPU_UNHALTED_THREAD, 400);
    msr.set(core(0), PMC0, 7);
    monitoring.poll(&cap, &mut group).unwrap();

    let values = *group.values();
    assert_eq!(values.ipc_retired, 300);
    assert_eq!(values.ipc_unhalted, 600);
    assert_eq!(values.ipc, 0.5);
    assert_eq!(values.llc_misses, 7);

    msr.set(core(0), INST_RETIRED_ANY, 400);
    msr.set(core(0), CPU_UNHALTED_THREAD, 300);
    msr.set(core(1), PMC0, 3);
    monitoring.poll(&cap, &mut group).unwrap();

    let values = *group.values();
    assert_eq!(values.ipc_retired_delta, 300);
    assert_eq!(values.ipc_unhalted_delta, 100);
    assert_eq!(values.ipc, 3.0);
    assert_eq!(values.llc_misses_delta, 3);
}

#[test]
fn stop_releases_rmids() {
    let (msr, cap, monitoring) = setup(PerfCounterPolicy::Warn);
    let mut group = MonGroup::new();
    monitoring
        .start(&cap, &[core(0), core(4)], MonEvent::L3_OCCUP | MonEvent::IPC, &mut group)
        .unwrap();

    monitoring.stop(&mut group).unwrap();

    assert!(!group.is_valid());
    assert_eq!(monitoring.assoc_get(core(0)).unwrap(), 0);
    assert_eq!(monitoring.assoc_get(core(4)).unwrap(), 0);
    assert_eq!(msr.get(core(4), PERF_GLOBAL_CTRL), 0);
    assert_eq!(msr.get(core(4), FIXED_CTR_CTRL), 0);

    let error = monitoring.stop(&mut group).err().unwrap();
    assert_eq!(error.status(), Status::Param);
}

#[test]
fn reset_clears_every_core() {
    let (msr, _cap, monitoring) = setup(PerfCounterPolicy::Warn);
    msr.set(core(3), PQR_ASSOC, (1 << 32) | 17);
    msr.set(core(6), PQR_ASSOC, 5);

    monitoring.reset().unwrap();

    assert_eq!(msr.get(core(3), PQR_ASSOC), 1 << 32);
    assert_eq!(msr.get(core(6), PQR_ASSOC), 0);
}
