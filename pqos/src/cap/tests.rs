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
use pqos_test_utils::two_socket_cpuinfo;
use pqos_test_utils::FakeCpuId;
use pqos_test_utils::FakeMsr;
use pqos_test_utils::ProcTree;
use test_log::test;

use super::*;
use crate::hw::registers::L3_MASK_BASE;
use crate::hw::registers::L3_QOS_CFG;
use crate::types::CapabilityType;
use crate::types::MonEvent;
use crate::Status;

#[test]
fn discovers_rdt_server() {
    let cpu = two_socket_cpuinfo();
    let caps = discover(&FakeCpuId::rdt_server(), Some(&FakeMsr::new()), &cpu).unwrap();

    let mon = caps.mon().unwrap();
    assert_eq!(mon.max_rmid, 128);
    assert_eq!(mon.l3_size, cpu.l3().total_size);
    assert_eq!(
        caps.mon_events(),
        MonEvent::RDT | MonEvent::IPC | MonEvent::LLC_MISS
    );
    let occupancy = caps.get_event(MonEvent::L3_OCCUP).unwrap();
    assert_eq!(occupancy.max_rmid, 128);
    assert_eq!(occupancy.scale_factor, 65536);

    assert_eq!(
        *caps.l3ca().unwrap(),
        L3CaCap {
            num_classes: 4,
            num_ways: 16,
            way_size: 1024 * 1024,
            way_contention: 0xC000,
            cdp: true,
            cdp_on: false,
            os_support: false,
        }
    );
    assert_eq!(
        *caps.l2ca().unwrap(),
        L2CaCap {
            num_classes: 4,
            num_ways: 8,
            way_size: 64 * 1024,
            way_contention: 0,
            os_support: false,
        }
    );
    assert_eq!(
        *caps.mba().unwrap(),
        MbaCap {
            num_classes: 8,
            throttle_max: 90,
            throttle_step: 10,
            is_linear: true,
            os_support: false,
        }
    );
}

#[test]
fn cdp_on_halves_l3_classes() {
    let msr = FakeMsr::new();
    msr.set(LogicalCoreId::new(0), L3_QOS_CFG, 1);
    msr.set(LogicalCoreId::new(4), L3_QOS_CFG, 1);

    let caps = discover(&FakeCpuId::rdt_server(), Some(&msr), &two_socket_cpuinfo()).unwrap();

    let l3ca = caps.l3ca().unwrap();
    assert!(l3ca.cdp_on);
    assert_eq!(l3ca.num_classes, 2);
}

#[test]
fn cdp_on_one_socket_only_fails_discovery() {
    let msr = FakeMsr::new();
    msr.set(LogicalCoreId::new(4), L3_QOS_CFG, 1);

    let error = discover(&FakeCpuId::rdt_server(), Some(&msr), &two_socket_cpuinfo())
        .err()
        .unwrap();

    assert_eq!(error.status(), Status::Error);
}

#[test]
fn l3ca_from_brand_string() {
    let cpuid = FakeCpuId::rdt_server()
        .with_leaf(0x10, 0, [0, (1 << 2) | (1 << 3), 0, 0])
        .with_brand_string("Intel(R) Xeon(R) CPU E5-2658 v3 @ 2.20GHz");

    let caps = discover(&cpuid, None, &two_socket_cpuinfo()).unwrap();

    let l3ca = caps.l3ca().unwrap();
    assert_eq!(l3ca.num_classes, 4);
    assert_eq!(l3ca.num_ways, 16);
    assert!(!l3ca.cdp);
}

#[test]
fn l3ca_classes_probed_through_msrs() {
    let cpuid = FakeCpuId::rdt_server().with_leaf(0x10, 0, [0, 0, 0, 0]);
    let msr = FakeMsr::new();
    msr.fault_on(L3_MASK_BASE + 6);

    let caps = discover(&cpuid, Some(&msr), &two_socket_cpuinfo()).unwrap();
    assert_eq!(caps.l3ca().unwrap().num_classes, 6);
    assert!(caps.l2ca().is_none());
    assert!(caps.mba().is_none());

    // without register access there is nothing to probe
    let caps = discover(&cpuid, None, &two_socket_cpuinfo()).unwrap();
    assert!(caps.l3ca().is_none());
}

#[test]
fn non_linear_mba_is_left_out() {
    let cpuid = FakeCpuId::rdt_server().with_leaf(0x10, 3, [89, 0, 0, 7]);

    let caps = discover(&cpuid, None, &two_socket_cpuinfo()).unwrap();

    assert!(caps.mba().is_none());
    assert!(caps.l3ca().is_some());
}

#[test]
fn no_monitoring_without_pqm() {
    let cpuid = FakeCpuId::rdt_server().with_leaf(0x7, 0, [0, 1 << 15, 0, 0]);

    let caps = discover(&cpuid, None, &two_socket_cpuinfo()).unwrap();

    assert!(caps.mon().is_none());
    assert_eq!(caps.get_type(CapabilityType::Mon).err().unwrap().status(), Status::Resource);
    assert_eq!(caps.mon_events(), MonEvent::empty());
}

#[test]
fn get_event_takes_one_event() {
    let cpuid = FakeCpuId::rdt_server().without_leaf(0xA, 0);
    let caps = discover(&cpuid, None, &two_socket_cpuinfo()).unwrap();

    let combined = caps.get_event(MonEvent::L3_OCCUP | MonEvent::LMEM_BW);
    assert_eq!(combined.err().unwrap().status(), Status::Param);
    let absent = caps.get_event(MonEvent::IPC);
    assert_eq!(absent.err().unwrap().status(), Status::Resource);
    assert!(caps.get_type(CapabilityType::L2ca).is_ok());
}

#[test]
fn cdp_change_keeps_class_count_in_line() {
    let mut caps = discover(&FakeCpuId::rdt_server(), None, &two_socket_cpuinfo()).unwrap();

    caps.l3_cdp_change(true);
    assert_eq!(caps.l3ca().unwrap().num_classes, 2);
    caps.l3_cdp_change(true);
    assert_eq!(caps.l3ca().unwrap().num_classes, 2);
    caps.l3_cdp_change(false);
    assert_eq!(caps.l3ca().unwrap().num_classes, 4);
    assert!(!caps.l3ca().unwrap().cdp_on);
}

#[test]
fn detects_kernel_support() {
    let proc_root = tempfile::tempdir().unwrap();
    ProcTree::new()
        .with_cpu_flags(&["cqm_llc", "cat_l3", "mba"])
        .with_filesystems(&["proc", "resctrl"])
        .build(proc_root.path());

    let support = OsSupport::detect(proc_root.path());

    assert_eq!(
        support,
        OsSupport {
            cqm: true,
            cat_l3: true,
            cat_l2: false,
            mba: true,
            resctrl: true,
        }
    );
}

#[test]
fn missing_proc_means_no_support() {
    let proc_root = tempfile::tempdir().unwrap();
    assert_eq!(OsSupport::detect(proc_root.path()), OsSupport::default());
}

#[test]
fn os_support_needs_resctrl_and_perf_events() {
    let mut caps = discover(&FakeCpuId::rdt_server(), None, &two_socket_cpuinfo()).unwrap();
    let support = OsSupport {
        cqm: true,
        cat_l3: true,
        cat_l2: true,
        mba: false,
        resctrl: true,
    };

    apply_os_support(&mut caps, &support, MonEvent::L3_OCCUP);

    assert!(caps.l3ca().unwrap().os_support);
    assert!(caps.l2ca().unwrap().os_support);
    assert!(!caps.mba().unwrap().os_support);
    assert!(caps.get_event(MonEvent::L3_OCCUP).unwrap().os_support);
    assert!(!caps.get_event(MonEvent::LMEM_BW).unwrap().os_support);
    assert!(caps.get_event(MonEvent::IPC).unwrap().os_support);

    let no_resctrl = OsSupport {
        resctrl: false,
        ..support
    };
    apply_os_support(&mut caps, &no_resctrl, MonEvent::L3_OCCUP);
    assert!(!caps.l3ca().unwrap().os_support);
}
