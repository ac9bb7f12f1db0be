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

use std::collections::BTreeSet;
use std::sync::Arc;

use maplit::btreeset;
use pqos_test_utils::FakeMsr;
use pqos_test_utils::ProcTree;
use tempfile::TempDir;
use test_log::test;

use super::*;
use crate::test_support::build_os_support;
use crate::test_support::fake_platform;
use crate::test_support::server_resctrl_tree;
use crate::test_support::test_config;
use crate::test_support::FakeMount;
use crate::test_support::FakePerfEvents;
use crate::test_support::LLC_OCCUPANCY_CONFIG;
use crate::test_support::RDT_PERF_TYPE;
use crate::Status;

struct Setup {
    _dir: TempDir,
    config: PqosConfig,
    msr: Arc<FakeMsr>,
    mount: Arc<FakeMount>,
    perf: FakePerfEvents,
}

impl Setup {
    fn new(interface: Interface) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), interface);
        let mount = Arc::new(FakeMount::new(server_resctrl_tree(&config.paths.resctrl)));
        Self {
            _dir: dir,
            config,
            msr: Arc::new(FakeMsr::new()),
            mount,
            perf: FakePerfEvents::new(),
        }
    }

    fn with_os_support(self) -> Self {
        build_os_support(&self.config);
        self
    }

    fn init(&self) -> PqosResult<Pqos> {
        let platform = fake_platform(self.msr.clone(), self.mount.clone(), self.perf.clone());
        Pqos::with_platform(&self.config, platform)
    }
}

fn core(id: u32) -> LogicalCoreId {
    LogicalCoreId::new(id)
}

fn status<T>(result: PqosResult<T>) -> Status {
    result.err().unwrap().status()
}

#[test]
fn iface_env_has_to_agree() {
    assert_eq!(check_iface_env(Interface::Msr, None).unwrap(), Interface::Msr);
    assert_eq!(
        check_iface_env(Interface::Os, Some("os".to_string())).unwrap(),
        Interface::Os
    );
    assert_eq!(
        status(check_iface_env(Interface::Msr, Some("OS".to_string()))),
        Status::Init
    );
    assert_eq!(
        status(check_iface_env(Interface::Msr, Some("resctrl".to_string()))),
        Status::Init
    );
}

#[test]
fn init_creates_lock_file() {
    let setup = Setup::new(Interface::Msr);

    let pqos = setup.init().unwrap();

    assert!(setup.config.lock_file.exists());
    assert_eq!(pqos.interface(), Interface::Msr);
    assert_eq!(pqos.cpuinfo().unwrap().cores().len(), 8);
    let cap = pqos.cap_get().unwrap();
    assert_eq!(cap.l3ca().unwrap().num_classes, 4);
    assert!(!cap.l3ca().unwrap().os_support);
}

#[test]
fn fini_ends_the_session() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();

    pqos.fini().unwrap();

    assert_eq!(status(pqos.l3ca_get(0)), Status::Init);
    assert_eq!(status(pqos.cap_get()), Status::Init);
    assert_eq!(status(pqos.fini()), Status::Init);
}

#[test]
fn assign_exhausts_free_classes() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    let cores = [core(1), core(2)];

    assert_eq!(pqos.alloc_assign(Technology::L3CA, &cores).unwrap(), 3);
    assert_eq!(pqos.alloc_assign(Technology::L3CA, &[core(3)]).unwrap(), 2);
    assert_eq!(pqos.alloc_assign(Technology::L3CA, &[core(0)]).unwrap(), 1);
    assert_eq!(
        status(pqos.alloc_assign(Technology::L3CA, &[core(0)])),
        Status::Resource
    );

    assert_eq!(pqos.alloc_assoc_get(core(2)).unwrap(), 3);
    pqos.alloc_release(&cores).unwrap();
    assert_eq!(pqos.alloc_assoc_get(core(2)).unwrap(), 0);
}

#[test]
fn assign_checks_arguments() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();

    assert_eq!(
        status(pqos.alloc_assign(Technology::empty(), &[core(0)])),
        Status::Param
    );
    assert_eq!(status(pqos.alloc_assign(Technology::L3CA, &[])), Status::Param);
    assert_eq!(
        status(pqos.alloc_assign(Technology::L3CA, &[core(0), core(4)])),
        Status::Param
    );
    assert_eq!(status(pqos.alloc_release(&[])), Status::Param);
}

#[test]
fn concurrent_assign_hands_out_distinct_classes() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();

    let results = std::thread::scope(|scope| {
        let handles = (0..4)
            .map(|lcore| {
                let pqos = &pqos;
                scope.spawn(move || pqos.alloc_assign(Technology::L3CA, &[core(lcore)]))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    let assigned = results
        .iter()
        .filter_map(|result| result.as_ref().ok().copied())
        .collect::<BTreeSet<_>>();
    assert_eq!(assigned, btreeset! {1, 2, 3});
    let exhausted = results
        .iter()
        .filter(|result| matches!(result, Err(PqosError::Resource(_))))
        .count();
    assert_eq!(exhausted, 1);
}

#[test]
fn l3ca_set_validates_masks() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    let ways = |class_id, mask| L3Ca {
        class_id,
        mask: L3Mask::Ways(mask),
    };

    assert_eq!(status(pqos.l3ca_set(0, &[])), Status::Param);
    assert_eq!(status(pqos.l3ca_set(0, &[ways(1, 0b101)])), Status::Param);
    assert_eq!(status(pqos.l3ca_set(0, &[ways(1, 0x1_ffff)])), Status::Param);
    assert_eq!(status(pqos.l3ca_set(0, &[ways(4, 0xf)])), Status::Param);
    assert_eq!(status(pqos.l3ca_set(9, &[ways(1, 0xf)])), Status::Param);

    pqos.l3ca_set(0, &[ways(1, 0xf)]).unwrap();
    assert_eq!(pqos.l3ca_get(0).unwrap()[1], ways(1, 0xf));
    assert_eq!(setup.msr.get(core(0), 0xC91), 0xf);
}

#[test]
fn l2ca_set_validates_masks() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    let ca = |class_id, ways_mask| L2Ca {
        class_id,
        ways_mask,
    };

    assert_eq!(status(pqos.l2ca_set(0, &[ca(1, 0b1001)])), Status::Param);
    assert_eq!(status(pqos.l2ca_set(0, &[ca(1, 0x100)])), Status::Param);

    pqos.l2ca_set(2, &[ca(3, 0xf0)]).unwrap();
    assert_eq!(pqos.l2ca_get(2).unwrap()[3], ca(3, 0xf0));
}

#[test]
fn mba_set_validates_rates() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    let mba = |class_id, mb_rate| Mba { class_id, mb_rate };

    assert_eq!(status(pqos.mba_set(0, &[mba(1, 0)])), Status::Param);
    assert_eq!(status(pqos.mba_set(0, &[mba(1, 101)])), Status::Param);
    assert_eq!(status(pqos.mba_set(0, &[mba(8, 50)])), Status::Param);

    assert_eq!(pqos.mba_set(1, &[mba(2, 35)]).unwrap(), vec![mba(2, 40)]);
    assert_eq!(pqos.mba_get(1).unwrap()[2], mba(2, 40));
}

#[test]
fn assoc_set_is_idempotent() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();

    pqos.alloc_assoc_set(core(6), 2).unwrap();
    let writes = setup.msr.writes().len();
    pqos.alloc_assoc_set(core(6), 2).unwrap();

    assert_eq!(pqos.alloc_assoc_get(core(6)).unwrap(), 2);
    assert_eq!(setup.msr.writes().len(), writes + 1);
    assert_eq!(setup.msr.get(core(6), 0xC8F), 2 << 32);
}

#[test]
fn reset_restores_defaults() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    pqos.alloc_assign(Technology::L3CA | Technology::MBA, &[core(4)])
        .unwrap();
    pqos.mba_set(1, &[Mba {
        class_id: 3,
        mb_rate: 20,
    }])
    .unwrap();

    pqos.alloc_reset(CdpConfig::On).unwrap();

    assert_eq!(pqos.alloc_assoc_get(core(4)).unwrap(), 0);
    assert!(pqos.mba_get(1).unwrap().iter().all(|mba| mba.mb_rate == 100));
    let cap = pqos.cap_get().unwrap();
    assert!(cap.l3ca().unwrap().cdp_on);
    assert_eq!(cap.l3ca().unwrap().num_classes, 2);
    assert!(pqos
        .l3ca_get(1)
        .unwrap()
        .iter()
        .all(|ca| ca.mask == L3Mask::Cdp { code: 0xffff, data: 0xffff }));
}

#[test]
fn tasks_need_the_os_interface() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    let mut group = MonGroup::new();

    assert_eq!(status(pqos.alloc_assoc_set_pid(1234, 1)), Status::Resource);
    assert_eq!(
        status(pqos.alloc_assign_pid(Technology::L3CA, &[1234])),
        Status::Resource
    );
    assert_eq!(
        status(pqos.mon_start_pid(1234, MonEvent::L3_OCCUP, &mut group)),
        Status::Resource
    );
}

#[test]
fn monitoring_lifecycle() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    let mut group = MonGroup::new();
    setup.msr.push_qm_counter(127, 1, 4);

    pqos.mon_start(&[core(0), core(1)], MonEvent::L3_OCCUP, &mut group)
        .unwrap();
    assert_eq!(pqos.mon_assoc_get(core(1)).unwrap(), 127);
    assert_eq!(
        status(pqos.mon_start(&[core(2)], MonEvent::L3_OCCUP, &mut group)),
        Status::Param
    );

    pqos.mon_poll(&mut [&mut group]).unwrap();
    assert_eq!(group.values().llc, 4 * 65536);

    pqos.mon_stop(&mut group).unwrap();
    assert_eq!(pqos.mon_assoc_get(core(1)).unwrap(), 0);
    assert_eq!(status(pqos.mon_stop(&mut group)), Status::Param);
    assert_eq!(status(pqos.mon_poll(&mut [&mut group])), Status::Param);
    assert_eq!(status(pqos.mon_poll(&mut [])), Status::Param);
}

#[test]
fn mon_start_validates_events() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    let mut group = MonGroup::new();

    assert_eq!(
        status(pqos.mon_start(&[core(0)], MonEvent::IPC, &mut group)),
        Status::Param
    );
    let unknown = MonEvent::from_bits_retain(0x100) | MonEvent::L3_OCCUP;
    assert_eq!(
        status(pqos.mon_start(&[core(0)], unknown, &mut group)),
        Status::Param
    );
    assert_eq!(
        status(pqos.mon_start(&[], MonEvent::L3_OCCUP, &mut group)),
        Status::Param
    );
    assert!(!group.is_valid());
}

#[test]
fn mon_reset_clears_rmids() {
    let setup = Setup::new(Interface::Msr);
    let pqos = setup.init().unwrap();
    setup.msr.set(core(7), 0xC8F, 33);

    pqos.mon_reset().unwrap();

    assert_eq!(pqos.mon_assoc_get(core(7)).unwrap(), 0);
}

#[test]
fn os_interface_without_resctrl() {
    let setup = Setup::new(Interface::Os);
    ProcTree::new()
        .with_cpu_flags(&["cat_l3"])
        .with_filesystems(&["sysfs"])
        .build(&setup.config.paths.proc);

    assert_eq!(status(setup.init()), Status::Transport);
}

#[test]
fn os_interface_end_to_end() {
    let setup = Setup::new(Interface::Os).with_os_support();

    let pqos = setup.init().unwrap();
    assert_eq!(setup.mount.mounts(), vec![false]);
    let cap = pqos.cap_get().unwrap();
    assert!(cap.l3ca().unwrap().os_support);
    assert!(cap.get_event(MonEvent::LMEM_BW).unwrap().os_support);

    let class_id = pqos.alloc_assign_pid(Technology::L3CA, &[1234]).unwrap();
    assert_eq!(class_id, 3);
    assert_eq!(pqos.alloc_assoc_get_pid(1234).unwrap(), 3);
    assert_eq!(pqos.alloc_assign(Technology::L3CA, &[core(0)]).unwrap(), 2);
    assert_eq!(status(pqos.mon_assoc_get(core(0))), Status::Resource);
    pqos.mon_reset().unwrap();

    let mut group = MonGroup::new();
    pqos.mon_start_pid(1234, MonEvent::L3_OCCUP, &mut group)
        .unwrap();
    setup.perf.set_value(RDT_PERF_TYPE, LLC_OCCUPANCY_CONFIG, 10);
    pqos.mon_poll(&mut [&mut group]).unwrap();
    assert_eq!(group.values().llc, 20);
    assert_eq!(setup.perf.open_now(), 2);

    pqos.mon_stop(&mut group).unwrap();
    assert_eq!(setup.perf.open_now(), 0);

    pqos.alloc_reset(CdpConfig::Any).unwrap();
    assert_eq!(setup.mount.mounts(), vec![false, false]);
}
