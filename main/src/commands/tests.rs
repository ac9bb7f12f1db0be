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

use test_log::test;

use pqos::L3CaCap;
use pqos::MbaCap;
use pqos::MonCap;
use pqos::MonEventCap;

use super::*;

#[test]
fn class_lines() {
    let ways = L3Ca {
        class_id: 1,
        mask: L3Mask::Ways(0xff),
    };
    let cdp = L3Ca {
        class_id: 2,
        mask: L3Mask::Cdp {
            code: 0xf,
            data: 0xf0,
        },
    };
    assert_eq!(format_l3ca(&ways), "L3 class 1 => 0xff");
    assert_eq!(format_l3ca(&cdp), "L3 class 2 => code 0xf data 0xf0");
    assert_eq!(
        format_mba(&Mba {
            class_id: 3,
            mb_rate: 40
        }),
        "MBA class 3 => 40%"
    );
    assert_eq!(
        format_cores(&[LogicalCoreId::new(0), LogicalCoreId::new(5)]),
        "cores 0,5"
    );
}

#[test]
fn caps_summary() {
    let event = |event| MonEventCap {
        event,
        max_rmid: 128,
        scale_factor: 65536,
        os_support: false,
    };
    let caps = Capabilities::new(vec![
        Capability::Mon(MonCap {
            max_rmid: 128,
            l3_size: 1 << 20,
            events: vec![event(MonEvent::L3_OCCUP), event(MonEvent::IPC)],
        }),
        Capability::L3ca(L3CaCap {
            num_classes: 8,
            num_ways: 16,
            way_size: 65536,
            way_contention: 0,
            cdp: true,
            cdp_on: false,
            os_support: false,
        }),
        Capability::Mba(MbaCap {
            num_classes: 8,
            throttle_max: 90,
            throttle_step: 10,
            is_linear: true,
            os_support: false,
        }),
    ]);

    let expected = "monitoring: 128 RMIDs, events llc,ipc\n\
                    L3 CAT: 8 classes, 16 ways of 65536 bytes, CDP off\n\
                    MBA: 8 classes, max 90%, step 10%\n";
    assert_eq!(format_caps(&caps), expected);
}

#[test]
fn monitoring_table() {
    let events = MonEvent::L3_OCCUP | MonEvent::TMEM_BW | MonEvent::IPC;
    assert_eq!(format_header(events), "TARGET\tIPC\tLLC[KB]\tMBT[MB]");

    let values = MonValues {
        llc: 2048,
        mbm_total_delta: 3 * 1024 * 1024,
        ipc: 1.256,
        ..MonValues::default()
    };
    assert_eq!(
        format_row("cores 0,1", events, &values),
        "cores 0,1\t1.26\t2.0\t3.0"
    );
}
