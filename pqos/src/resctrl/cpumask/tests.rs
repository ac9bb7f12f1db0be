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

use super::CpuMask;

#[test]
fn core_bits_land_at_the_end() {
    let mut mask = CpuMask::new();
    mask.set(0);
    mask.set(9);

    assert_eq!(mask.to_string(), "00000201");
    assert!(mask.is_set(9));
    assert!(!mask.is_set(8));
}

#[test]
fn high_cores_add_groups() {
    let mut mask = CpuMask::new();
    mask.set(1);
    mask.set(35);

    assert_eq!(mask.to_string(), "00000008,00000002");
    assert_eq!(mask.cores().collect::<Vec<_>>(), vec![1, 35]);
}

#[test]
fn empty_mask_prints_one_group() {
    let mask = CpuMask::new();
    assert!(mask.is_empty());
    assert_eq!(mask.to_string(), "00000000");
}

#[test]
fn parses_kernel_output() {
    let mask = CpuMask::parse("ff\n").unwrap();
    assert_eq!(mask.cores().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());

    let mask = CpuMask::parse("00000001,00000000,0000000f").unwrap();
    assert_eq!(mask.cores().collect::<Vec<_>>(), vec![0, 1, 2, 3, 64]);

    assert!(CpuMask::parse("0").unwrap().is_empty());
    assert!(CpuMask::parse("xyz").is_none());
}

#[test]
fn unset_clears_only_one_core() {
    let mut mask = CpuMask::parse("f").unwrap();
    mask.unset(2);
    assert_eq!(mask.cores().collect::<Vec<_>>(), vec![0, 1, 3]);
}

#[test]
fn printed_mask_parses_back() {
    let mut mask = CpuMask::new();
    for lcore in [0, 31, 32, 100, 4095] {
        mask.set(lcore);
    }
    assert_eq!(CpuMask::parse(&mask.to_string()), Some(mask));
}
