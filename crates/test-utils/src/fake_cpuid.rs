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

use std::collections::HashMap;

use pqos_msr::CpuIdResult;
use pqos_msr::CpuIdSource;

const BRAND_STRING_LEAVES: [u32; 3] = [0x8000_0002, 0x8000_0003, 0x8000_0004];

/// CPUID answered from a leaf table; leaves not in the table read as zero.
#[derive(Clone, Debug, Default)]
pub struct FakeCpuId {
    leaves: HashMap<(u32, u32), [u32; 4]>,
}

impl FakeCpuId {
    pub fn new() -> Self {
        Self::default()
    }

    /// Xeon-like part with every RDT technology: 16-way L3 with CDP and 4 classes,
    /// 8-way L2 with 4 classes, linear MBA with 8 classes and 10% step, 128 RMIDs
    /// and the three L3 monitoring events, plus architectural perfmon v4.
    pub fn rdt_server() -> Self {
        Self::new()
            .with_leaf(0x0, 0, [0x14, 0x756e_6547, 0x6c65_746e, 0x4965_6e69])
            .with_leaf(0x7, 0, [0, (1 << 12) | (1 << 15), 0, 0])
            .with_leaf(0xA, 0, [0x0004_0804, 0, 0, 0x3])
            .with_leaf(0xF, 0, [0, 127, 0, 1 << 1])
            .with_leaf(0xF, 1, [0, 65536, 127, 0x7])
            .with_leaf(0x10, 0, [0, (1 << 1) | (1 << 2) | (1 << 3), 0, 0])
            .with_leaf(0x10, 1, [15, 0xC000, 1 << 2, 3])
            .with_leaf(0x10, 2, [7, 0, 0, 3])
            .with_leaf(0x10, 3, [89, 0, 1 << 2, 7])
            .with_brand_string("Intel(R) Xeon(R) Platinum 8180 CPU @ 2.50GHz")
    }

    pub fn with_leaf(mut self, leaf: u32, subleaf: u32, registers: [u32; 4]) -> Self {
        self.leaves.insert((leaf, subleaf), registers);
        self
    }

    pub fn without_leaf(mut self, leaf: u32, subleaf: u32) -> Self {
        self.leaves.remove(&(leaf, subleaf));
        self
    }

    /// Packs `brand` into leaves 0x80000002..0x80000004 the way the CPU reports it.
    pub fn with_brand_string(mut self, brand: &str) -> Self {
        let mut bytes = [0u8; 48];
        let len = brand.len().min(47);
        bytes[..len].copy_from_slice(&brand.as_bytes()[..len]);

        let mut words = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));

        for leaf in BRAND_STRING_LEAVES {
            let mut registers = [0u32; 4];
            for register in registers.iter_mut() {
                *register = words.next().unwrap_or(0);
            }
            self.leaves.insert((leaf, 0), registers);
        }
        self.leaves
            .insert((0x8000_0000, 0), [0x8000_0008, 0, 0, 0]);
        self
    }
}

impl CpuIdSource for FakeCpuId {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        let [eax, ebx, ecx, edx] = self
            .leaves
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default();

        CpuIdResult { eax, ebx, ecx, edx }
    }
}
