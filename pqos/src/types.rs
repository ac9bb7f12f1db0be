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

use bitflags::bitflags;

pub type ClassId = u32;
pub type Rmid = u32;
pub type Pid = u32;

/// Cache ways granted to a class, split into code and data halves when CDP is on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum L3Mask {
    Ways(u64),
    Cdp { code: u64, data: u64 },
}

impl L3Mask {
    pub fn is_cdp(&self) -> bool {
        matches!(self, L3Mask::Cdp { .. })
    }

    pub(crate) fn masks(&self) -> impl Iterator<Item = u64> {
        let (first, second) = match *self {
            L3Mask::Ways(ways) => (ways, None),
            L3Mask::Cdp { code, data } => (code, Some(data)),
        };
        std::iter::once(first).chain(second)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct L3Ca {
    pub class_id: ClassId,
    pub mask: L3Mask,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct L2Ca {
    pub class_id: ClassId,
    pub ways_mask: u64,
}

/// Memory bandwidth available to a class, in percent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mba {
    pub class_id: ClassId,
    pub mb_rate: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CdpConfig {
    Off,
    On,
    /// Keep the current setting.
    #[default]
    Any,
}

bitflags! {
    /// Allocation technologies a class is assigned for.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Technology: u32 {
        const L3CA = 1 << 0;
        const L2CA = 1 << 1;
        const MBA = 1 << 2;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct MonEvent: u32 {
        const L3_OCCUP = 0x1;
        const LMEM_BW = 0x2;
        const TMEM_BW = 0x4;
        const RMEM_BW = 0x8;
        const LLC_MISS = 0x4000;
        const IPC = 0x8000;
    }
}

impl MonEvent {
    /// Events counted by the RDT hardware against an RMID.
    pub const RDT: MonEvent = MonEvent::L3_OCCUP
        .union(MonEvent::LMEM_BW)
        .union(MonEvent::TMEM_BW)
        .union(MonEvent::RMEM_BW);

    /// Events counted by the core performance monitoring unit.
    pub const PERF: MonEvent = MonEvent::LLC_MISS.union(MonEvent::IPC);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CapabilityType {
    Mon,
    L3ca,
    L2ca,
    Mba,
}

impl std::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CapabilityType::Mon => "monitoring",
            CapabilityType::L3ca => "L3 CAT",
            CapabilityType::L2ca => "L2 CAT",
            CapabilityType::Mba => "MBA",
        };
        write!(f, "{name}")
    }
}
