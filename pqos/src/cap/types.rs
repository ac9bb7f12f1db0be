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

use crate::errors::PqosError;
use crate::types::CapabilityType;
use crate::types::MonEvent;
use crate::PqosResult;

/// One monitoring event the platform can count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MonEventCap {
    pub event: MonEvent,
    pub max_rmid: u32,
    /// Multiplier turning counter units into bytes.
    pub scale_factor: u32,
    pub os_support: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonCap {
    pub max_rmid: u32,
    pub l3_size: u32,
    pub events: Vec<MonEventCap>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct L3CaCap {
    /// Usable classes, already halved while CDP is on.
    pub num_classes: u32,
    pub num_ways: u32,
    pub way_size: u32,
    pub way_contention: u64,
    pub cdp: bool,
    pub cdp_on: bool,
    pub os_support: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct L2CaCap {
    pub num_classes: u32,
    pub num_ways: u32,
    pub way_size: u32,
    pub way_contention: u64,
    pub os_support: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MbaCap {
    pub num_classes: u32,
    pub throttle_max: u32,
    pub throttle_step: u32,
    pub is_linear: bool,
    pub os_support: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    Mon(MonCap),
    L3ca(L3CaCap),
    L2ca(L2CaCap),
    Mba(MbaCap),
}

impl Capability {
    pub fn cap_type(&self) -> CapabilityType {
        match self {
            Capability::Mon(_) => CapabilityType::Mon,
            Capability::L3ca(_) => CapabilityType::L3ca,
            Capability::L2ca(_) => CapabilityType::L2ca,
            Capability::Mba(_) => CapabilityType::Mba,
        }
    }
}

/// Everything the platform supports, built once at init.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    caps: Vec<Capability>,
}

impl Capabilities {
    pub fn new(caps: Vec<Capability>) -> Self {
        Self { caps }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> + '_ {
        self.caps.iter()
    }

    pub fn get_type(&self, cap_type: CapabilityType) -> PqosResult<&Capability> {
        self.caps
            .iter()
            .find(|cap| cap.cap_type() == cap_type)
            .ok_or_else(|| PqosError::resource(format!("{cap_type} is not supported")))
    }

    /// Looks up a single monitoring event, `event` must have exactly one bit set.
    pub fn get_event(&self, event: MonEvent) -> PqosResult<&MonEventCap> {
        if event.bits().count_ones() != 1 {
            return Err(PqosError::param(format!(
                "exactly one event expected, got {event:?}"
            )));
        }

        self.mon()
            .and_then(|mon| mon.events.iter().find(|cap| cap.event == event))
            .ok_or_else(|| PqosError::resource(format!("event {event:?} is not supported")))
    }

    pub fn mon(&self) -> Option<&MonCap> {
        self.caps.iter().find_map(|cap| match cap {
            Capability::Mon(mon) => Some(mon),
            _ => None,
        })
    }

    pub fn l3ca(&self) -> Option<&L3CaCap> {
        self.caps.iter().find_map(|cap| match cap {
            Capability::L3ca(l3ca) => Some(l3ca),
            _ => None,
        })
    }

    pub fn l2ca(&self) -> Option<&L2CaCap> {
        self.caps.iter().find_map(|cap| match cap {
            Capability::L2ca(l2ca) => Some(l2ca),
            _ => None,
        })
    }

    pub fn mba(&self) -> Option<&MbaCap> {
        self.caps.iter().find_map(|cap| match cap {
            Capability::Mba(mba) => Some(mba),
            _ => None,
        })
    }

    pub(crate) fn mon_mut(&mut self) -> Option<&mut MonCap> {
        self.caps.iter_mut().find_map(|cap| match cap {
            Capability::Mon(mon) => Some(mon),
            _ => None,
        })
    }

    pub(crate) fn l3ca_mut(&mut self) -> Option<&mut L3CaCap> {
        self.caps.iter_mut().find_map(|cap| match cap {
            Capability::L3ca(l3ca) => Some(l3ca),
            _ => None,
        })
    }

    pub(crate) fn l2ca_mut(&mut self) -> Option<&mut L2CaCap> {
        self.caps.iter_mut().find_map(|cap| match cap {
            Capability::L2ca(l2ca) => Some(l2ca),
            _ => None,
        })
    }

    pub(crate) fn mba_mut(&mut self) -> Option<&mut MbaCap> {
        self.caps.iter_mut().find_map(|cap| match cap {
            Capability::Mba(mba) => Some(mba),
            _ => None,
        })
    }

    /// All events present in the monitoring capability.
    pub fn mon_events(&self) -> MonEvent {
        self.mon()
            .map(|mon| {
                mon.events
                    .iter()
                    .fold(MonEvent::empty(), |all, cap| all | cap.event)
            })
            .unwrap_or(MonEvent::empty())
    }

    /// Keeps the L3 class count in line with the CDP state: turning CDP on
    /// halves the usable classes, turning it off doubles them.
    pub(crate) fn l3_cdp_change(&mut self, cdp_on: bool) {
        let Some(l3ca) = self.l3ca_mut() else {
            return;
        };

        match (l3ca.cdp_on, cdp_on) {
            (false, true) => {
                l3ca.num_classes /= 2;
                l3ca.cdp_on = true;
            }
            (true, false) => {
                l3ca.num_classes *= 2;
                l3ca.cdp_on = false;
            }
            _ => {}
        }
    }
}
