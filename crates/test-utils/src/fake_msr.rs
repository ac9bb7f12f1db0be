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
use std::collections::HashSet;
use std::collections::VecDeque;
use std::ops::RangeInclusive;

use nix::errno::Errno;
use parking_lot::Mutex;

use pqos_cpu_utils::LogicalCoreId;
use pqos_msr::MSRError;
use pqos_msr::MSRResult;
use pqos_msr::MsrAccess;

const QM_EVTSEL: u32 = 0xC8D;
const QM_CTR: u32 = 0xC8E;

/// In-memory register file keyed by `(core, register)`.
///
/// `QM_CTR` reads are answered from a per `(rmid, event)` queue selected by the
/// last `QM_EVTSEL` write on the same core. Every read pops the queue until one
/// value remains, which then sticks.
#[derive(Default)]
pub struct FakeMsr {
    state: Mutex<FakeMsrState>,
}

#[derive(Default)]
struct FakeMsrState {
    registers: HashMap<(LogicalCoreId, u32), u64>,
    qm_counters: HashMap<(u32, u32), VecDeque<u64>>,
    faulting: HashSet<u32>,
    rejected_writes: HashSet<(LogicalCoreId, u32)>,
    min_mask_bits: Vec<(RangeInclusive<u32>, u32)>,
    write_masks: Vec<(RangeInclusive<u32>, u64)>,
    writes: Vec<(LogicalCoreId, u32, u64)>,
    fail_writes_after: Option<usize>,
}

impl FakeMsr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, core_id: LogicalCoreId, register_id: u32, value: u64) {
        self.state
            .lock()
            .registers
            .insert((core_id, register_id), value);
    }

    pub fn get(&self, core_id: LogicalCoreId, register_id: u32) -> u64 {
        self.state
            .lock()
            .registers
            .get(&(core_id, register_id))
            .copied()
            .unwrap_or(0)
    }

    /// Any access to this register fails on every core, like a non existing MSR.
    pub fn fault_on(&self, register_id: u32) {
        self.state.lock().faulting.insert(register_id);
    }

    /// Writes of this register on this core fail, reads still work.
    pub fn reject_writes(&self, core_id: LogicalCoreId, register_id: u32) {
        self.state
            .lock()
            .rejected_writes
            .insert((core_id, register_id));
    }

    /// Writes into `registers` with fewer than `bits` set bits fail.
    pub fn require_min_mask_bits(&self, registers: RangeInclusive<u32>, bits: u32) {
        self.state.lock().min_mask_bits.push((registers, bits));
    }

    /// Writes into `registers` keep only the bits of `mask`, the rest is silently dropped.
    pub fn mask_writes(&self, registers: RangeInclusive<u32>, mask: u64) {
        self.state.lock().write_masks.push((registers, mask));
    }

    /// All writes after the first `count` ones (counted from now) fail.
    pub fn fail_writes_after(&self, count: usize) {
        let mut state = self.state.lock();
        let already = state.writes.len();
        state.fail_writes_after = Some(already + count);
    }

    pub fn push_qm_counter(&self, rmid: u32, event_id: u32, value: u64) {
        self.state
            .lock()
            .qm_counters
            .entry((rmid, event_id))
            .or_default()
            .push_back(value);
    }

    pub fn writes(&self) -> Vec<(LogicalCoreId, u32, u64)> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to(&self, register_id: u32) -> Vec<(LogicalCoreId, u64)> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(_, register, _)| *register == register_id)
            .map(|(core, _, value)| (*core, *value))
            .collect()
    }
}

impl MsrAccess for FakeMsr {
    fn read(&self, core_id: LogicalCoreId, register_id: u32) -> MSRResult<u64> {
        let mut state = self.state.lock();
        if state.faulting.contains(&register_id) {
            return Err(MSRError::read_w_no_err(register_id, core_id, Errno::EIO));
        }

        if register_id == QM_CTR {
            let evtsel = state
                .registers
                .get(&(core_id, QM_EVTSEL))
                .copied()
                .unwrap_or(0);
            let key = (((evtsel >> 32) & 0x3ff) as u32, (evtsel & 0xff) as u32);
            let value = match state.qm_counters.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(0),
                Some(queue) => queue.front().copied().unwrap_or(0),
                None => 0,
            };
            return Ok(value);
        }

        Ok(state
            .registers
            .get(&(core_id, register_id))
            .copied()
            .unwrap_or(0))
    }

    fn write(&self, core_id: LogicalCoreId, register_id: u32, value: u64) -> MSRResult<()> {
        let mut state = self.state.lock();
        let rejected = state.faulting.contains(&register_id)
            || state.rejected_writes.contains(&(core_id, register_id))
            || state.fail_writes_after.map_or(false, |limit| state.writes.len() >= limit)
            || state.min_mask_bits.iter().any(|(registers, bits)| {
                registers.contains(&register_id) && value.count_ones() < *bits
            });
        if rejected {
            return Err(MSRError::write_w_no_err(
                value,
                register_id,
                core_id,
                Errno::EIO,
            ));
        }

        let value = state
            .write_masks
            .iter()
            .filter(|(registers, _)| registers.contains(&register_id))
            .fold(value, |value, (_, mask)| value & mask);

        state.writes.push((core_id, register_id, value));
        state.registers.insert((core_id, register_id), value);
        Ok(())
    }
}
