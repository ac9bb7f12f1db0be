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

//! perf_event plumbing: the RDT pmu exported in sysfs and counters opened
//! through perf_event_open(2).

mod sysfs;

use std::fs::File;
use std::io::Read;
use std::os::fd::FromRawFd;
use std::os::fd::RawFd;

use nix::errno::Errno;

use pqos_cpu_utils::LogicalCoreId;

pub(crate) use sysfs::PerfRdt;

use crate::errors::PqosError;
use crate::types::Pid;
use crate::PqosResult;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;

/// What a counter counts. Remote bandwidth is derived from local and total.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PerfEventKind {
    LlcOccupancy,
    LocalBytes,
    TotalBytes,
    Instructions,
    Cycles,
    CacheMisses,
}

impl PerfEventKind {
    /// Generic hardware events every x86 pmu offers, RDT events excluded.
    pub(crate) fn hardware_config(self) -> Option<PerfEventConfig> {
        let config = match self {
            PerfEventKind::Instructions => PERF_COUNT_HW_INSTRUCTIONS,
            PerfEventKind::Cycles => PERF_COUNT_HW_CPU_CYCLES,
            PerfEventKind::CacheMisses => PERF_COUNT_HW_CACHE_MISSES,
            _ => return None,
        };
        Some(PerfEventConfig {
            perf_type: PERF_TYPE_HARDWARE,
            config,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PerfEventConfig {
    pub perf_type: u32,
    pub config: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PerfTarget {
    Core(LogicalCoreId),
    Task(Pid),
}

/// An open counter, closed on drop.
pub trait PerfCounter: Send {
    fn read(&mut self) -> PqosResult<u64>;
}

pub trait PerfEvents: Send + Sync {
    fn open(&self, event: PerfEventConfig, target: PerfTarget) -> PqosResult<Box<dyn PerfCounter>>;
}

/// perf_event_attr up to `config3`, 136 bytes.
#[repr(C)]
#[derive(Debug, Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
    aux_sample_size: u32,
    __reserved_3: u32,
    sig_data: u64,
    config3: u64,
}

/// Counters opened with the perf_event_open syscall, counting from the start.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyscallPerfEvents;

impl PerfEvents for SyscallPerfEvents {
    fn open(&self, event: PerfEventConfig, target: PerfTarget) -> PqosResult<Box<dyn PerfCounter>> {
        let mut attr = PerfEventAttr {
            type_: event.perf_type,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config: event.config,
            ..Default::default()
        };
        let (pid, cpu): (i32, i32) = match target {
            PerfTarget::Core(core_id) => (-1, core_id.get() as i32),
            PerfTarget::Task(tid) => (tid as i32, -1),
        };

        // SAFETY: attr is a valid perf_event_attr for the duration of the call.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &mut attr as *mut PerfEventAttr,
                pid,
                cpu,
                -1i32,
                0u64,
            )
        } as RawFd;
        if fd < 0 {
            let errno = Errno::last();
            tracing::debug!("perf_event_open({event:?}, {target:?}) failed: {errno}");
            return Err(PqosError::sys("perf_event_open", errno));
        }

        tracing::debug!("opened perf counter {event:?} on {target:?}");
        // SAFETY: fd was just returned by the kernel and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Box::new(FdCounter { file }))
    }
}

struct FdCounter {
    file: File,
}

impl PerfCounter for FdCounter {
    fn read(&mut self) -> PqosResult<u64> {
        let mut value = [0u8; 8];
        self.file
            .read_exact(&mut value)
            .map_err(|error| PqosError::io("reading perf counter", "perf_event", error))?;
        Ok(u64::from_ne_bytes(value))
    }
}
