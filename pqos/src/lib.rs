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

#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(dead_code, unused_imports, unused_variables)]
#![deny(nonstandard_style, unused_mut, unused_unsafe, unreachable_patterns)]

//! Intel RDT: cache allocation, memory bandwidth allocation and their
//! monitoring counterparts, driven either directly through model specific
//! registers or through the kernel's resctrl and perf interfaces.

mod api;
mod backend;
mod cap;
mod errors;
mod hw;
mod lock;
mod mon_group;
mod os;
mod perf;
mod platform;
mod resctrl;
mod types;
mod utils;

#[cfg(test)]
mod test_support;

pub use api::Pqos;
pub use api::RDT_IFACE_ENV;
pub use cap::*;
pub use errors::PqosError;
pub use errors::Status;
pub use mon_group::MonGroup;
pub use mon_group::MonTarget;
pub use mon_group::MonValues;
pub use perf::PerfCounter;
pub use perf::PerfEventConfig;
pub use perf::PerfEventKind;
pub use perf::PerfEvents;
pub use perf::PerfTarget;
pub use perf::SyscallPerfEvents;
pub use platform::Platform;
pub use resctrl::ResctrlMount;
pub use resctrl::SysResctrlMount;
pub use types::*;
pub use utils::counter_delta;
pub use utils::get_delta;
pub use utils::is_contiguous;
pub use utils::MBM_COUNTER_WIDTH;

pub use pqos_config::Interface;
pub use pqos_config::PqosConfig;
pub use pqos_cpu_utils::CpuInfo;
pub use pqos_cpu_utils::LogicalCoreId;

pub type PqosResult<T> = Result<T, PqosError>;
