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
#![deny(
    dead_code,
    nonstandard_style,
    unused_imports,
    unused_mut,
    unused_variables,
    unused_unsafe,
    unreachable_patterns
)]

/// This crate is the hardware access substrate of the RDT library: reading and
/// writing model specific registers through the Linux msr driver and executing
/// CPUID. On anything but Linux x86_64 register access fails with
/// `MSRError::UnsupportedPlatform` and CPUID reports no features.

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[path = "linux_x86_64/mod.rs"]
mod msr_impl;
#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
#[path = "other/mod.rs"]
mod msr_impl;

mod cpuid;
mod errors;

pub use cpuid::processor_brand_string;
pub use cpuid::CpuIdSource;
pub use errors::MSRError;
pub use msr_impl::LinuxMsr;
pub use msr_impl::NativeCpuId;
pub use raw_cpuid::CpuIdResult;

use pqos_cpu_utils::LogicalCoreId;

pub type MSRResult<T> = Result<T, MSRError>;

pub trait MsrAccess: Send + Sync {
    /// Reads a 64 bit register on the given logical core.
    fn read(&self, core_id: LogicalCoreId, register_id: u32) -> MSRResult<u64>;

    /// Writes a 64 bit register on the given logical core.
    fn write(&self, core_id: LogicalCoreId, register_id: u32, value: u64) -> MSRResult<()>;
}
