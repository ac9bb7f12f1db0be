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

mod fake_cpuid;
mod fake_msr;
mod fs_tree;
mod topology;

pub use fake_cpuid::FakeCpuId;
pub use fake_msr::FakeMsr;
pub use fs_tree::write_file;
pub use fs_tree::PerfRdtTree;
pub use fs_tree::ProcTree;
pub use fs_tree::ResctrlTree;
pub use topology::two_socket_cpuinfo;
pub use topology::uniform_cpuinfo;
