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

use raw_cpuid::CpuId;
use raw_cpuid::CpuIdReader;
use raw_cpuid::CpuIdResult;

/// Executes the CPUID instruction for a leaf/subleaf pair.
pub trait CpuIdSource: Send + Sync {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult;
}

#[derive(Clone)]
struct SourceReader<'source>(&'source dyn CpuIdSource);

impl CpuIdReader for SourceReader<'_> {
    fn cpuid2(&self, eax: u32, ecx: u32) -> CpuIdResult {
        self.0.cpuid(eax, ecx)
    }
}

/// Decodes leaves 0x80000002..0x80000004 of the given source.
pub fn processor_brand_string(source: &dyn CpuIdSource) -> Option<String> {
    CpuId::with_cpuid_reader(SourceReader(source))
        .get_processor_brand_string()
        .map(|brand| brand.as_str().trim().to_string())
}
