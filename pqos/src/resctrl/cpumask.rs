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

const CPUMASK_BYTES: usize = 512;
const LAST_BYTE: usize = CPUMASK_BYTES - 1;
const GROUP_BYTES: usize = 4;

/// Content of a resctrl `cpus` file: a big-endian bitmap printed as
/// comma separated groups of 8 hex digits, most significant group first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CpuMask {
    bytes: [u8; CPUMASK_BYTES],
}

impl Default for CpuMask {
    fn default() -> Self {
        Self {
            bytes: [0; CPUMASK_BYTES],
        }
    }
}

impl CpuMask {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn max_cores() -> u32 {
        (CPUMASK_BYTES * 8) as u32
    }

    fn position(lcore: u32) -> Option<(usize, u8)> {
        let item = (lcore / 8) as usize;
        if item > LAST_BYTE {
            return None;
        }
        Some((LAST_BYTE - item, 1 << (lcore % 8)))
    }

    /// Cores beyond the bitmap size are ignored.
    pub(crate) fn set(&mut self, lcore: u32) {
        if let Some((item, bit)) = Self::position(lcore) {
            self.bytes[item] |= bit;
        }
    }

    pub(crate) fn unset(&mut self, lcore: u32) {
        if let Some((item, bit)) = Self::position(lcore) {
            self.bytes[item] &= !bit;
        }
    }

    pub(crate) fn is_set(&self, lcore: u32) -> bool {
        Self::position(lcore).map_or(false, |(item, bit)| self.bytes[item] & bit != 0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.iter().all(|byte| *byte == 0)
    }

    pub(crate) fn cores(&self) -> impl Iterator<Item = u32> + '_ {
        (0..Self::max_cores()).filter(move |lcore| self.is_set(*lcore))
    }

    /// Accepts masks of any length, missing high groups are zero.
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let mut mask = Self::new();
        let digits = text
            .chars()
            .filter(|ch| *ch != ',' && !ch.is_whitespace())
            .collect::<Vec<_>>();

        for (position, digit) in digits.iter().rev().enumerate() {
            let nibble = digit.to_digit(16)? as u8;
            let byte_from_end = position / 2;
            if byte_from_end > LAST_BYTE {
                if nibble != 0 {
                    return None;
                }
                continue;
            }
            mask.bytes[LAST_BYTE - byte_from_end] |= nibble << (4 * (position % 2));
        }

        Some(mask)
    }
}

impl std::fmt::Display for CpuMask {
    /// Leading zero groups are skipped, the kernel rejects masks wider than
    /// its own cpumask.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups = self.bytes.chunks(GROUP_BYTES).collect::<Vec<_>>();
        let first = groups
            .iter()
            .position(|group| group.iter().any(|byte| *byte != 0))
            .unwrap_or(groups.len() - 1);

        for (index, group) in groups[first..].iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            for byte in group.iter() {
                write!(f, "{byte:02x}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
