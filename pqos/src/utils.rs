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

/// Width of the MBM hardware counters.
pub const MBM_COUNTER_WIDTH: u32 = 24;

/// True when the set bits of `mask` form one unbroken run, false for 0.
pub fn is_contiguous(mask: u64) -> bool {
    if mask == 0 {
        return false;
    }
    let shifted = mask >> mask.trailing_zeros();
    shifted & shifted.wrapping_add(1) == 0
}

/// Difference between two readings of a free running counter `width` bits wide,
/// i.e. `(2^width - old) + new` when the counter wrapped.
pub fn counter_delta(old: u64, new: u64, width: u32) -> u64 {
    let delta = new.wrapping_sub(old);
    if width >= 64 {
        delta
    } else {
        delta & ((1u64 << width) - 1)
    }
}

/// Delta between two MBM counter readings.
pub fn get_delta(old: u64, new: u64) -> u64 {
    counter_delta(old, new, MBM_COUNTER_WIDTH)
}

/// Mask with the `ways` lowest bits set.
pub(crate) fn ways_mask(ways: u32) -> u64 {
    if ways >= 64 {
        u64::MAX
    } else {
        (1u64 << ways) - 1
    }
}
