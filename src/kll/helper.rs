// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Level capacity schedule of the sketch.
//!
//! Capacities decay by roughly 2/3 from the top level down, with a floor of
//! [`MIN_LEVEL_LEN`]: the top (heaviest) level holds up to `k` items and a
//! level `d` steps below it holds `max(2, k * (2/3)^d)`. The schedule is a
//! constant of the sketch family; all cooperating instances must use the
//! same one or merged rank estimates are corrupted.

/// Smallest level capacity.
pub(crate) const MIN_LEVEL_LEN: u32 = 2;

const POWERS_OF_THREE: [u64; 31] = [
    1,
    3,
    9,
    27,
    81,
    243,
    729,
    2187,
    6561,
    19683,
    59049,
    177147,
    531441,
    1594323,
    4782969,
    14348907,
    43046721,
    129140163,
    387420489,
    1162261467,
    3486784401,
    10460353203,
    31381059609,
    94143178827,
    282429536481,
    847288609443,
    2541865828329,
    7625597484987,
    22876792454961,
    68630377364883,
    205891132094649,
];

/// Target capacity of the level at `height` in a sketch with `num_levels`
/// live levels and accuracy parameter `k`.
pub(crate) fn level_capacity(k: u32, num_levels: usize, height: usize) -> u32 {
    debug_assert!(height < num_levels);
    let depth = num_levels - height - 1;
    if depth > 60 {
        // k * (2/3)^61 is below the floor for any supported k.
        return MIN_LEVEL_LEN;
    }
    std::cmp::max(MIN_LEVEL_LEN, scaled_two_thirds_power(k, depth as u32))
}

/// Total target capacity of a sketch with `num_levels` live levels.
pub(crate) fn total_capacity(k: u32, num_levels: usize) -> usize {
    (0..num_levels)
        .map(|height| level_capacity(k, num_levels, height) as usize)
        .sum()
}

/// Total weight represented by levels of the given sizes, level 0 first.
pub(crate) fn weighted_item_count(level_sizes: impl IntoIterator<Item = usize>) -> u64 {
    let mut total = 0u64;
    let mut weight = 1u64;
    for size in level_sizes {
        total += weight.saturating_mul(size as u64);
        weight <<= 1;
    }
    total
}

/// Computes `round(k * (2/3)^depth)` in integer arithmetic.
fn scaled_two_thirds_power(k: u32, depth: u32) -> u32 {
    if depth <= 30 {
        return scaled_two_thirds_power_aux(k, depth);
    }
    let half = depth / 2;
    let rest = depth - half;
    let tmp = scaled_two_thirds_power_aux(k, half);
    scaled_two_thirds_power_aux(tmp, rest)
}

fn scaled_two_thirds_power_aux(k: u32, depth: u32) -> u32 {
    debug_assert!(depth <= 30);
    let two_k = (k as u64) << 1;
    let tmp = (two_k << depth) / POWERS_OF_THREE[depth as usize];
    let result = (tmp + 1) >> 1;
    debug_assert!(result <= k as u64);
    result as u32
}
