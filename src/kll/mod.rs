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

//! Implementation of the KLL quantile sketch (Karnin, Lang, Liberty):
//! <https://arxiv.org/abs/1603.05346>.
//!
//! The sketch keeps items in geometrically capped *levels*; an item at level
//! `i` represents `2^i` inserted values. When a level overflows, its sorted
//! contents are paired up and a uniformly chosen half is promoted to the
//! next level, doubling each survivor's implicit weight. Retained space is
//! O(k·log(n/k)) for an accuracy parameter `k`, and a normalized rank query
//! is accurate within [`normalized_rank_error`] with high probability.
//!
//! [`KllSketch`] supports single and repeated-value insertion, merging of
//! other sketches or of borrowed [`KllView`]s, and quantile estimation after
//! [`KllSketch::finish`]. Construction takes an explicit PRNG seed so that
//! the compaction coin flips, and therefore the estimates, can be made
//! reproducible.

mod helper;
mod sketch;
mod view;

pub use sketch::{KllSketch, SketchItem};
pub use view::KllView;

/// Default value of the accuracy parameter `k`.
///
/// Yields a normalized rank error of about 1.33%.
pub const DEFAULT_K: u32 = 200;

/// Smallest supported value of `k`.
pub const MIN_K: u32 = 8;

/// Largest supported value of `k`.
pub const MAX_K: u32 = 65535;

// Constants of the published single-rank error bound for the KLL family:
// epsilon(k) = 2.296 / k^0.9723.
const RANK_ERROR_COEFFICIENT: f64 = 2.296;
const RANK_ERROR_EXPONENT: f64 = 0.9723;

/// Returns the value of `k` needed to achieve a normalized rank error of
/// `epsilon`, clamped to `[MIN_K, MAX_K]`.
///
/// Monotone decreasing in `epsilon`: a tighter error bound needs a larger
/// sketch.
pub fn k_from_epsilon(epsilon: f64) -> u32 {
    debug_assert!(epsilon > 0.0);
    let k = (RANK_ERROR_COEFFICIENT / epsilon)
        .powf(1.0 / RANK_ERROR_EXPONENT)
        .ceil();
    (k as u32).clamp(MIN_K, MAX_K)
}

/// Returns the normalized rank error bound for a sketch configured with
/// `k`, i.e. the `epsilon` such that a rank estimate is within `epsilon · n`
/// of the true rank with high probability.
pub fn normalized_rank_error(k: u32) -> f64 {
    RANK_ERROR_COEFFICIENT / (k as f64).powf(RANK_ERROR_EXPONENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_from_epsilon_is_monotone() {
        let mut last = u32::MAX;
        for epsilon in [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0] {
            let k = k_from_epsilon(epsilon);
            assert!(k <= last, "k must not grow as epsilon loosens");
            assert!((MIN_K..=MAX_K).contains(&k));
            last = k;
        }
    }

    #[test]
    fn k_and_epsilon_round_trip() {
        // The k derived from a bound must actually deliver that bound.
        for epsilon in [0.005, 0.01, 0.02, 0.1] {
            let k = k_from_epsilon(epsilon);
            assert!(normalized_rank_error(k) <= epsilon + 1e-9);
        }
    }

    #[test]
    fn default_k_error_is_about_one_percent() {
        let epsilon = normalized_rank_error(DEFAULT_K);
        assert!(epsilon > 0.01 && epsilon < 0.02, "got {epsilon}");
    }
}
