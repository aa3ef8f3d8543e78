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

use std::cmp::Ordering;

use crate::error::Result;
use crate::exec_err;
use crate::kll::helper::weighted_item_count;
use crate::kll::sketch::SketchItem;

/// A borrowed, columnar encoding of a finalized [`KllSketch`].
///
/// `items` holds the level buffers concatenated low level first; level `i`
/// occupies `items[levels[i]..levels[i + 1]]` and its items each represent
/// `2^i` inserted values. The slices alias the caller's flat columns — a
/// view is built directly over intermediate-result arrays without copying,
/// and merge routines accept these non-owning ranges as-is.
///
/// [`KllSketch`]: crate::kll::KllSketch
#[derive(Debug, Clone, Copy)]
pub struct KllView<'a, T> {
    /// Accuracy parameter of the serialized sketch.
    pub k: u32,
    /// Total weighted count of items ever inserted.
    pub n: u64,
    /// Exact minimum of all inserted items.
    pub min_value: T,
    /// Exact maximum of all inserted items.
    pub max_value: T,
    /// Concatenated level buffers, low level first.
    pub items: &'a [T],
    /// Offsets into `items`, one more entry than there are levels.
    pub levels: &'a [i32],
}

impl<'a, T: SketchItem> KllView<'a, T> {
    /// The number of levels encoded by this view.
    pub fn num_levels(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// The items of level `height`.
    pub fn level_slice(&self, height: usize) -> &'a [T] {
        let start = self.levels[height] as usize;
        let end = self.levels[height + 1] as usize;
        &self.items[start..end]
    }

    /// Checks the structural invariants of the serialized form.
    ///
    /// Called on intermediate inputs when strict validation is configured;
    /// a failure is reported as an execution error and fails the batch.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return exec_err!("invalid KLL sketch state: k must be positive");
        }
        if self.levels.len() < 2 {
            return exec_err!(
                "invalid KLL sketch state: expected at least 2 level offsets, got {}",
                self.levels.len()
            );
        }
        if self.levels[0] < 0 {
            return exec_err!("invalid KLL sketch state: negative level offset");
        }
        for window in self.levels.windows(2) {
            if window[1] < window[0] {
                return exec_err!(
                    "invalid KLL sketch state: level offsets must be non-decreasing"
                );
            }
        }
        let last = *self.levels.last().unwrap() as usize;
        if last != self.items.len() {
            return exec_err!(
                "invalid KLL sketch state: expected {} items, got {}",
                last,
                self.items.len()
            );
        }
        let weighted = weighted_item_count(
            (0..self.num_levels()).map(|height| self.level_slice(height).len()),
        );
        if weighted != self.n {
            return exec_err!(
                "invalid KLL sketch state: levels encode a weight of {} but n is {}",
                weighted,
                self.n
            );
        }
        for item in self.items {
            if T::compare(item, &self.min_value) == Ordering::Less
                || T::compare(&self.max_value, item) == Ordering::Less
            {
                return exec_err!(
                    "invalid KLL sketch state: item outside the min/max range"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(items: &'a [i64], levels: &'a [i32], n: u64) -> KllView<'a, i64> {
        KllView {
            k: 200,
            n,
            min_value: *items.iter().min().unwrap_or(&0),
            max_value: *items.iter().max().unwrap_or(&0),
            items,
            levels,
        }
    }

    #[test]
    fn valid_two_level_view() {
        // 3 items at weight 1 plus 2 items at weight 2.
        let v = view(&[1, 2, 3, 4, 5], &[0, 3, 5], 7);
        v.validate().unwrap();
        assert_eq!(v.num_levels(), 2);
        assert_eq!(v.level_slice(0), &[1, 2, 3]);
        assert_eq!(v.level_slice(1), &[4, 5]);
    }

    #[test]
    fn rejects_decreasing_offsets() {
        let v = view(&[1, 2, 3], &[0, 2, 1], 3);
        let err = v.validate().unwrap_err();
        assert!(err.to_string().contains("non-decreasing"));
    }

    #[test]
    fn rejects_weight_mismatch() {
        let v = view(&[1, 2, 3], &[0, 3], 4);
        let err = v.validate().unwrap_err();
        assert!(err.to_string().contains("weight"));
    }

    #[test]
    fn rejects_item_count_mismatch() {
        let v = view(&[1, 2, 3], &[0, 2], 2);
        let err = v.validate().unwrap_err();
        assert!(err.to_string().contains("items"));
    }

    #[test]
    fn rejects_item_outside_bounds() {
        let v = KllView::<i64> {
            k: 200,
            n: 2,
            min_value: 2,
            max_value: 3,
            items: &[1, 3],
            levels: &[0, 2],
        };
        let err = v.validate().unwrap_err();
        assert!(err.to_string().contains("min/max"));
    }

    #[test]
    fn rejects_zero_k() {
        let v = KllView::<i64> {
            k: 0,
            n: 1,
            min_value: 1,
            max_value: 1,
            items: &[1],
            levels: &[0, 1],
        };
        assert!(v.validate().is_err());
    }
}
