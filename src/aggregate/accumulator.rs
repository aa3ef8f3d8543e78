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

//! Per-group accumulator state for the approximate percentile aggregate.

use std::mem::size_of;

use crate::aggregate::{random_seed, APPROX_PERCENTILE};
use crate::error::Result;
use crate::exec_err;
use crate::kll::{k_from_epsilon, KllSketch, KllView, SketchItem, DEFAULT_K};

/// Weights below this go through the plain insert loop; larger weights are
/// buffered and expanded via the repeated-value sketch construction.
const MIN_COUNT_TO_BUFFER: i64 = 512;

/// The large-weight buffer is flushed once it reaches this many entries.
const MAX_BUFFER_SIZE: usize = 4096;

/// Largest accepted weight.
pub(crate) const MAX_WEIGHT: i64 = (1i64 << 60) - 1;

/// Checks that a weight lies in `[1, MAX_WEIGHT]`, failing the batch with
/// an execution error otherwise.
pub(crate) fn check_weight(weight: i64) -> Result<()> {
    if (1..=MAX_WEIGHT).contains(&weight) {
        Ok(())
    } else {
        exec_err!(
            "{APPROX_PERCENTILE}: weight must be in range [1, {MAX_WEIGHT}], \
             got {weight}"
        )
    }
}

/// One group's state: a [`KllSketch`] plus a buffer of deferred
/// `(value, count)` pairs with large counts.
///
/// Inserting a value with a count of up to 2^60 one item at a time is
/// infeasible. Counts of at least [`MIN_COUNT_TO_BUFFER`] are therefore
/// parked in `large_count_values`; [`Self::flush`] expands each pair into a
/// sketch whose levels encode the count in binary and merges them all in
/// one batched call, collapsing the work per pair to O(log count).
#[derive(Debug)]
pub(crate) struct KllSketchAccumulator<T: SketchItem> {
    sketch: KllSketch<T>,
    large_count_values: Vec<(T, i64)>,
}

impl<T: SketchItem> KllSketchAccumulator<T> {
    pub(crate) fn new(fixed_random_seed: Option<u32>) -> Self {
        Self {
            sketch: KllSketch::new(DEFAULT_K, random_seed(fixed_random_seed)),
            large_count_values: Vec::new(),
        }
    }

    /// Applies an accuracy bound by resizing the sketch's `k`. A no-op when
    /// the resulting `k` is unchanged.
    pub(crate) fn set_accuracy(&mut self, accuracy: f64) {
        self.sketch.set_k(k_from_epsilon(accuracy));
    }

    pub(crate) fn sketch(&self) -> &KllSketch<T> {
        &self.sketch
    }

    pub(crate) fn append(&mut self, value: T) {
        self.sketch.insert(value);
    }

    pub(crate) fn append_count(
        &mut self,
        value: T,
        count: i64,
        fixed_random_seed: Option<u32>,
    ) {
        if count < MIN_COUNT_TO_BUFFER {
            for _ in 0..count {
                self.sketch.insert(value);
            }
        } else {
            self.large_count_values.push((value, count));
            if self.large_count_values.len() >= MAX_BUFFER_SIZE {
                self.flush(fixed_random_seed);
            }
        }
    }

    pub(crate) fn append_view(&mut self, view: &KllView<'_, T>) {
        self.sketch.merge_view(view);
    }

    pub(crate) fn append_views(&mut self, views: &[KllView<'_, T>]) {
        self.sketch.merge_views(views);
    }

    /// Drains the large-count buffer into the sketch and finalizes it.
    ///
    /// Must be called before the sketch is used for quantile estimates.
    pub(crate) fn flush(&mut self, fixed_random_seed: Option<u32>) {
        if !self.large_count_values.is_empty() {
            let k = self.sketch.k();
            let sketches: Vec<KllSketch<T>> = self
                .large_count_values
                .drain(..)
                .map(|(value, count)| {
                    KllSketch::from_repeated_value(
                        value,
                        count as u64,
                        k,
                        random_seed(fixed_random_seed),
                    )
                })
                .collect();
            self.sketch.merge_sketches(&sketches);
        }
        self.sketch.finish();
    }

    /// Returns an independent, finalized copy of this group's state with
    /// the large-count buffer folded in. The accumulator itself is not
    /// mutated.
    ///
    /// The copy shares no storage with the accumulator, so it is safe to
    /// serialize from another thread while the owning operator keeps
    /// running, e.g. when spilling.
    pub(crate) fn compact(&self, fixed_random_seed: Option<u32>) -> KllSketch<T> {
        let mut copy = self
            .sketch
            .duplicate_with_seed(random_seed(fixed_random_seed));
        if !self.large_count_values.is_empty() {
            let k = copy.k();
            let sketches: Vec<KllSketch<T>> = self
                .large_count_values
                .iter()
                .map(|(value, count)| {
                    KllSketch::from_repeated_value(
                        *value,
                        *count as u64,
                        k,
                        random_seed(fixed_random_seed),
                    )
                })
                .collect();
            copy.merge_sketches(&sketches);
        }
        copy.compact();
        copy.finish();
        copy
    }

    /// Bytes of memory used by this accumulator.
    pub(crate) fn size(&self) -> usize {
        size_of::<Self>()
            + self.sketch.heap_size()
            + self.large_count_values.capacity() * size_of::<(T, i64)>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_bounds() {
        check_weight(1).unwrap();
        check_weight(MAX_WEIGHT).unwrap();
        for weight in [0, -1, MAX_WEIGHT + 1] {
            let err = check_weight(weight).unwrap_err();
            let message = err.to_string();
            assert!(message.contains("approx_percentile"), "{message}");
            assert!(message.contains("weight must be in range"), "{message}");
            assert!(message.contains(&weight.to_string()), "{message}");
        }
    }

    #[test]
    fn small_counts_insert_directly() {
        let mut accumulator = KllSketchAccumulator::<i64>::new(Some(1));
        accumulator.append_count(9, 511, Some(1));
        assert_eq!(accumulator.sketch().total_count(), 511);
    }

    #[test]
    fn large_counts_defer_until_flush() {
        let mut accumulator = KllSketchAccumulator::<i64>::new(Some(1));
        accumulator.append_count(9, 512, Some(1));
        assert_eq!(accumulator.sketch().total_count(), 0);

        accumulator.flush(Some(1));
        assert_eq!(accumulator.sketch().total_count(), 512);
        assert_eq!(accumulator.sketch().estimate_quantile(0.5), 9);
    }

    #[test]
    fn buffer_flushes_when_full() {
        let mut accumulator = KllSketchAccumulator::<i64>::new(Some(1));
        for _ in 0..4096 {
            accumulator.append_count(3, 512, Some(1));
        }
        // The 4096th entry trips the automatic flush.
        assert_eq!(accumulator.sketch().total_count(), 4096 * 512);
    }

    #[test]
    fn compact_leaves_accumulator_untouched() {
        let mut accumulator = KllSketchAccumulator::<i64>::new(Some(1));
        accumulator.append_count(5, 1000, Some(1));

        let compacted = accumulator.compact(Some(1));
        assert_eq!(compacted.total_count(), 1000);
        assert_eq!(compacted.estimate_quantile(0.5), 5);
        // The buffered pair is still pending in the original.
        assert_eq!(accumulator.sketch().total_count(), 0);

        accumulator.flush(Some(1));
        assert_eq!(accumulator.sketch().total_count(), 1000);
    }

    #[test]
    fn mixed_weights_estimate() {
        let mut accumulator = KllSketchAccumulator::<i64>::new(Some(1));
        for value in 1..=10 {
            accumulator.append_count(value, 1000, Some(1));
        }
        accumulator.flush(Some(1));

        assert_eq!(accumulator.sketch().total_count(), 10_000);
        let median = accumulator.sketch().estimate_quantile(0.5);
        assert!((4..=7).contains(&median), "median {median}");
        assert_eq!(accumulator.sketch().estimate_quantile(0.0), 1);
        assert_eq!(accumulator.sketch().estimate_quantile(1.0), 10);
    }

    #[test]
    fn accuracy_tightens_k() {
        let mut accumulator = KllSketchAccumulator::<f64>::new(Some(1));
        let default_k = accumulator.sketch().k();
        accumulator.set_accuracy(0.001);
        assert!(accumulator.sketch().k() > default_k);
        // Re-applying the same accuracy is a no-op even after inserts.
        accumulator.append(1.0);
        accumulator.set_accuracy(0.001);
    }

    #[test]
    fn size_grows_with_buffered_values() {
        let mut accumulator = KllSketchAccumulator::<i64>::new(Some(1));
        let empty = accumulator.size();
        for value in 0..100 {
            accumulator.append_count(value, 1024, Some(1));
        }
        assert!(accumulator.size() > empty);
    }
}
