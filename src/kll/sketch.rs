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
use std::fmt;
use std::mem::size_of;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::kll::helper::{level_capacity, total_capacity};
use crate::kll::view::KllView;

/// Trait implemented by item types supported by [`KllSketch`].
///
/// `compare` must be a total order. For floating point types NaN compares
/// greater than every non-NaN value and equal to itself; integers use their
/// natural order.
pub trait SketchItem:
    Copy + Default + PartialEq + Send + Sync + fmt::Debug + 'static
{
    /// Compare two items.
    fn compare(a: &Self, b: &Self) -> Ordering;
}

macro_rules! natural_order_item {
    ($($t:ty),*) => {
        $(impl SketchItem for $t {
            fn compare(a: &Self, b: &Self) -> Ordering {
                a.cmp(b)
            }
        })*
    };
}

natural_order_item!(i8, i16, i32, i64);

macro_rules! nan_greatest_item {
    ($($t:ty),*) => {
        $(impl SketchItem for $t {
            fn compare(a: &Self, b: &Self) -> Ordering {
                match (a.is_nan(), b.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    (false, false) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
                }
            }
        })*
    };
}

nan_greatest_item!(f32, f64);

/// KLL sketch for estimating quantiles of a stream.
///
/// Items live in levels whose capacities follow the schedule in
/// [`helper`](crate::kll::helper); an item at level `i` represents `2^i`
/// inserted values. Level 0 is the accumulation buffer and the only level
/// that may transiently exceed its target capacity.
///
/// [`Self::finish`] must be called before estimating quantiles; inserting
/// or merging afterwards requires another `finish` before the next
/// estimate. Memory stays proportional to `k · log(n / k)` rather than to
/// the input size.
pub struct KllSketch<T: SketchItem> {
    k: u32,
    n: u64,
    min_value: Option<T>,
    max_value: Option<T>,
    // levels[i] holds the items of weight 2^i, low level first.
    levels: Vec<Vec<T>>,
    sorted: bool,
    rng: SmallRng,
}

impl<T: SketchItem> KllSketch<T> {
    /// Creates an empty sketch with the given accuracy parameter and PRNG
    /// seed.
    pub fn new(k: u32, seed: u64) -> Self {
        debug_assert!(k > 0);
        Self {
            k,
            n: 0,
            min_value: None,
            max_value: None,
            levels: vec![Vec::new()],
            sorted: true,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Creates a sketch equivalent to inserting `value` `count` times.
    ///
    /// The levels encode `count` in binary: one item at level `i` for each
    /// set bit `i`, contributing weight `2^i`. This turns up to 2^60
    /// logical inserts into O(log count) structural work.
    pub fn from_repeated_value(value: T, count: u64, k: u32, seed: u64) -> Self {
        debug_assert!(count > 0);
        let num_levels = (64 - count.leading_zeros()).max(1) as usize;
        let mut levels = vec![Vec::new(); num_levels];
        for (height, level) in levels.iter_mut().enumerate() {
            if (count >> height) & 1 == 1 {
                level.push(value);
            }
        }
        Self {
            k,
            n: count,
            min_value: Some(value),
            max_value: Some(value),
            levels,
            sorted: true,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Restores a sketch from its serialized form.
    ///
    /// The view is trusted here; callers wanting validation run
    /// [`KllView::validate`] first.
    pub fn from_view(view: &KllView<'_, T>, seed: u64) -> Self {
        let mut levels: Vec<Vec<T>> = (0..view.num_levels())
            .map(|height| view.level_slice(height).to_vec())
            .collect();
        if levels.is_empty() {
            levels.push(Vec::new());
        }
        Self {
            k: view.k,
            n: view.n,
            min_value: (view.n > 0).then_some(view.min_value),
            max_value: (view.n > 0).then_some(view.max_value),
            levels,
            sorted: true,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Returns the accuracy parameter `k`.
    pub fn k(&self) -> u32 {
        self.k
    }

    /// Changes the accuracy parameter.
    ///
    /// Only valid before any value has been inserted; a call that leaves
    /// `k` unchanged is always a no-op.
    pub fn set_k(&mut self, k: u32) {
        if k == self.k {
            return;
        }
        debug_assert!(self.is_empty(), "k can only change before any insert");
        self.k = k;
    }

    /// Returns the total weighted count of items inserted.
    pub fn total_count(&self) -> u64 {
        self.n
    }

    /// Returns true if the sketch has seen no data.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Returns the exact minimum of all inserted items.
    pub fn min_value(&self) -> Option<T> {
        self.min_value
    }

    /// Returns the exact maximum of all inserted items.
    pub fn max_value(&self) -> Option<T> {
        self.max_value
    }

    /// Returns the number of retained items.
    pub fn num_retained(&self) -> usize {
        self.levels.iter().map(|level| level.len()).sum()
    }

    /// Returns the number of live levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Inserts a single value.
    pub fn insert(&mut self, value: T) {
        if self.num_retained() >= self.capacity() {
            self.compact_once();
        }
        self.update_min_max(value);
        self.n += 1;
        self.sorted = false;
        self.levels[0].push(value);
    }

    /// Merges another sketch into this one.
    ///
    /// The other sketch is expected to share this sketch's capacity
    /// schedule; a differing `k` is absorbed by the compaction pass that
    /// follows the merge.
    pub fn merge(&mut self, other: &KllSketch<T>) {
        self.merge_sketches(std::slice::from_ref(other));
    }

    /// Merges a batch of sketches, compacting once at the end.
    pub fn merge_sketches(&mut self, others: &[KllSketch<T>]) {
        for other in others {
            if other.is_empty() {
                continue;
            }
            self.n += other.n;
            self.sorted = false;
            self.combine_min_max(other.min_value, other.max_value);
            for (height, level) in other.levels.iter().enumerate() {
                self.append_level(height, level);
            }
        }
        self.compact();
    }

    /// Merges one serialized view into this sketch.
    pub fn merge_view(&mut self, view: &KllView<'_, T>) {
        self.merge_views(std::slice::from_ref(view));
    }

    /// Merges a batch of serialized views, compacting once at the end.
    ///
    /// The views' item ranges are borrowed from the caller and never
    /// copied into intermediate owned buffers.
    pub fn merge_views(&mut self, views: &[KllView<'_, T>]) {
        for view in views {
            if view.n == 0 {
                continue;
            }
            self.n += view.n;
            self.sorted = false;
            self.combine_min_max(Some(view.min_value), Some(view.max_value));
            for height in 0..view.num_levels() {
                self.append_level(height, view.level_slice(height));
            }
        }
        self.compact();
    }

    /// Runs compactions until the retained item count respects the
    /// capacity schedule again.
    pub fn compact(&mut self) {
        while self.num_retained() >= self.capacity() {
            let Some(height) = self.find_level_to_compact() else {
                break;
            };
            self.compact_level(height);
        }
    }

    /// Sorts every live level. Required before estimating quantiles and
    /// before serializing.
    pub fn finish(&mut self) {
        if self.sorted {
            return;
        }
        for level in &mut self.levels {
            level.sort_by(T::compare);
        }
        self.sorted = true;
    }

    /// Estimates the value at the given normalized rank in [0, 1].
    ///
    /// Rank 0 returns the exact minimum and rank 1 the exact maximum. The
    /// sketch must be non-empty and finished.
    pub fn estimate_quantile(&self, rank: f64) -> T {
        self.estimate_quantiles(std::slice::from_ref(&rank))[0]
    }

    /// Estimates the values at the given normalized ranks, answering all of
    /// them in one ascending pass over the retained items.
    ///
    /// Results are returned in the caller's rank order.
    pub fn estimate_quantiles(&self, ranks: &[f64]) -> Vec<T> {
        debug_assert!(self.n > 0, "quantile estimate on an empty sketch");
        debug_assert!(self.sorted, "finish() must precede quantile estimates");

        let (Some(min), Some(max)) = (self.min_value, self.max_value) else {
            return vec![T::default(); ranks.len()];
        };

        let mut entries: Vec<(T, u64)> = Vec::with_capacity(self.num_retained());
        for (height, level) in self.levels.iter().enumerate() {
            let weight = 1u64 << height;
            entries.extend(level.iter().map(|item| (*item, weight)));
        }
        entries.sort_by(|a, b| T::compare(&a.0, &b.0));

        let mut order: Vec<usize> = (0..ranks.len()).collect();
        order.sort_by(|&a, &b| {
            ranks[a].partial_cmp(&ranks[b]).unwrap_or(Ordering::Equal)
        });

        let mut results = vec![T::default(); ranks.len()];
        let mut cursor = 0usize;
        let mut cumulative = entries.first().map(|entry| entry.1).unwrap_or(0);
        for &index in &order {
            let rank = ranks[index];
            results[index] = if rank <= 0.0 {
                min
            } else if rank >= 1.0 {
                max
            } else {
                let target = (rank * self.n as f64).ceil() as u64;
                while cumulative < target && cursor + 1 < entries.len() {
                    cursor += 1;
                    cumulative += entries[cursor].1;
                }
                entries[cursor].0
            };
        }
        results
    }

    /// Returns the retained items, levels concatenated low level first.
    pub fn items(&self) -> impl Iterator<Item = T> + '_ {
        self.levels.iter().flat_map(|level| level.iter().copied())
    }

    /// Returns the level offsets matching [`Self::items`]: level `i`
    /// occupies `items[offsets[i]..offsets[i + 1]]`.
    pub fn level_offsets(&self) -> Vec<i32> {
        let mut offsets = Vec::with_capacity(self.levels.len() + 1);
        let mut offset = 0i32;
        offsets.push(offset);
        for level in &self.levels {
            offset += level.len() as i32;
            offsets.push(offset);
        }
        offsets
    }

    /// Bytes of heap memory held by this sketch.
    pub fn heap_size(&self) -> usize {
        self.levels.capacity() * size_of::<Vec<T>>()
            + self
                .levels
                .iter()
                .map(|level| level.capacity() * size_of::<T>())
                .sum::<usize>()
    }

    /// Returns an independent copy whose PRNG is freshly seeded with
    /// `seed`. The copy shares no storage with `self` and is safe to hand
    /// to another thread.
    pub(crate) fn duplicate_with_seed(&self, seed: u64) -> Self {
        Self {
            k: self.k,
            n: self.n,
            min_value: self.min_value,
            max_value: self.max_value,
            levels: self.levels.clone(),
            sorted: self.sorted,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn capacity(&self) -> usize {
        total_capacity(self.k, self.levels.len())
    }

    fn compact_once(&mut self) {
        if let Some(height) = self.find_level_to_compact() {
            self.compact_level(height);
        }
    }

    fn find_level_to_compact(&self) -> Option<usize> {
        let num_levels = self.levels.len();
        (0..num_levels).find(|&height| {
            self.levels[height].len()
                >= level_capacity(self.k, num_levels, height) as usize
        })
    }

    /// Halves level `height`, promoting a uniformly chosen half of its
    /// sorted items to the level above.
    fn compact_level(&mut self, height: usize) {
        if height + 1 == self.levels.len() {
            self.levels.push(Vec::new());
        }

        let mut current = std::mem::take(&mut self.levels[height]);
        // An odd item stays behind at this level to conserve weight.
        let leftover = if current.len() % 2 == 1 {
            current.pop()
        } else {
            None
        };
        current.sort_by(T::compare);

        // One coin per compaction, not per item.
        let parity = usize::from(self.rng.gen::<bool>());
        self.levels[height + 1].extend(
            current
                .into_iter()
                .enumerate()
                .filter_map(|(index, item)| (index % 2 == parity).then_some(item)),
        );
        if let Some(item) = leftover {
            self.levels[height].push(item);
        }
    }

    fn append_level(&mut self, height: usize, items: &[T]) {
        if items.is_empty() {
            return;
        }
        if self.levels.len() <= height {
            self.levels.resize_with(height + 1, Vec::new);
        }
        self.levels[height].extend_from_slice(items);
    }

    fn update_min_max(&mut self, value: T) {
        self.combine_min_max(Some(value), Some(value));
    }

    fn combine_min_max(&mut self, min: Option<T>, max: Option<T>) {
        if let Some(other) = min {
            self.min_value = Some(match self.min_value {
                Some(current) if T::compare(&current, &other) != Ordering::Greater => {
                    current
                }
                _ => other,
            });
        }
        if let Some(other) = max {
            self.max_value = Some(match self.max_value {
                Some(current) if T::compare(&current, &other) != Ordering::Less => {
                    current
                }
                _ => other,
            });
        }
    }

    #[cfg(test)]
    fn level_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(|level| level.len()).collect()
    }
}

impl<T: SketchItem> fmt::Debug for KllSketch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KllSketch")
            .field("k", &self.k)
            .field("n", &self.n)
            .field("num_levels", &self.levels.len())
            .field("num_retained", &self.num_retained())
            .finish()
    }
}
