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

//! Aggregate accumulator contracts and the approximate percentile
//! aggregate built on them.
//!
//! Aggregation runs in up to three phases: a partial phase folds raw input
//! rows into per-group accumulators, an optional merge phase combines
//! serialized intermediate states produced by other nodes, and a final
//! phase emits the aggregate values. [`Accumulator`] covers global
//! aggregations (a single group); [`GroupsAccumulator`] manages the state
//! for all groups of a grouped aggregation at once, accepting batches of
//! rows fanned out over group indices.

use std::fmt::Debug;

use arrow::array::{ArrayRef, BooleanArray};
use rand::Rng;

use crate::error::Result;

mod accumulator;
mod approx_percentile;

pub use approx_percentile::{
    ApproxPercentile, ApproxPercentileAccumulator, ApproxPercentileGroupsAccumulator,
};

/// Name under which the aggregate is registered.
pub const APPROX_PERCENTILE: &str = "approx_percentile";

/// Constructs the name of an intermediate state column for an aggregate.
pub fn format_state_name(name: &str, state_name: &str) -> String {
    format!("{name}[{state_name}]")
}

/// Resolves the PRNG seed for a sketch: the configured fixed seed when
/// present, a fresh random seed otherwise.
pub(crate) fn random_seed(fixed_random_seed: Option<u32>) -> u64 {
    match fixed_random_seed {
        Some(seed) => u64::from(seed),
        None => rand::thread_rng().gen(),
    }
}

/// Describes how many groups should be emitted by
/// [`GroupsAccumulator::state`] and [`GroupsAccumulator::evaluate`].
#[derive(Debug, Clone, Copy)]
pub enum EmitTo {
    /// Emit all groups.
    All,
    /// Emit only the first `n` groups and shift all existing group indexes
    /// down by `n`.
    ///
    /// For example, if `n=10`, group indexes `0, 1, ... 9` are emitted and
    /// group indexes `10, 11, 12, ...` become `0, 1, 2, ...`.
    First(usize),
}

impl EmitTo {
    /// Removes the number of rows from `v` required to emit, returning a
    /// `Vec` with the elements taken and leaving the remaining values in
    /// `v`.
    ///
    /// This avoids copying for `Self::All`.
    pub fn take_needed<T>(&self, v: &mut Vec<T>) -> Vec<T> {
        match self {
            Self::All => std::mem::take(v),
            Self::First(n) => {
                let split_at = (*n).min(v.len());
                let mut t = v.split_off(split_at);
                std::mem::swap(v, &mut t);
                t
            }
        }
    }
}

/// Tracks the aggregate state for a single group.
///
/// Used for global aggregations, where the whole input belongs to one
/// group, and as the building block the framework wraps when a grouped
/// query has only a handful of groups.
///
/// All columns handed to an accumulator cover the same rows: the value
/// column, the optional weight column and the argument columns of
/// [`Self::update_batch`] are parallel, and [`Self::merge_batch`] receives
/// the columns previously produced by [`Self::state`].
pub trait Accumulator: Send + Debug {
    /// Updates the state from a batch of raw input columns.
    fn update_batch(&mut self, values: &[ArrayRef]) -> Result<()>;

    /// Merges serialized intermediate states (the output of
    /// [`Self::state`]) into this accumulator.
    fn merge_batch(&mut self, states: &[ArrayRef]) -> Result<()>;

    /// Returns the serialized intermediate state as single-row columns.
    ///
    /// The group state is compacted for serialization but not otherwise
    /// mutated; accumulation may continue afterwards.
    fn state(&mut self) -> Result<Vec<ArrayRef>>;

    /// Returns the final aggregate value as a single-row column.
    fn evaluate(&mut self) -> Result<ArrayRef>;

    /// Bytes of memory used by this accumulator.
    fn size(&self) -> usize;
}

/// Stores the aggregate state for *all* groups of a grouped aggregation.
///
/// Each group is assigned a contiguous `group_index` by the surrounding
/// operator's hash table; the accumulator holds one state per index and
/// constructs states in place as `total_num_groups` grows. Group state is
/// owned by the operator: it is allocated against the operator's memory
/// reservation and dropped when the operator drops the accumulator.
pub trait GroupsAccumulator: Send {
    /// Updates the per-group state from a batch of raw input columns.
    ///
    /// * `values` — the input argument columns
    /// * `group_indices` — the group each row belongs to, parallel to the
    ///   rows of `values`
    /// * `opt_filter` — when present, only rows where `opt_filter[i]` is
    ///   true update the state
    /// * `total_num_groups` — the number of groups (the largest group
    ///   index is `total_num_groups - 1`); may grow between calls
    fn update_batch(
        &mut self,
        values: &[ArrayRef],
        group_indices: &[usize],
        opt_filter: Option<&BooleanArray>,
        total_num_groups: usize,
    ) -> Result<()>;

    /// Merges serialized intermediate states into the per-group state.
    ///
    /// `values` holds columns previously produced by [`Self::state`];
    /// other arguments are as for [`Self::update_batch`].
    fn merge_batch(
        &mut self,
        values: &[ArrayRef],
        group_indices: &[usize],
        opt_filter: Option<&BooleanArray>,
        total_num_groups: usize,
    ) -> Result<()>;

    /// Returns the serialized intermediate state for the emitted groups,
    /// releasing their state.
    ///
    /// Rows are in group index order. A group that received no values
    /// yields a null row.
    fn state(&mut self, emit_to: EmitTo) -> Result<Vec<ArrayRef>>;

    /// Returns the final aggregate value for the emitted groups, releasing
    /// their state.
    ///
    /// Rows are in group index order; groups without values are null.
    fn evaluate(&mut self, emit_to: EmitTo) -> Result<ArrayRef>;

    /// Bytes of memory used to store the state of this accumulator.
    fn size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_name_format() {
        assert_eq!(
            format_state_name(APPROX_PERCENTILE, "kll"),
            "approx_percentile[kll]"
        );
    }

    #[test]
    fn fixed_seed_is_stable() {
        assert_eq!(random_seed(Some(7)), 7);
        assert_eq!(random_seed(Some(7)), random_seed(Some(7)));
    }

    #[test]
    fn emit_all_drains() {
        let mut v = vec![1, 2, 3];
        let taken = EmitTo::All.take_needed(&mut v);
        assert_eq!(taken, vec![1, 2, 3]);
        assert!(v.is_empty());
    }

    #[test]
    fn emit_first_shifts_down() {
        let mut v = vec![1, 2, 3, 4];
        let taken = EmitTo::First(2).take_needed(&mut v);
        assert_eq!(taken, vec![1, 2]);
        assert_eq!(v, vec![3, 4]);
    }

    #[test]
    fn emit_first_beyond_len() {
        let mut v = vec![1];
        let taken = EmitTo::First(5).take_needed(&mut v);
        assert_eq!(taken, vec![1]);
        assert!(v.is_empty());
    }
}
