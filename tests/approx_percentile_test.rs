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

//! End-to-end tests driving the aggregate through the full three-phase
//! protocol the way a distributed engine would.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, ListArray, StructArray,
};
use arrow::buffer::{OffsetBuffer, ScalarBuffer};
use arrow::datatypes::{DataType, Field};

use approx_percentile::kll::{normalized_rank_error, DEFAULT_K};
use approx_percentile::memory_pool::{MemoryPool, UnboundedMemoryPool};
use approx_percentile::{
    Accumulator, ApproxPercentile, EmitTo, GroupsAccumulator, QueryOptions,
};

fn pool() -> Arc<dyn MemoryPool> {
    Arc::new(UnboundedMemoryPool::default())
}

fn options() -> QueryOptions {
    QueryOptions::default().with_fixed_random_seed(7)
}

fn percentile_scalar(p: f64, len: usize) -> ArrayRef {
    Arc::new(Float64Array::from(vec![p; len]))
}

fn percentile_list(ranks: &[f64], len: usize) -> ArrayRef {
    let mut values = Vec::with_capacity(ranks.len() * len);
    let mut offsets = Vec::with_capacity(len + 1);
    offsets.push(0i32);
    for _ in 0..len {
        values.extend_from_slice(ranks);
        offsets.push(values.len() as i32);
    }
    Arc::new(
        ListArray::try_new(
            Arc::new(Field::new("item", DataType::Float64, true)),
            OffsetBuffer::new(ScalarBuffer::from(offsets)),
            Arc::new(Float64Array::from(values)),
            None,
        )
        .unwrap(),
    )
}

/// Two partitions aggregate disjoint halves of the input across two
/// groups, serialize their states, and a final node merges and evaluates.
/// The result must agree with a single-node aggregation within the error
/// bound of the sketch.
#[test]
fn distributed_grouped_median() {
    let n = 20_000i64;
    let function =
        ApproxPercentile::try_new(&[DataType::Int64, DataType::Float64], options())
            .unwrap();

    // Partition rows round-robin; group = value parity.
    let mut states = Vec::new();
    for partition in 0..2i64 {
        let values: Vec<i64> = (1..=n).filter(|v| v % 2 == partition).collect();
        let group_indices: Vec<usize> =
            values.iter().map(|v| (v % 4 < 2) as usize).collect();
        let len = values.len();

        let mut partial = function.create_groups_accumulator(&pool()).unwrap();
        partial
            .update_batch(
                &[
                    Arc::new(Int64Array::from(values)) as ArrayRef,
                    percentile_scalar(0.5, len),
                ],
                &group_indices,
                None,
                2,
            )
            .unwrap();
        states.push(partial.state(EmitTo::All).unwrap());
    }

    let mut merged = function.create_groups_accumulator(&pool()).unwrap();
    for state in &states {
        merged.merge_batch(state, &[0, 1], None, 2).unwrap();
    }
    let result = merged.evaluate(EmitTo::All).unwrap();
    let result = result.as_any().downcast_ref::<Int64Array>().unwrap();
    assert_eq!(result.len(), 2);

    // Each group holds n/2 values spread over the whole 1..=n range, so a
    // rank error translates into twice as many value units.
    let bound = (4.0 * normalized_rank_error(DEFAULT_K) * n as f64) as i64;
    for group in 0..2 {
        let estimate = result.value(group);
        assert!(
            (estimate - n / 2).abs() <= bound,
            "group {group} estimate {estimate}"
        );
    }
}

/// The intermediate column is a ROW whose header children repeat the
/// latched percentile arguments on every row.
#[test]
fn intermediate_state_shape() {
    let function =
        ApproxPercentile::try_new(&[DataType::Int64, DataType::Float64], options())
            .unwrap();
    let mut partial = function.create_groups_accumulator(&pool()).unwrap();
    partial
        .update_batch(
            &[
                Arc::new(Int64Array::from(vec![10, 20, 30])) as ArrayRef,
                percentile_scalar(0.9, 3),
            ],
            &[0, 1, 1],
            None,
            3,
        )
        .unwrap();

    let state = partial.state(EmitTo::All).unwrap();
    assert_eq!(state.len(), 1);
    let rows = state[0].as_any().downcast_ref::<StructArray>().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows.data_type(), &function.state_type());

    // Groups 0 and 1 hold data; group 2 is a null row.
    assert!(!rows.is_null(0));
    assert!(!rows.is_null(1));
    assert!(rows.is_null(2));

    // The percentile header is constant across rows.
    let percentiles = rows
        .column(0)
        .as_any()
        .downcast_ref::<ListArray>()
        .unwrap();
    for row in 0..3 {
        let entry = percentiles.value(row);
        let entry = entry.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.value(0), 0.9);
    }
}

/// Weighted input with an accuracy bound and an array of percentiles,
/// through partial, merge and final phases.
#[test]
fn weighted_array_percentiles_pipeline() {
    let list_type =
        DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
    let function = ApproxPercentile::try_new(
        &[
            DataType::Int64,
            DataType::Int64,
            list_type,
            DataType::Float64,
        ],
        options(),
    )
    .unwrap();

    // Values 1..=100, value v carries weight v * 1000.
    let values: Vec<i64> = (1..=100).collect();
    let weights: Vec<i64> = values.iter().map(|v| v * 1000).collect();
    let len = values.len();
    let ranks = [0.0, 0.5, 1.0];

    let mut partial = function.create_accumulator().unwrap();
    partial
        .update_batch(&[
            Arc::new(Int64Array::from(values)) as ArrayRef,
            Arc::new(Int64Array::from(weights)) as ArrayRef,
            percentile_list(&ranks, len),
            Arc::new(Float64Array::from(vec![0.01; len])) as ArrayRef,
        ])
        .unwrap();

    let mut merged = function.create_accumulator().unwrap();
    merged.merge_batch(&partial.state().unwrap()).unwrap();
    let result = merged.evaluate().unwrap();
    let result = result.as_any().downcast_ref::<ListArray>().unwrap();
    assert_eq!(result.len(), 1);
    let row = result.value(0);
    let row = row.as_any().downcast_ref::<Int64Array>().unwrap();
    assert_eq!(row.len(), 3);
    assert_eq!(row.value(0), 1);
    assert_eq!(row.value(2), 100);

    // Total weight is 1000 * sum(1..=100); the weighted median sits at the
    // value v where the cumulative weight v(v+1)/2 reaches half of 5050,
    // i.e. around 71.
    let median = row.value(1);
    assert!((65..=77).contains(&median), "weighted median {median}");
}

/// Groups that never see a value stay null through every phase.
#[test]
fn all_null_groups_stay_null() {
    let function =
        ApproxPercentile::try_new(&[DataType::Int64, DataType::Float64], options())
            .unwrap();
    let num_groups = 10;
    let num_rows = 1_000;

    let mut partial = function.create_groups_accumulator(&pool()).unwrap();
    let group_indices: Vec<usize> = (0..num_rows).map(|row| row % num_groups).collect();
    partial
        .update_batch(
            &[
                Arc::new(Int64Array::from(vec![None::<i64>; num_rows])) as ArrayRef,
                percentile_scalar(0.5, num_rows),
            ],
            &group_indices,
            None,
            num_groups,
        )
        .unwrap();

    let state = partial.state(EmitTo::All).unwrap();
    let rows = state[0].as_any().downcast_ref::<StructArray>().unwrap();
    assert_eq!(rows.len(), num_groups);
    for row in 0..num_groups {
        assert!(rows.is_null(row));
    }

    let mut merged = function.create_groups_accumulator(&pool()).unwrap();
    let merge_indices: Vec<usize> = (0..num_groups).collect();
    merged
        .merge_batch(&state, &merge_indices, None, num_groups)
        .unwrap();
    let result = merged.evaluate(EmitTo::All).unwrap();
    assert_eq!(result.len(), num_groups);
    assert_eq!(result.null_count(), num_groups);
}
