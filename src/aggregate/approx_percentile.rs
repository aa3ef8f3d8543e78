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

//! APPROX_PERCENTILE aggregate expression.
//!
//! Estimates one or more quantiles of a numeric column with a KLL sketch.
//! Accepted argument shapes, for every numeric input type `T` in
//! {Int8, Int16, Int32, Int64, Float32, Float64}:
//!
//! ```text
//! approx_percentile(value T, percentile Double)                           -> T
//! approx_percentile(value T, weight Int64, percentile Double)             -> T
//! approx_percentile(value T, percentile Double, accuracy Double)          -> T
//! approx_percentile(value T, weight Int64, percentile Double,
//!                   accuracy Double)                                      -> T
//! ```
//!
//! plus the same four shapes with `percentile List<Double>` returning
//! `List<T>`. The percentile (and accuracy, when present) must be constant
//! across every row the aggregate sees; this is what allows the
//! intermediate state to carry a single percentile header regardless of
//! row count.

use std::fmt::Debug;
use std::mem::size_of;
use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, Float64Array, Int32Array,
    Int64Array, ListArray, PrimitiveArray, StructArray,
};
use arrow::buffer::{NullBuffer, OffsetBuffer, ScalarBuffer};
use arrow::datatypes::{
    ArrowPrimitiveType, DataType, Field, Fields, Float32Type, Float64Type, Int16Type,
    Int32Type, Int64Type, Int8Type,
};
use log::debug;

use crate::aggregate::accumulator::{check_weight, KllSketchAccumulator};
use crate::aggregate::{
    format_state_name, Accumulator, EmitTo, GroupsAccumulator, APPROX_PERCENTILE,
};
use crate::config::QueryOptions;
use crate::error::Result;
use crate::kll::{KllSketch, KllView, SketchItem};
use crate::memory_pool::{MemoryConsumer, MemoryPool, MemoryReservation};
use crate::{downcast_value, exec_err, internal_err, not_impl_err, plan_err};

// Child order of the intermediate ROW state.
const PERCENTILES: usize = 0;
const PERCENTILES_IS_ARRAY: usize = 1;
const ACCURACY: usize = 2;
const K: usize = 3;
const N: usize = 4;
const MIN_VALUE: usize = 5;
const MAX_VALUE: usize = 6;
const ITEMS: usize = 7;
const LEVELS: usize = 8;
const NUM_STATE_CHILDREN: usize = 9;

/// Sentinel for an accuracy that has not been latched yet.
const MISSING_NORMALIZED_VALUE: f64 = -1.0;

/// The percentile request latched from the first batch.
#[derive(Debug, Clone, PartialEq)]
struct Percentiles {
    values: Vec<f64>,
    is_array: bool,
}

/// Validates and latches the percentile and accuracy arguments.
///
/// Both are runtime constants: the first batch fixes their values and every
/// later batch (raw or intermediate) must agree, value for value. A
/// disagreement is a user error that fails the batch before any
/// accumulator is touched.
#[derive(Debug, Clone)]
struct PercentileArguments {
    percentiles: Option<Percentiles>,
    accuracy: f64,
}

impl PercentileArguments {
    fn new() -> Self {
        Self {
            percentiles: None,
            accuracy: MISSING_NORMALIZED_VALUE,
        }
    }

    fn accuracy(&self) -> Option<f64> {
        (self.accuracy != MISSING_NORMALIZED_VALUE).then_some(self.accuracy)
    }

    fn check_set_percentile(&mut self, values: &[f64], is_array: bool) -> Result<()> {
        match &self.percentiles {
            None => {
                if values.is_empty() {
                    return exec_err!("{APPROX_PERCENTILE}: percentile cannot be empty");
                }
                for &value in values {
                    if !(0.0..=1.0).contains(&value) {
                        return exec_err!(
                            "{APPROX_PERCENTILE}: percentile must be between 0 and 1, \
                             got {value}"
                        );
                    }
                }
                self.percentiles = Some(Percentiles {
                    values: values.to_vec(),
                    is_array,
                });
                Ok(())
            }
            Some(latched) => {
                if latched.is_array != is_array
                    || latched.values.len() != values.len()
                    || latched.values.iter().zip(values).any(|(a, b)| a != b)
                {
                    return exec_err!(
                        "{APPROX_PERCENTILE}: percentile argument must be constant \
                         for all input rows"
                    );
                }
                Ok(())
            }
        }
    }

    fn check_set_percentile_column(
        &mut self,
        column: &ArrayRef,
        rows: &RowSelection<'_>,
    ) -> Result<()> {
        match column.data_type() {
            DataType::Float64 => {
                let array = downcast_value!(column, Float64Array);
                for row in rows.iter(array.len()) {
                    if array.is_null(row) {
                        return exec_err!(
                            "{APPROX_PERCENTILE}: percentile cannot be null"
                        );
                    }
                    self.check_set_percentile(&[array.value(row)], false)?;
                }
                Ok(())
            }
            DataType::List(field) if field.data_type() == &DataType::Float64 => {
                let array = downcast_value!(column, ListArray);
                let values = downcast_value!(array.values(), Float64Array);
                let offsets = array.value_offsets();
                for row in rows.iter(array.len()) {
                    if array.is_null(row) {
                        return exec_err!(
                            "{APPROX_PERCENTILE}: percentile cannot be null"
                        );
                    }
                    let start = offsets[row] as usize;
                    let end = offsets[row + 1] as usize;
                    for index in start..end {
                        if values.is_null(index) {
                            return exec_err!(
                                "{APPROX_PERCENTILE}: percentile cannot be null"
                            );
                        }
                    }
                    self.check_set_percentile(&values.values()[start..end], true)?;
                }
                Ok(())
            }
            other => exec_err!(
                "{APPROX_PERCENTILE}: incorrect type for percentile: {other}"
            ),
        }
    }

    fn check_set_accuracy_column(
        &mut self,
        column: &ArrayRef,
        rows: &RowSelection<'_>,
    ) -> Result<()> {
        if column.data_type() != &DataType::Float64 {
            return exec_err!(
                "{APPROX_PERCENTILE}: incorrect type for accuracy: {}",
                column.data_type()
            );
        }
        let array = downcast_value!(column, Float64Array);
        for row in rows.iter(array.len()) {
            if array.is_null(row) {
                return exec_err!("{APPROX_PERCENTILE}: accuracy cannot be null");
            }
            self.check_set_accuracy(array.value(row))?;
        }
        Ok(())
    }

    fn check_set_accuracy(&mut self, accuracy: f64) -> Result<()> {
        if !(accuracy > 0.0 && accuracy <= 1.0) {
            return exec_err!(
                "{APPROX_PERCENTILE}: accuracy must be between 0 and 1, got {accuracy}"
            );
        }
        if self.accuracy == MISSING_NORMALIZED_VALUE {
            self.accuracy = accuracy;
        } else if accuracy != self.accuracy {
            return exec_err!(
                "{APPROX_PERCENTILE}: accuracy argument must be constant for all \
                 input rows"
            );
        }
        Ok(())
    }
}

/// Row iteration respecting an optional selection mask.
#[derive(Clone, Copy)]
struct RowSelection<'a> {
    filter: Option<&'a BooleanArray>,
}

impl<'a> RowSelection<'a> {
    fn iter(&self, len: usize) -> impl Iterator<Item = usize> + 'a {
        let filter = self.filter;
        (0..len).filter(move |&row| match filter {
            None => true,
            Some(f) => f.is_valid(row) && f.value(row),
        })
    }
}

/// APPROX_PERCENTILE aggregate function descriptor.
///
/// Resolved once per query from the argument types; hands out one
/// monomorphic accumulator per input kind, so there is no type dispatch on
/// the per-row path.
#[derive(Debug, Clone)]
pub struct ApproxPercentile {
    input_type: DataType,
    has_weight: bool,
    has_accuracy: bool,
    percentile_is_array: bool,
    options: QueryOptions,
}

impl ApproxPercentile {
    /// Resolves the aggregate against the argument types of a call site.
    ///
    /// Argument shape errors are planning errors naming the aggregate.
    pub fn try_new(arg_types: &[DataType], options: QueryOptions) -> Result<Self> {
        if arg_types.len() < 2 || arg_types.len() > 4 {
            return plan_err!(
                "Wrong number of arguments passed to {APPROX_PERCENTILE}: \
                 expected 2 to 4, got {}",
                arg_types.len()
            );
        }
        let input_type = arg_types[0].clone();
        if !is_supported_input_type(&input_type) {
            return plan_err!(
                "Unsupported input type for {APPROX_PERCENTILE} aggregation: \
                 {input_type}"
            );
        }

        let has_weight = arg_types.len() >= 2 && arg_types[1] == DataType::Int64;
        let has_accuracy = arg_types.len() == if has_weight { 4 } else { 3 };
        let expected = 2 + usize::from(has_weight) + usize::from(has_accuracy);
        if arg_types.len() != expected {
            return plan_err!(
                "Wrong number of arguments passed to {APPROX_PERCENTILE}"
            );
        }
        if has_accuracy && arg_types[arg_types.len() - 1] != DataType::Float64 {
            return plan_err!(
                "The type of the accuracy argument of {APPROX_PERCENTILE} must be \
                 DOUBLE"
            );
        }

        let percentile_type = &arg_types[arg_types.len() - 1 - usize::from(has_accuracy)];
        let percentile_is_array = match percentile_type {
            DataType::Float64 => false,
            DataType::List(field) if field.data_type() == &DataType::Float64 => true,
            _ => {
                return plan_err!(
                    "The type of the percentile argument of {APPROX_PERCENTILE} \
                     must be DOUBLE or ARRAY(DOUBLE)"
                )
            }
        };

        debug!(
            "resolved {APPROX_PERCENTILE}(input={input_type}, weight={has_weight}, \
             accuracy={has_accuracy}, array={percentile_is_array})"
        );
        Ok(Self {
            input_type,
            has_weight,
            has_accuracy,
            percentile_is_array,
            options,
        })
    }

    /// The name of this aggregate function.
    pub fn name(&self) -> &str {
        APPROX_PERCENTILE
    }

    /// The input value type.
    pub fn input_type(&self) -> &DataType {
        &self.input_type
    }

    /// The result type: the input type, or a list of it when the
    /// percentile argument is an array.
    pub fn return_type(&self) -> DataType {
        if self.percentile_is_array {
            DataType::List(Arc::new(Field::new("item", self.input_type.clone(), true)))
        } else {
            self.input_type.clone()
        }
    }

    /// The fields of the intermediate ROW state.
    pub fn state_fields(&self) -> Fields {
        state_fields(&self.input_type)
    }

    /// The intermediate state type, identical across all signatures for a
    /// given input type.
    pub fn state_type(&self) -> DataType {
        DataType::Struct(self.state_fields())
    }

    /// The single intermediate state column exposed to the plan.
    pub fn state_field(&self) -> Field {
        Field::new(
            format_state_name(APPROX_PERCENTILE, "kll"),
            self.state_type(),
            true,
        )
    }

    /// Creates the single-group accumulator used by global aggregations.
    pub fn create_accumulator(&self) -> Result<Box<dyn Accumulator>> {
        match &self.input_type {
            DataType::Int8 => Ok(Box::new(
                ApproxPercentileAccumulator::<Int8Type>::new(self.clone()),
            )),
            DataType::Int16 => Ok(Box::new(
                ApproxPercentileAccumulator::<Int16Type>::new(self.clone()),
            )),
            DataType::Int32 => Ok(Box::new(
                ApproxPercentileAccumulator::<Int32Type>::new(self.clone()),
            )),
            DataType::Int64 => Ok(Box::new(
                ApproxPercentileAccumulator::<Int64Type>::new(self.clone()),
            )),
            DataType::Float32 => Ok(Box::new(
                ApproxPercentileAccumulator::<Float32Type>::new(self.clone()),
            )),
            DataType::Float64 => Ok(Box::new(
                ApproxPercentileAccumulator::<Float64Type>::new(self.clone()),
            )),
            other => not_impl_err!(
                "Support for {APPROX_PERCENTILE} over {other} is not implemented"
            ),
        }
    }

    /// Creates the vectorized accumulator managing all groups of a grouped
    /// aggregation, with its state accounted against `pool`.
    pub fn create_groups_accumulator(
        &self,
        pool: &Arc<dyn MemoryPool>,
    ) -> Result<Box<dyn GroupsAccumulator>> {
        match &self.input_type {
            DataType::Int8 => Ok(Box::new(
                ApproxPercentileGroupsAccumulator::<Int8Type>::new(self.clone(), pool),
            )),
            DataType::Int16 => Ok(Box::new(
                ApproxPercentileGroupsAccumulator::<Int16Type>::new(self.clone(), pool),
            )),
            DataType::Int32 => Ok(Box::new(
                ApproxPercentileGroupsAccumulator::<Int32Type>::new(self.clone(), pool),
            )),
            DataType::Int64 => Ok(Box::new(
                ApproxPercentileGroupsAccumulator::<Int64Type>::new(self.clone(), pool),
            )),
            DataType::Float32 => Ok(Box::new(
                ApproxPercentileGroupsAccumulator::<Float32Type>::new(self.clone(), pool),
            )),
            DataType::Float64 => Ok(Box::new(
                ApproxPercentileGroupsAccumulator::<Float64Type>::new(self.clone(), pool),
            )),
            other => not_impl_err!(
                "Support for {APPROX_PERCENTILE} over {other} is not implemented"
            ),
        }
    }
}

fn is_supported_input_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Float32
            | DataType::Float64
    )
}

fn state_fields(input_type: &DataType) -> Fields {
    Fields::from(vec![
        Field::new(
            "percentiles",
            DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
            true,
        ),
        Field::new("is_array", DataType::Boolean, true),
        Field::new("accuracy", DataType::Float64, true),
        Field::new("k", DataType::Int32, true),
        Field::new("n", DataType::Int64, true),
        Field::new("min_value", input_type.clone(), true),
        Field::new("max_value", input_type.clone(), true),
        Field::new(
            "items",
            DataType::List(Arc::new(Field::new("item", input_type.clone(), true))),
            true,
        ),
        Field::new(
            "levels",
            DataType::List(Arc::new(Field::new("item", DataType::Int32, true))),
            true,
        ),
    ])
}

/// Serializes one sketch per group into the intermediate ROW state.
///
/// The three header children (percentiles, is_array, accuracy) carry the
/// latched arguments on every row; a group whose sketch is empty becomes a
/// null row. When no percentile was ever latched (all input was null or
/// masked out) every row and every header child is null.
fn build_state<P>(
    args: &PercentileArguments,
    sketches: &[KllSketch<P::Native>],
) -> Result<ArrayRef>
where
    P: ArrowPrimitiveType,
    P::Native: SketchItem,
{
    let fields = state_fields(&P::DATA_TYPE);
    let num_rows = sketches.len();

    let Some(percentiles) = &args.percentiles else {
        let children: Vec<ArrayRef> = fields
            .iter()
            .map(|field| new_null_array(field.data_type(), num_rows))
            .collect();
        let nulls = NullBuffer::new_null(num_rows);
        return Ok(Arc::new(StructArray::try_new(fields, children, Some(nulls))?));
    };

    let mut percentile_values = Vec::with_capacity(percentiles.values.len() * num_rows);
    let mut percentile_offsets = Vec::with_capacity(num_rows + 1);
    percentile_offsets.push(0i32);
    for _ in 0..num_rows {
        percentile_values.extend_from_slice(&percentiles.values);
        percentile_offsets.push(percentile_values.len() as i32);
    }
    let percentiles_array: ArrayRef = Arc::new(ListArray::try_new(
        Arc::new(Field::new("item", DataType::Float64, true)),
        OffsetBuffer::new(ScalarBuffer::from(percentile_offsets)),
        Arc::new(Float64Array::from(percentile_values)),
        None,
    )?);
    let is_array_array: ArrayRef =
        Arc::new(BooleanArray::from(vec![percentiles.is_array; num_rows]));
    let accuracy_array: ArrayRef = match args.accuracy() {
        Some(accuracy) => Arc::new(Float64Array::from(vec![accuracy; num_rows])),
        None => new_null_array(&DataType::Float64, num_rows),
    };

    let mut validity = Vec::with_capacity(num_rows);
    let mut k_values = Vec::with_capacity(num_rows);
    let mut n_values = Vec::with_capacity(num_rows);
    let mut min_values = Vec::with_capacity(num_rows);
    let mut max_values = Vec::with_capacity(num_rows);
    let mut item_values: Vec<P::Native> = Vec::new();
    let mut item_offsets = vec![0i32];
    let mut level_values: Vec<i32> = Vec::new();
    let mut level_offsets = vec![0i32];

    for sketch in sketches {
        if sketch.is_empty() {
            validity.push(false);
            k_values.push(0);
            n_values.push(0);
            min_values.push(P::Native::default());
            max_values.push(P::Native::default());
        } else {
            validity.push(true);
            k_values.push(sketch.k() as i32);
            n_values.push(sketch.total_count() as i64);
            min_values.push(sketch.min_value().unwrap_or_default());
            max_values.push(sketch.max_value().unwrap_or_default());
            item_values.extend(sketch.items());
            level_values.extend(sketch.level_offsets());
        }
        item_offsets.push(item_values.len() as i32);
        level_offsets.push(level_values.len() as i32);
    }

    let items_array: ArrayRef = Arc::new(ListArray::try_new(
        Arc::new(Field::new("item", P::DATA_TYPE, true)),
        OffsetBuffer::new(ScalarBuffer::from(item_offsets)),
        Arc::new(PrimitiveArray::<P>::new(ScalarBuffer::from(item_values), None)),
        None,
    )?);
    let levels_array: ArrayRef = Arc::new(ListArray::try_new(
        Arc::new(Field::new("item", DataType::Int32, true)),
        OffsetBuffer::new(ScalarBuffer::from(level_offsets)),
        Arc::new(Int32Array::from(level_values)),
        None,
    )?);

    let children: Vec<ArrayRef> = vec![
        percentiles_array,
        is_array_array,
        accuracy_array,
        Arc::new(Int32Array::from(k_values)),
        Arc::new(Int64Array::from(n_values)),
        Arc::new(PrimitiveArray::<P>::new(ScalarBuffer::from(min_values), None)),
        Arc::new(PrimitiveArray::<P>::new(ScalarBuffer::from(max_values), None)),
        items_array,
        levels_array,
    ];
    let nulls = NullBuffer::from(validity);
    Ok(Arc::new(StructArray::try_new(fields, children, Some(nulls))?))
}

/// Flushes the given accumulators and emits their quantile estimates, one
/// row per group.
fn build_output<P>(
    args: &PercentileArguments,
    percentile_is_array: bool,
    accumulators: &mut [KllSketchAccumulator<P::Native>],
    fixed_random_seed: Option<u32>,
) -> Result<ArrayRef>
where
    P: ArrowPrimitiveType,
    P::Native: SketchItem,
{
    let num_rows = accumulators.len();
    for accumulator in accumulators.iter_mut() {
        accumulator.flush(fixed_random_seed);
    }

    let Some(percentiles) = &args.percentiles else {
        return Ok(new_null_array(&output_type::<P>(percentile_is_array), num_rows));
    };

    if percentile_is_array {
        let mut child: Vec<P::Native> = Vec::new();
        let mut offsets = Vec::with_capacity(num_rows + 1);
        offsets.push(0i32);
        let mut validity = Vec::with_capacity(num_rows);
        for accumulator in accumulators.iter() {
            if accumulator.sketch().is_empty() {
                validity.push(false);
            } else {
                validity.push(true);
                child.extend(accumulator.sketch().estimate_quantiles(&percentiles.values));
            }
            offsets.push(child.len() as i32);
        }
        Ok(Arc::new(ListArray::try_new(
            Arc::new(Field::new("item", P::DATA_TYPE, true)),
            OffsetBuffer::new(ScalarBuffer::from(offsets)),
            Arc::new(PrimitiveArray::<P>::new(ScalarBuffer::from(child), None)),
            Some(NullBuffer::from(validity)),
        )?))
    } else {
        debug_assert_eq!(percentiles.values.len(), 1);
        let rank = percentiles.values[percentiles.values.len() - 1];
        let mut values = Vec::with_capacity(num_rows);
        let mut validity = Vec::with_capacity(num_rows);
        for accumulator in accumulators.iter() {
            if accumulator.sketch().is_empty() {
                values.push(P::Native::default());
                validity.push(false);
            } else {
                values.push(accumulator.sketch().estimate_quantile(rank));
                validity.push(true);
            }
        }
        Ok(Arc::new(PrimitiveArray::<P>::new(
            ScalarBuffer::from(values),
            Some(NullBuffer::from(validity)),
        )))
    }
}

fn output_type<P: ArrowPrimitiveType>(percentile_is_array: bool) -> DataType {
    if percentile_is_array {
        DataType::List(Arc::new(Field::new("item", P::DATA_TYPE, true)))
    } else {
        P::DATA_TYPE
    }
}

/// Typed, borrowed access to the children of an intermediate state column.
///
/// Views built from a row alias the flat `items`/`levels` children; nothing
/// is copied before merging.
struct StateParts<'a, P: ArrowPrimitiveType>
where
    P::Native: SketchItem,
{
    struct_array: &'a StructArray,
    percentiles: &'a ListArray,
    percentile_values: &'a Float64Array,
    is_array: &'a BooleanArray,
    accuracy: &'a Float64Array,
    k: &'a Int32Array,
    n: &'a Int64Array,
    min_value: &'a PrimitiveArray<P>,
    max_value: &'a PrimitiveArray<P>,
    items: &'a ListArray,
    item_values: &'a PrimitiveArray<P>,
    levels: &'a ListArray,
    level_values: &'a Int32Array,
}

impl<'a, P> StateParts<'a, P>
where
    P: ArrowPrimitiveType,
    P::Native: SketchItem,
{
    fn try_new(state: &'a ArrayRef, strict: bool) -> Result<Self> {
        let Some(struct_array) = state.as_any().downcast_ref::<StructArray>() else {
            let message = format!(
                "{APPROX_PERCENTILE}: intermediate state must be a ROW, got {}",
                state.data_type()
            );
            return if strict {
                Err(crate::error::Error::Execution(message))
            } else {
                Err(crate::error::Error::Internal(message))
            };
        };
        if struct_array.num_columns() != NUM_STATE_CHILDREN {
            let message = format!(
                "{APPROX_PERCENTILE}: intermediate state must have \
                 {NUM_STATE_CHILDREN} children, got {}",
                struct_array.num_columns()
            );
            return if strict {
                Err(crate::error::Error::Execution(message))
            } else {
                Err(crate::error::Error::Internal(message))
            };
        }
        if strict {
            let expected = state_fields(&P::DATA_TYPE);
            for (index, field) in expected.iter().enumerate() {
                let actual = struct_array.column(index).data_type();
                if actual != field.data_type() {
                    return exec_err!(
                        "{APPROX_PERCENTILE}: intermediate state child {index} must \
                         be {}, got {actual}",
                        field.data_type()
                    );
                }
            }
        }

        let percentiles = downcast_value!(struct_array.column(PERCENTILES), ListArray);
        let percentile_values = downcast_value!(percentiles.values(), Float64Array);
        let items = downcast_value!(struct_array.column(ITEMS), ListArray);
        let item_values = downcast_value!(items.values(), PrimitiveArray<P>);
        let levels = downcast_value!(struct_array.column(LEVELS), ListArray);
        let level_values = downcast_value!(levels.values(), Int32Array);
        Ok(Self {
            struct_array,
            percentiles,
            percentile_values,
            is_array: downcast_value!(
                struct_array.column(PERCENTILES_IS_ARRAY),
                BooleanArray
            ),
            accuracy: downcast_value!(struct_array.column(ACCURACY), Float64Array),
            k: downcast_value!(struct_array.column(K), Int32Array),
            n: downcast_value!(struct_array.column(N), Int64Array),
            min_value: downcast_value!(
                struct_array.column(MIN_VALUE),
                PrimitiveArray<P>
            ),
            max_value: downcast_value!(
                struct_array.column(MAX_VALUE),
                PrimitiveArray<P>
            ),
            items,
            item_values,
            levels,
            level_values,
        })
    }

    fn len(&self) -> usize {
        self.struct_array.len()
    }

    /// An all-null row carries no sketch and is skipped by the merge.
    fn is_null_row(&self, row: usize) -> bool {
        self.struct_array.is_null(row) || self.is_array.is_null(row)
    }

    /// Latches percentiles and accuracy from the header of the first
    /// non-null row of a batch.
    fn latch_first(
        &self,
        rows: &RowSelection<'_>,
        strict: bool,
        args: &mut PercentileArguments,
    ) -> Result<()> {
        for row in rows.iter(self.len()) {
            if self.is_null_row(row) {
                continue;
            }
            if self.percentiles.is_null(row) {
                return exec_err!("{APPROX_PERCENTILE}: percentile cannot be null");
            }
            let offsets = self.percentiles.value_offsets();
            let start = offsets[row] as usize;
            let end = offsets[row + 1] as usize;
            if strict {
                for index in start..end {
                    if self.percentile_values.is_null(index) {
                        return exec_err!(
                            "{APPROX_PERCENTILE}: percentile cannot be null"
                        );
                    }
                }
            }
            args.check_set_percentile(
                &self.percentile_values.values()[start..end],
                self.is_array.value(row),
            )?;
            if !self.accuracy.is_null(row) {
                args.check_set_accuracy(self.accuracy.value(row))?;
            }
            return Ok(());
        }
        Ok(())
    }

    /// Checks the sketch children of one row for nulls (strict mode).
    fn check_row_fields(&self, row: usize) -> Result<()> {
        if self.k.is_null(row)
            || self.n.is_null(row)
            || self.min_value.is_null(row)
            || self.max_value.is_null(row)
            || self.items.is_null(row)
            || self.levels.is_null(row)
        {
            return exec_err!(
                "{APPROX_PERCENTILE}: null sketch field in intermediate state"
            );
        }
        Ok(())
    }

    /// Builds a borrowed sketch view over the flat children of `row`.
    fn view(&self, row: usize) -> KllView<'a, P::Native> {
        let item_offsets = self.items.value_offsets();
        let level_offsets = self.levels.value_offsets();
        KllView {
            k: self.k.value(row) as u32,
            n: self.n.value(row) as u64,
            min_value: self.min_value.value(row),
            max_value: self.max_value.value(row),
            items: &self.item_values.values()
                [item_offsets[row] as usize..item_offsets[row + 1] as usize],
            levels: &self.level_values.values()
                [level_offsets[row] as usize..level_offsets[row + 1] as usize],
        }
    }
}

/// Single-group accumulator; drives one [`KllSketchAccumulator`].
#[derive(Debug)]
pub struct ApproxPercentileAccumulator<P: ArrowPrimitiveType>
where
    P::Native: SketchItem,
{
    function: ApproxPercentile,
    args: PercentileArguments,
    accumulator: KllSketchAccumulator<P::Native>,
}

impl<P> ApproxPercentileAccumulator<P>
where
    P: ArrowPrimitiveType,
    P::Native: SketchItem,
{
    pub fn new(function: ApproxPercentile) -> Self {
        let seed = function.options.approx_percentile_fixed_random_seed;
        Self {
            function,
            args: PercentileArguments::new(),
            accumulator: KllSketchAccumulator::new(seed),
        }
    }
}

impl<P> Accumulator for ApproxPercentileAccumulator<P>
where
    P: ArrowPrimitiveType + std::fmt::Debug,
    P::Native: SketchItem,
{
    fn update_batch(&mut self, values: &[ArrayRef]) -> Result<()> {
        let expected = 2
            + usize::from(self.function.has_weight)
            + usize::from(self.function.has_accuracy);
        if values.len() != expected {
            return internal_err!(
                "{APPROX_PERCENTILE}: expected {expected} argument columns, got {}",
                values.len()
            );
        }
        let rows = RowSelection { filter: None };
        let value_array = downcast_value!(&values[0], PrimitiveArray<P>);

        let mut index = 1;
        let weight_array = if self.function.has_weight {
            let array = downcast_value!(&values[index], Int64Array);
            index += 1;
            Some(array)
        } else {
            None
        };
        self.args
            .check_set_percentile_column(&values[index], &rows)?;
        index += 1;
        if self.function.has_accuracy {
            self.args
                .check_set_accuracy_column(&values[index], &rows)?;
        }

        // All validation precedes the first mutation so that a failed
        // batch leaves the accumulator untouched.
        if let Some(weights) = weight_array {
            for row in rows.iter(value_array.len()) {
                if value_array.is_null(row) || weights.is_null(row) {
                    continue;
                }
                check_weight(weights.value(row))?;
            }
        }

        let seed = self.function.options.approx_percentile_fixed_random_seed;
        if let Some(accuracy) = self.args.accuracy() {
            self.accumulator.set_accuracy(accuracy);
        }
        match weight_array {
            Some(weights) => {
                for row in rows.iter(value_array.len()) {
                    if value_array.is_null(row) || weights.is_null(row) {
                        continue;
                    }
                    self.accumulator.append_count(
                        value_array.value(row),
                        weights.value(row),
                        seed,
                    );
                }
            }
            None => {
                for row in rows.iter(value_array.len()) {
                    if value_array.is_null(row) {
                        continue;
                    }
                    self.accumulator.append(value_array.value(row));
                }
            }
        }
        Ok(())
    }

    fn merge_batch(&mut self, states: &[ArrayRef]) -> Result<()> {
        if states.len() != 1 {
            return internal_err!(
                "{APPROX_PERCENTILE}: expected one intermediate state column, got {}",
                states.len()
            );
        }
        let strict = self.function.options.validate_intermediate_inputs;
        let parts = StateParts::<P>::try_new(&states[0], strict)?;
        let rows = RowSelection { filter: None };

        parts.latch_first(&rows, strict, &mut self.args)?;
        let mut views = Vec::with_capacity(parts.len());
        for row in rows.iter(parts.len()) {
            if parts.is_null_row(row) {
                continue;
            }
            if strict {
                parts.check_row_fields(row)?;
            }
            let view = parts.view(row);
            if strict {
                view.validate()?;
            }
            views.push(view);
        }
        if !views.is_empty() {
            if let Some(accuracy) = self.args.accuracy() {
                self.accumulator.set_accuracy(accuracy);
            }
            self.accumulator.append_views(&views);
        }
        Ok(())
    }

    fn state(&mut self) -> Result<Vec<ArrayRef>> {
        let seed = self.function.options.approx_percentile_fixed_random_seed;
        let sketch = self.accumulator.compact(seed);
        Ok(vec![build_state::<P>(&self.args, &[sketch])?])
    }

    fn evaluate(&mut self) -> Result<ArrayRef> {
        let seed = self.function.options.approx_percentile_fixed_random_seed;
        build_output::<P>(
            &self.args,
            self.function.percentile_is_array,
            std::slice::from_mut(&mut self.accumulator),
            seed,
        )
    }

    fn size(&self) -> usize {
        size_of::<Self>() + self.accumulator.size()
            - size_of::<KllSketchAccumulator<P::Native>>()
    }
}

/// Vectorized accumulator holding the state of every group.
///
/// Group accumulators are constructed in place as the operator allocates
/// new groups; their memory is accounted against the operator's
/// reservation after every mutating batch and released when the groups are
/// emitted or the accumulator is dropped.
pub struct ApproxPercentileGroupsAccumulator<P: ArrowPrimitiveType>
where
    P::Native: SketchItem,
{
    function: ApproxPercentile,
    args: PercentileArguments,
    accumulators: Vec<KllSketchAccumulator<P::Native>>,
    reservation: MemoryReservation,
}

impl<P> ApproxPercentileGroupsAccumulator<P>
where
    P: ArrowPrimitiveType,
    P::Native: SketchItem,
{
    pub fn new(function: ApproxPercentile, pool: &Arc<dyn MemoryPool>) -> Self {
        let reservation =
            MemoryConsumer::new(format_state_name(APPROX_PERCENTILE, "groups"))
                .register(pool);
        Self {
            function,
            args: PercentileArguments::new(),
            accumulators: Vec::new(),
            reservation,
        }
    }

    fn ensure_groups(&mut self, total_num_groups: usize) {
        if total_num_groups > self.accumulators.len() {
            let seed = self.function.options.approx_percentile_fixed_random_seed;
            self.accumulators
                .resize_with(total_num_groups, || KllSketchAccumulator::new(seed));
        }
    }

    fn update_reservation(&mut self) -> Result<()> {
        let size = self.size();
        self.reservation.try_resize(size)
    }
}

impl<P> GroupsAccumulator for ApproxPercentileGroupsAccumulator<P>
where
    P: ArrowPrimitiveType,
    P::Native: SketchItem,
{
    fn update_batch(
        &mut self,
        values: &[ArrayRef],
        group_indices: &[usize],
        opt_filter: Option<&BooleanArray>,
        total_num_groups: usize,
    ) -> Result<()> {
        let expected = 2
            + usize::from(self.function.has_weight)
            + usize::from(self.function.has_accuracy);
        if values.len() != expected {
            return internal_err!(
                "{APPROX_PERCENTILE}: expected {expected} argument columns, got {}",
                values.len()
            );
        }
        self.ensure_groups(total_num_groups);
        let rows = RowSelection { filter: opt_filter };
        let value_array = downcast_value!(&values[0], PrimitiveArray<P>);
        debug_assert_eq!(group_indices.len(), value_array.len());

        let mut index = 1;
        let weight_array = if self.function.has_weight {
            let array = downcast_value!(&values[index], Int64Array);
            index += 1;
            Some(array)
        } else {
            None
        };
        self.args
            .check_set_percentile_column(&values[index], &rows)?;
        index += 1;
        if self.function.has_accuracy {
            self.args
                .check_set_accuracy_column(&values[index], &rows)?;
        }
        if let Some(weights) = weight_array {
            for row in rows.iter(value_array.len()) {
                if value_array.is_null(row) || weights.is_null(row) {
                    continue;
                }
                check_weight(weights.value(row))?;
            }
        }

        let seed = self.function.options.approx_percentile_fixed_random_seed;
        let accuracy = self.args.accuracy();
        match weight_array {
            Some(weights) => {
                for row in rows.iter(value_array.len()) {
                    if value_array.is_null(row) || weights.is_null(row) {
                        continue;
                    }
                    let accumulator = &mut self.accumulators[group_indices[row]];
                    if let Some(accuracy) = accuracy {
                        accumulator.set_accuracy(accuracy);
                    }
                    accumulator.append_count(
                        value_array.value(row),
                        weights.value(row),
                        seed,
                    );
                }
            }
            None => {
                for row in rows.iter(value_array.len()) {
                    if value_array.is_null(row) {
                        continue;
                    }
                    let accumulator = &mut self.accumulators[group_indices[row]];
                    if let Some(accuracy) = accuracy {
                        accumulator.set_accuracy(accuracy);
                    }
                    accumulator.append(value_array.value(row));
                }
            }
        }
        self.update_reservation()
    }

    fn merge_batch(
        &mut self,
        values: &[ArrayRef],
        group_indices: &[usize],
        opt_filter: Option<&BooleanArray>,
        total_num_groups: usize,
    ) -> Result<()> {
        if values.len() != 1 {
            return internal_err!(
                "{APPROX_PERCENTILE}: expected one intermediate state column, got {}",
                values.len()
            );
        }
        self.ensure_groups(total_num_groups);
        let strict = self.function.options.validate_intermediate_inputs;
        let parts = StateParts::<P>::try_new(&values[0], strict)?;
        debug_assert_eq!(group_indices.len(), parts.len());
        let rows = RowSelection { filter: opt_filter };

        parts.latch_first(&rows, strict, &mut self.args)?;
        // All rows are validated before the first merge so that a failed
        // batch leaves every group untouched.
        let mut merges = Vec::with_capacity(parts.len());
        for row in rows.iter(parts.len()) {
            if parts.is_null_row(row) {
                continue;
            }
            if strict {
                parts.check_row_fields(row)?;
            }
            let view = parts.view(row);
            if strict {
                view.validate()?;
            }
            merges.push((group_indices[row], view));
        }

        let accuracy = self.args.accuracy();
        for (group_index, view) in merges {
            let accumulator = &mut self.accumulators[group_index];
            if let Some(accuracy) = accuracy {
                accumulator.set_accuracy(accuracy);
            }
            accumulator.append_view(&view);
        }
        self.update_reservation()
    }

    fn state(&mut self, emit_to: EmitTo) -> Result<Vec<ArrayRef>> {
        let seed = self.function.options.approx_percentile_fixed_random_seed;
        let emitted = emit_to.take_needed(&mut self.accumulators);
        let sketches: Vec<KllSketch<P::Native>> = emitted
            .iter()
            .map(|accumulator| accumulator.compact(seed))
            .collect();
        let state = build_state::<P>(&self.args, &sketches)?;
        self.update_reservation()?;
        Ok(vec![state])
    }

    fn evaluate(&mut self, emit_to: EmitTo) -> Result<ArrayRef> {
        let seed = self.function.options.approx_percentile_fixed_random_seed;
        let mut emitted = emit_to.take_needed(&mut self.accumulators);
        let output = build_output::<P>(
            &self.args,
            self.function.percentile_is_array,
            &mut emitted,
            seed,
        )?;
        self.update_reservation()?;
        Ok(output)
    }

    fn size(&self) -> usize {
        size_of::<Self>()
            + self.accumulators.capacity()
                * size_of::<KllSketchAccumulator<P::Native>>()
            + self
                .accumulators
                .iter()
                .map(|accumulator| {
                    accumulator.size() - size_of::<KllSketchAccumulator<P::Native>>()
                })
                .sum::<usize>()
    }
}

impl<P> Debug for ApproxPercentileGroupsAccumulator<P>
where
    P: ArrowPrimitiveType,
    P::Native: SketchItem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApproxPercentileGroupsAccumulator")
            .field("function", &self.function)
            .field("num_groups", &self.accumulators.len())
            .finish()
    }
}
