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

//! Approximate percentile aggregation over Apache Arrow columnar batches.
//!
//! This crate implements the `approx_percentile` aggregate function:
//! given a stream of numeric values, optionally weighted, it estimates one
//! or more requested quantiles within a configurable accuracy bound using
//! a [KLL sketch](crate::kll). The aggregate is built for a vectorized
//! group-by execution framework:
//!
//! * input arrives as columnar batches fanned out over many groups at
//!   once ([`GroupsAccumulator`]), or as whole batches for a global
//!   aggregation ([`Accumulator`]);
//! * aggregation is distributable over three phases — partial sketches
//!   are serialized into a ROW-typed intermediate column
//!   ([`GroupsAccumulator::state`]), merged associatively on another node
//!   ([`GroupsAccumulator::merge_batch`]) and finalized into quantile
//!   values ([`GroupsAccumulator::evaluate`]);
//! * group state is owned by the operator and accounted against a
//!   session [`MemoryPool`](memory_pool::MemoryPool), while sketch copies
//!   produced for serialization are independent and may cross threads.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use approx_percentile::{Accumulator, ApproxPercentile, QueryOptions};
//! use arrow::array::{Array, ArrayRef, Float64Array, Int64Array};
//! use arrow::datatypes::DataType;
//!
//! # fn main() -> approx_percentile::Result<()> {
//! // approx_percentile(value Int64, percentile Double) -> Int64
//! let function = ApproxPercentile::try_new(
//!     &[DataType::Int64, DataType::Float64],
//!     QueryOptions::default().with_fixed_random_seed(42),
//! )?;
//!
//! let mut accumulator = function.create_accumulator()?;
//! let values: ArrayRef = Arc::new(Int64Array::from_iter_values(1..=10_000));
//! let percentile: ArrayRef = Arc::new(Float64Array::from(vec![0.5; 10_000]));
//! accumulator.update_batch(&[values, percentile])?;
//!
//! let median = accumulator.evaluate()?;
//! assert_eq!(median.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod error;
pub mod kll;
pub mod memory_pool;

pub use aggregate::{
    format_state_name, Accumulator, ApproxPercentile, ApproxPercentileAccumulator,
    ApproxPercentileGroupsAccumulator, EmitTo, GroupsAccumulator, APPROX_PERCENTILE,
};
pub use config::QueryOptions;
pub use error::{Error, Result};
pub use kll::{KllSketch, KllView, SketchItem};
