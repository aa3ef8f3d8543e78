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

//! Runtime options consulted when building accumulators.

/// Query-level configuration for the approximate percentile aggregate.
///
/// These map one-to-one onto session configuration keys of the embedding
/// engine and are latched when the aggregate is resolved; they do not change
/// for the lifetime of an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Seed for every sketch PRNG, exposed as the
    /// `debug_aggregation_approx_percentile_fixed_random_seed` session key.
    ///
    /// When set, two runs over the same input in the same order produce
    /// bit-identical results. When unset each sketch draws a fresh seed and
    /// results are approximate but not reproducible.
    pub approx_percentile_fixed_random_seed: Option<u32>,

    /// Validate the structure of intermediate (merge phase) inputs.
    ///
    /// When true, malformed intermediate rows fail the batch with an
    /// execution error. When false only cheap debug assertions fire;
    /// intermediate rows are trusted, which is the production default since
    /// they are produced by the partial phase of the same query.
    pub validate_intermediate_inputs: bool,
}

impl QueryOptions {
    /// Returns options with the sketch PRNG seed pinned to `seed`.
    pub fn with_fixed_random_seed(mut self, seed: u32) -> Self {
        self.approx_percentile_fixed_random_seed = Some(seed);
        self
    }

    /// Returns options with strict intermediate input validation enabled.
    pub fn with_validate_intermediate_inputs(mut self, validate: bool) -> Self {
        self.validate_intermediate_inputs = validate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = QueryOptions::default();
        assert_eq!(options.approx_percentile_fixed_random_seed, None);
        assert!(!options.validate_intermediate_inputs);
    }

    #[test]
    fn builders() {
        let options = QueryOptions::default()
            .with_fixed_random_seed(42)
            .with_validate_intermediate_inputs(true);
        assert_eq!(options.approx_percentile_fixed_random_seed, Some(42));
        assert!(options.validate_intermediate_inputs);
    }
}
