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

use criterion::{criterion_group, criterion_main, Criterion};

use approx_percentile::kll::{KllSketch, DEFAULT_K};

fn bench_insert(c: &mut Criterion) {
    c.bench_function("kll_insert_100k", |b| {
        b.iter(|| {
            let mut sketch = KllSketch::new(DEFAULT_K, 42);
            for value in 0..100_000i64 {
                sketch.insert(value);
            }
            sketch
        })
    });
}

fn bench_estimate(c: &mut Criterion) {
    let mut sketch = KllSketch::new(DEFAULT_K, 42);
    for value in 0..100_000i64 {
        sketch.insert(value);
    }
    sketch.finish();
    let ranks = [0.01, 0.25, 0.5, 0.75, 0.99];

    c.bench_function("kll_estimate_quantiles", |b| {
        b.iter(|| sketch.estimate_quantiles(&ranks))
    });
}

fn bench_merge(c: &mut Criterion) {
    let mut left = KllSketch::new(DEFAULT_K, 42);
    let mut right = KllSketch::new(DEFAULT_K, 43);
    for value in 0..50_000i64 {
        left.insert(value);
        right.insert(value + 50_000);
    }

    c.bench_function("kll_merge_50k_each", |b| {
        b.iter(|| {
            let mut target = KllSketch::new(DEFAULT_K, 44);
            target.merge(&left);
            target.merge(&right);
            target
        })
    });
}

criterion_group!(benches, bench_insert, bench_estimate, bench_merge);
criterion_main!(benches);
