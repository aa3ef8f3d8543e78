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

//! [`MemoryPool`] for accounting the session-scoped memory held by
//! accumulators.
//!
//! An aggregation operator's group state grows with the number of groups,
//! so the multi-group accumulator registers a [`MemoryConsumer`] against the
//! session's pool and resizes its [`MemoryReservation`] after every mutating
//! batch. The pool bounds the in-flight sketches and large-weight buffers
//! for the lifetime of the query.
//!
//! Sketch copies produced for serialization
//! ([`compact`](crate::aggregate::GroupsAccumulator::state) output) are
//! deliberately *not* registered here: they are independent allocations that
//! may be handed to another thread (e.g. a spill writer) after return, while
//! the reservation stays owned by the operator thread.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};

/// Tracks and potentially limits memory use across operators of a session.
///
/// Implementations must be cheap to call: `try_grow` sits on the
/// per-batch path of every registered operator.
pub trait MemoryPool: Send + Sync + Debug {
    /// Registers a new [`MemoryConsumer`].
    ///
    /// Subsequent calls to [`Self::grow`] must be made to reserve memory.
    fn register(&self, _consumer: &MemoryConsumer) {}

    /// Records the destruction of a [`MemoryReservation`].
    ///
    /// Prior calls to [`Self::shrink`] must be made to free any reserved
    /// memory.
    fn unregister(&self, _consumer: &MemoryConsumer) {}

    /// Infallibly grow the provided `reservation` by `additional` bytes.
    fn grow(&self, reservation: &MemoryReservation, additional: usize);

    /// Infallibly shrink the provided `reservation` by `shrink` bytes.
    fn shrink(&self, reservation: &MemoryReservation, shrink: usize);

    /// Attempt to grow the provided `reservation` by `additional` bytes.
    ///
    /// On error the reservation is not increased in size.
    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()>;

    /// Returns the total amount of memory reserved.
    fn reserved(&self) -> usize;
}

/// A [`MemoryPool`] that enforces no limit.
#[derive(Debug, Default)]
pub struct UnboundedMemoryPool {
    used: AtomicUsize,
}

impl MemoryPool for UnboundedMemoryPool {
    fn grow(&self, _reservation: &MemoryReservation, additional: usize) {
        self.used.fetch_add(additional, Ordering::Relaxed);
    }

    fn shrink(&self, _reservation: &MemoryReservation, shrink: usize) {
        self.used.fetch_sub(shrink, Ordering::Relaxed);
    }

    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()> {
        self.grow(reservation, additional);
        Ok(())
    }

    fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

/// A [`MemoryPool`] that implements a greedy first-come first-serve limit.
#[derive(Debug)]
pub struct GreedyMemoryPool {
    pool_size: usize,
    used: AtomicUsize,
}

impl GreedyMemoryPool {
    /// Create a new pool that can allocate up to `pool_size` bytes.
    pub fn new(pool_size: usize) -> Self {
        debug!("Created new GreedyMemoryPool(pool_size={pool_size})");
        Self {
            pool_size,
            used: AtomicUsize::new(0),
        }
    }
}

impl MemoryPool for GreedyMemoryPool {
    fn grow(&self, _reservation: &MemoryReservation, additional: usize) {
        self.used.fetch_add(additional, Ordering::Relaxed);
    }

    fn shrink(&self, _reservation: &MemoryReservation, shrink: usize) {
        self.used.fetch_sub(shrink, Ordering::Relaxed);
    }

    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()> {
        self.used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                let new_used = used + additional;
                (new_used <= self.pool_size).then_some(new_used)
            })
            .map_err(|used| {
                insufficient_capacity_err(
                    reservation,
                    additional,
                    self.pool_size.saturating_sub(used),
                )
            })?;
        Ok(())
    }

    fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

fn insufficient_capacity_err(
    reservation: &MemoryReservation,
    additional: usize,
    available: usize,
) -> Error {
    Error::ResourcesExhausted(format!(
        "Failed to allocate additional {} bytes for {} with {} bytes already \
         allocated - maximum available is {}",
        additional,
        reservation.consumer().name(),
        reservation.size(),
        available
    ))
}

/// A named allocation traced by a particular [`MemoryReservation`] in a
/// [`MemoryPool`]. All reservations are registered to a `MemoryConsumer`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemoryConsumer {
    name: String,
}

impl MemoryConsumer {
    /// Create a new empty [`MemoryConsumer`] that can be grown using a
    /// [`MemoryReservation`].
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the name associated with this allocation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers this [`MemoryConsumer`] with the provided [`MemoryPool`],
    /// returning a [`MemoryReservation`] that can be grown or shrunk.
    pub fn register(self, pool: &Arc<dyn MemoryPool>) -> MemoryReservation {
        pool.register(&self);
        MemoryReservation {
            consumer: self,
            pool: Arc::clone(pool),
            size: 0,
        }
    }
}

/// A [`MemoryReservation`] tracks an individual reservation of a number of
/// bytes of memory in a [`MemoryPool`] that is freed back to the pool on
/// drop.
///
/// The reservation can be grown or shrunk over time.
#[derive(Debug)]
pub struct MemoryReservation {
    consumer: MemoryConsumer,
    pool: Arc<dyn MemoryPool>,
    size: usize,
}

impl MemoryReservation {
    /// Returns the size of this reservation in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the [`MemoryConsumer`] for this reservation.
    pub fn consumer(&self) -> &MemoryConsumer {
        &self.consumer
    }

    /// Frees all bytes from this reservation back to the underlying pool,
    /// returning the number of bytes freed.
    pub fn free(&mut self) -> usize {
        let size = self.size;
        if size != 0 {
            self.shrink(size)
        }
        size
    }

    /// Frees `capacity` bytes from this reservation back to the underlying
    /// pool.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds the reserved size.
    pub fn shrink(&mut self, capacity: usize) {
        let new_size = self.size.checked_sub(capacity).unwrap();
        self.pool.shrink(self, capacity);
        self.size = new_size
    }

    /// Sets the size of this reservation to `capacity`.
    pub fn resize(&mut self, capacity: usize) {
        match capacity.cmp(&self.size) {
            std::cmp::Ordering::Greater => self.grow(capacity - self.size),
            std::cmp::Ordering::Less => self.shrink(self.size - capacity),
            _ => {}
        }
    }

    /// Try to set the size of this reservation to `capacity`.
    pub fn try_resize(&mut self, capacity: usize) -> Result<()> {
        match capacity.cmp(&self.size) {
            std::cmp::Ordering::Greater => self.try_grow(capacity - self.size)?,
            std::cmp::Ordering::Less => self.shrink(self.size - capacity),
            _ => {}
        };
        Ok(())
    }

    /// Increase the size of this reservation by `capacity` bytes.
    pub fn grow(&mut self, capacity: usize) {
        self.pool.grow(self, capacity);
        self.size += capacity;
    }

    /// Try to increase the size of this reservation by `capacity` bytes,
    /// returning an error if there is insufficient capacity left in the
    /// pool.
    pub fn try_grow(&mut self, capacity: usize) -> Result<()> {
        self.pool.try_grow(self, capacity)?;
        self.size += capacity;
        Ok(())
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
        self.pool.unregister(&self.consumer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_pool_grows_forever() {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let mut reservation = MemoryConsumer::new("test").register(&pool);
        reservation.try_grow(usize::MAX / 2).unwrap();
        assert_eq!(pool.reserved(), usize::MAX / 2);
    }

    #[test]
    fn greedy_pool_limits() {
        let pool: Arc<dyn MemoryPool> = Arc::new(GreedyMemoryPool::new(100));
        let mut r1 = MemoryConsumer::new("r1").register(&pool);
        r1.try_grow(60).unwrap();
        assert_eq!(pool.reserved(), 60);

        let mut r2 = MemoryConsumer::new("r2").register(&pool);
        let err = r2.try_grow(50).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Resources exhausted: Failed to allocate additional 50 bytes for \
             r2 with 0 bytes already allocated - maximum available is 40"
        );

        r1.shrink(20);
        r2.try_grow(50).unwrap();
        assert_eq!(pool.reserved(), 90);
    }

    #[test]
    fn reservation_frees_on_drop() {
        let pool: Arc<dyn MemoryPool> = Arc::new(GreedyMemoryPool::new(100));
        {
            let mut reservation = MemoryConsumer::new("scoped").register(&pool);
            reservation.try_grow(70).unwrap();
            assert_eq!(pool.reserved(), 70);
        }
        assert_eq!(pool.reserved(), 0);
    }

    #[test]
    fn resize_tracks_target() {
        let pool: Arc<dyn MemoryPool> = Arc::new(UnboundedMemoryPool::default());
        let mut reservation = MemoryConsumer::new("resize").register(&pool);
        reservation.try_resize(100).unwrap();
        reservation.try_resize(40).unwrap();
        assert_eq!(reservation.size(), 40);
        assert_eq!(pool.reserved(), 40);
    }
}
