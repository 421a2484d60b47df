//! # Sample Buffers - Per-Metric Sampling Windows
//!
//! Fixed-capacity numeric buffers backing every metric the sampler
//! collects, plus the concurrent maps that key them by target identity.
//!
//! ## Core Capabilities
//!
//! - **Two growth modes**: non-circular buffers append past capacity
//!   (a sampling pass is bounded by wall time, not sample count), while
//!   circular buffers overwrite the oldest value once full.
//! - **Aggregates**: average, maximum, minimum, and count over the current
//!   window; averages are only meaningful for non-empty buffers.
//! - **Hysteresis support**: a sticky `active_error_or_warning` flag set by
//!   the evaluator survives per-pass clearing, so a buffer that produced a
//!   Warning or Error is retained across passes until the signal clears.
//!
//! ## Concurrency
//!
//! Buffers are owned by [`MetricMap`] entries (a `DashMap` keyed by
//! target/child id). Parallel target workers insert and append through the
//! map's entry locks; there are no cross-map invariants.

use dashmap::DashMap;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Numeric bound for sample values.
///
/// Every metric the agent collects is either an integer count (ports,
/// handles, threads) or a float rate (CPU percent, megabytes); both reduce
/// to `f64` for aggregation and threshold comparison.
pub trait MetricValue:
    Copy + PartialOrd + Default + ToPrimitive + Send + Sync + 'static
{
}

impl<T> MetricValue for T where
    T: Copy + PartialOrd + Default + ToPrimitive + Send + Sync + 'static
{
}

/// Fixed-capacity sampling window for one (target, metric) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleBuffer<T> {
    /// Nominal capacity. In circular mode this is a hard bound; otherwise
    /// it only sizes the initial allocation.
    capacity: usize,
    /// Oldest-overwrite mode.
    circular: bool,
    /// Samples in wall-clock append order.
    data: VecDeque<T>,
    /// Sticky flag set by the evaluator when the last pass ended in a
    /// Warning or Error for this buffer. Survives [`SampleBuffer::clear`].
    active_error_or_warning: bool,
}

impl<T: MetricValue> SampleBuffer<T> {
    /// Create a non-circular buffer. Appends past `capacity` are allowed;
    /// the pass boundary, not the count, bounds the window.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            circular: false,
            data: VecDeque::with_capacity(capacity),
            active_error_or_warning: false,
        }
    }

    /// Create a circular buffer: once full, each append drops the oldest
    /// sample.
    pub fn circular(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            circular: true,
            data: VecDeque::with_capacity(capacity.max(1)),
            active_error_or_warning: false,
        }
    }

    /// Append a sample.
    pub fn add(&mut self, value: T) {
        if self.circular && self.data.len() >= self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(value);
    }

    /// Drop all samples. The sticky warning/error flag is preserved so the
    /// evaluator can retire the signal on a later pass.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Number of samples currently held.
    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Average over the current window, or `0.0` when empty. Callers that
    /// must distinguish "no data" check [`SampleBuffer::is_empty`] first.
    pub fn avg(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .data
            .iter()
            .filter_map(|v| v.to_f64())
            .sum();
        sum / self.data.len() as f64
    }

    /// Largest sample in the window, if any.
    pub fn max(&self) -> Option<T> {
        self.data
            .iter()
            .copied()
            .fold(None, |acc, v| match acc {
                None => Some(v),
                Some(m) if v > m => Some(v),
                Some(m) => Some(m),
            })
    }

    /// Smallest sample in the window, if any.
    pub fn min(&self) -> Option<T> {
        self.data
            .iter()
            .copied()
            .fold(None, |acc, v| match acc {
                None => Some(v),
                Some(m) if v < m => Some(v),
                Some(m) => Some(m),
            })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_circular(&self) -> bool {
        self.circular
    }

    /// Sticky hysteresis flag. A buffer with this flag set is retained in
    /// the metric map at pass end instead of being garbage collected.
    pub fn active_error_or_warning(&self) -> bool {
        self.active_error_or_warning
    }

    pub fn set_active_error_or_warning(&mut self, active: bool) {
        self.active_error_or_warning = active;
    }
}

/// Concurrent map of sampling windows keyed by target or child id.
///
/// One map exists per metric kind actually enabled for at least one target;
/// parallel sampling workers share it through entry-level locking.
pub type MetricMap = DashMap<String, SampleBuffer<f64>>;

/// Clear an existing buffer for `id` or insert a fresh one, returning
/// nothing; callers append through [`append_sample`]. Keeps per-pass
/// windows independent of prior passes.
pub fn reset_buffer(map: &MetricMap, id: &str, capacity: usize) {
    match map.get_mut(id) {
        Some(mut buf) => buf.clear(),
        None => {
            map.insert(id.to_string(), SampleBuffer::new(capacity));
        }
    }
}

/// Append one sample for `id`, allocating a buffer on first use.
pub fn append_sample(map: &MetricMap, id: &str, capacity: usize, value: f64) {
    map.entry(id.to_string())
        .or_insert_with(|| SampleBuffer::new(capacity))
        .add(value);
}
