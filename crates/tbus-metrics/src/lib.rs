//! Counter primitives for the tbus messaging fabric.
//!
//! Resolvers, brokers and nodes bump [`Counter`]s as traffic flows. A
//! counter can be read in place ([`Counter::get`]) or drained
//! ([`Counter::take`]) by a collector that reports per-interval deltas.
//! Counters never feed back into routing decisions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counter backed by an [`AtomicU64`].
///
/// Relaxed ordering throughout: values are statistics, not synchronization.
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Record one event.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Record `n` units (bytes, messages).
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Return the current value and reset to zero in one step.
    ///
    /// Events recorded concurrently land either in the returned value or in
    /// the next window, never in both.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter({})", self.get())
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl serde::Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.get())
    }
}
