//! Usage Ledger Common - Shared primitives for the balance engine
//!
//! This crate provides the small, dependency-light building blocks that
//! every other ledger crate speaks in:
//! - Typed identifiers (customer, entity, feature, grant, bucket)
//! - Millisecond timestamps with calendar arithmetic
//! - Store error taxonomy
//! - Event counters behind the ledger metrics
//!
//! # Value Objects
//!
//! Identifiers are immutable, validated on construction and compared by
//! value. A `CustomerId` can never be passed where an `EntityId` is
//! expected, which is what keeps lock scopes and cache keys honest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ids;
pub mod time;

pub use error::*;
pub use ids::*;
pub use time::*;

use std::sync::atomic::{AtomicU64, Ordering};

/// Running count of ledger events, shared across tasks
///
/// Writers never wait on each other. A read taken while other tasks are
/// counting may miss their in-flight events; totals settle once they finish.
#[derive(Debug, Default)]
pub struct EventCounter(AtomicU64);

impl EventCounter {
    /// Counter starting at zero
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Count one event
    pub fn inc(&self) {
        self.add(1);
    }

    /// Count `events` at once, saturating at `u64::MAX`
    pub fn add(&self, events: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_add(events)));
    }

    /// Events counted so far
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
