// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Diagnostic counters.

use crate::GraphLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A 64-bit event counter shared between threads.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub fast_reads: Counter,
    pub slow_reads: Counter,
    pub read_parks: Counter,
    pub writes: Counter,
    pub writer_polls: Counter,
    pub writer_stalls: Counter,
    pub kicks: Counter,
}

/// A point-in-time view of a [`GraphLock`], for diagnostics.
///
/// The counts are gathered without stopping readers, so they may be
/// inconsistent with one another while the lock is in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphLockStats {
    /// Registered worker contexts.
    pub contexts: usize,
    /// Readers folded in from unregistered contexts.
    pub leftover: isize,
    /// Outstanding readers across all contexts.
    pub total_readers: isize,
    /// Whether a writer holds the lock or is waiting for it.
    pub has_writer: bool,
    /// Reads acquired without taking the registry lock.
    pub fast_reads: u64,
    /// Reads acquired after rechecking under the registry lock.
    pub slow_reads: u64,
    /// Times a reader parked behind a writer.
    pub read_parks: u64,
    /// Write acquisitions.
    pub writes: u64,
    /// Times a writer counted the outstanding readers.
    pub writer_polls: u64,
    /// Stall warnings logged by waiting writers.
    pub writer_stalls: u64,
    /// Times a reader prompted a waiting writer to recount.
    pub kicks: u64,
}

impl GraphLock {
    /// Returns a snapshot of the lock's state and counters.
    pub fn stats(&self) -> GraphLockStats {
        let (contexts, leftover, total_readers) = {
            let registry = self.state.registry.lock();
            (registry.len(), registry.leftover(), registry.reader_total())
        };
        let counters = &self.state.counters;
        GraphLockStats {
            contexts,
            leftover,
            total_readers,
            has_writer: self.has_writer(),
            fast_reads: counters.fast_reads.get(),
            slow_reads: counters.slow_reads.get(),
            read_parks: counters.read_parks.get(),
            writes: counters.writes.get(),
            writer_polls: counters.writer_polls.get(),
            writer_stalls: counters.writer_stalls.get(),
            kicks: counters.kicks.get(),
        }
    }
}
