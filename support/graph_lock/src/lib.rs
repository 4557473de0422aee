// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scalable reader/writer lock protecting a shared topology graph.
//!
//! The graph is read from many cooperative tasks spread across a fixed pool of
//! worker threads, and modified rarely by a single writer. Readers therefore
//! never touch shared state on the fast path: each worker context owns its own
//! reader counter, and a reader only increments the counter of the context it
//! happens to be running on.
//!
//! A writer announces itself by setting a process-wide flag and then waits for
//! the sum of all the per-context counters to reach zero. Readers that observe
//! the flag back out and park until the writer releases the lock.
//!
//! ```rust
//! # futures::executor::block_on(async {
//! let lock = graph_lock::GraphLock::new();
//! let _worker = lock.attach_thread("worker0");
//!
//! {
//!     let _read = lock.read().await;
//!     // Walk the graph here.
//! }
//!
//! let _write = lock.write().await;
//! // Modify the graph here.
//! # });
//! ```
//!
//! ## Task migration
//!
//! A task that parks may resume on a different worker thread. Counters are
//! always adjusted on the context the task is running on *at that moment*, so
//! an individual context's counter can go negative. Only the aggregate, which
//! also includes the counts folded in from contexts that have since been
//! unregistered, is meaningful.
//!
//! ## Misuse
//!
//! Protocol violations (a second writer, a release without a matching acquire,
//! acquiring for read outside a registered context, registering one context
//! with two locks, unregistering a context some thread is still running on)
//! are programmer errors and panic immediately.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod context;
pub mod pool;
mod read;
mod stats;
#[cfg(test)]
mod test_support;
mod write;

pub use context::ContextEnterGuard;
pub use context::ThreadAttachment;
pub use context::WorkerContext;
pub use read::ReadGuard;
pub use stats::GraphLockStats;
pub use write::WriteGuard;

use context::Registry;
use event_listener::Event;
use parking_lot::Mutex;
use stats::Counters;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

/// Configuration for a [`GraphLock`].
#[derive(Debug, Clone)]
pub struct GraphLockConfig {
    /// How long a blocking writer, or one started with
    /// [`GraphLock::acquire_write_with_sleep`], waits for readers to drain
    /// before logging a stall warning.
    pub stall_timeout: Duration,
    /// The stall timeout doubles after each warning, up to this limit.
    pub max_stall_timeout: Duration,
}

impl Default for GraphLockConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_millis(10),
            max_stall_timeout: Duration::from_secs(10),
        }
    }
}

/// Error returned by the non-blocking acquisition methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryLockError {
    /// A writer holds the lock or is waiting for readers to drain.
    #[error("graph is being modified by a writer")]
    WriterActive,
    /// Readers hold the lock.
    #[error("graph is held by {0} readers")]
    ReadersActive(isize),
}

/// The graph lock.
///
/// This is a cheap handle to the shared lock state; clone it to hand it to
/// other threads or subsystems.
#[derive(Debug, Clone)]
pub struct GraphLock {
    state: Arc<LockState>,
}

#[derive(Debug)]
struct LockState {
    /// Identifies this lock in the per-thread current context stack.
    id: u64,
    /// Set while a writer holds the lock or is waiting for readers to drain.
    has_writer: AtomicBool,
    /// The registered contexts and the leftover counter. Also serializes
    /// parking readers against `release_write`.
    registry: Mutex<Registry>,
    /// Readers parked behind a writer.
    readers_event: Event,
    /// Kicks a writer waiting for readers to drain.
    writer_event: Event,
    config: GraphLockConfig,
    counters: Counters,
}

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

impl Default for GraphLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphLock {
    /// Returns a new lock with the default configuration.
    pub fn new() -> Self {
        Self::with_config(GraphLockConfig::default())
    }

    /// Returns a new lock using `config`.
    pub fn with_config(config: GraphLockConfig) -> Self {
        assert!(
            config.stall_timeout <= config.max_stall_timeout,
            "stall timeout {:?} exceeds maximum {:?}",
            config.stall_timeout,
            config.max_stall_timeout
        );
        Self {
            state: Arc::new(LockState {
                id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
                has_writer: AtomicBool::new(false),
                registry: Mutex::new(Registry::default()),
                readers_event: Event::new(),
                writer_event: Event::new(),
                config,
                counters: Counters::default(),
            }),
        }
    }

    /// Returns whether a writer holds the lock or is waiting to acquire it.
    pub fn has_writer(&self) -> bool {
        self.state.has_writer.load(Ordering::Acquire)
    }

    /// Prompts a writer waiting for readers to drain to recount them.
    fn kick(&self) {
        self.state.counters.kicks.increment();
        self.state.writer_event.notify(usize::MAX);
    }

    /// Asserts that the graph may currently be read.
    ///
    /// This is a coarse check: it passes whenever anyone holds the lock in
    /// either mode. It does nothing without `debug_assertions`.
    #[track_caller]
    pub fn assert_readable(&self) {
        if cfg!(debug_assertions) {
            assert!(
                self.has_writer() || self.total_reader_count() > 0,
                "graph read access required"
            );
        }
    }

    /// Asserts that the graph may currently be modified.
    ///
    /// Does nothing without `debug_assertions`.
    #[track_caller]
    pub fn assert_writable(&self) {
        if cfg!(debug_assertions) {
            assert!(self.has_writer(), "graph write access required");
        }
    }
}
