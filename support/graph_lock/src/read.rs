// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The shared (read) side of the lock.

use crate::GraphLock;
use crate::TryLockError;
use crate::WorkerContext;
use event_listener::EventListener;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;

impl GraphLock {
    /// Acquires the lock for read, parking the calling task while a writer is
    /// active.
    ///
    /// Must be called from a task running on a context entered with
    /// [`enter`](Self::enter) or [`attach_thread`](Self::attach_thread). Each
    /// call must be matched by exactly one [`release_read`](Self::release_read),
    /// which may happen on a different context.
    ///
    /// Dropping the returned future while it is parked is harmless: a parked
    /// reader holds no count.
    pub async fn acquire_read(&self) {
        loop {
            let Some(listener) = self.with_current_context(|ctx| self.start_read(ctx)) else {
                return;
            };
            tracing::trace!("reader parked behind graph writer");
            listener.await;
        }
    }

    /// Counts a reader on `ctx` and checks for a writer.
    ///
    /// Returns `None` if the read lock was acquired, or a listener for the
    /// writer's release if the reader must park.
    fn start_read(&self, ctx: &WorkerContext) -> Option<EventListener> {
        ctx.counter().fetch_add(1, Ordering::Relaxed);
        // Pairs with the fence after the writer sets `has_writer`: either the
        // writer sees this increment or this reader sees the flag.
        fence(Ordering::SeqCst);
        if !self.state.has_writer.load(Ordering::Acquire) {
            self.state.counters.fast_reads.increment();
            return None;
        }

        let registry = self.state.registry.lock();
        // The writer may have released since the flag was loaded. It clears
        // the flag under the registry lock, so this check is stable.
        if !self.state.has_writer.load(Ordering::Acquire) {
            self.state.counters.slow_reads.increment();
            return None;
        }
        ctx.counter().fetch_sub(1, Ordering::Release);
        // The writer may be waiting for this very count to drop.
        self.kick();
        self.state.counters.read_parks.increment();
        // Listen before dropping the registry lock so the wake in
        // `release_write` cannot be missed.
        let listener = self.state.readers_event.listen();
        drop(registry);
        Some(listener)
    }

    /// Releases a read lock acquired with [`acquire_read`](Self::acquire_read).
    ///
    /// The count is released on the context the caller is running on now,
    /// not necessarily the one it acquired on.
    #[track_caller]
    pub fn release_read(&self) {
        self.with_current_context(|ctx| ctx.counter().fetch_sub(1, Ordering::Release));
        fence(Ordering::SeqCst);
        // The decrement may have raced with the writer's last count.
        if self.state.has_writer.load(Ordering::Relaxed) {
            self.kick();
        }
    }

    /// Tries to acquire the lock for read without parking.
    ///
    /// Fails with [`TryLockError::WriterActive`] if a writer holds the lock or
    /// is waiting for it.
    #[track_caller]
    pub fn try_acquire_read(&self) -> Result<(), TryLockError> {
        self.with_current_context(|ctx| {
            ctx.counter().fetch_add(1, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            if self.state.has_writer.load(Ordering::Acquire) {
                ctx.counter().fetch_sub(1, Ordering::Release);
                self.kick();
                Err(TryLockError::WriterActive)
            } else {
                self.state.counters.fast_reads.increment();
                Ok(())
            }
        })
    }

    /// Acquires the lock for read, returning a guard that releases it on drop.
    ///
    /// See [`acquire_read`](Self::acquire_read).
    pub async fn read(&self) -> ReadGuard<'_> {
        self.acquire_read().await;
        ReadGuard { lock: self }
    }

    /// Tries to acquire the lock for read without parking, returning a guard
    /// that releases it on drop.
    #[track_caller]
    pub fn try_read(&self) -> Result<ReadGuard<'_>, TryLockError> {
        self.try_acquire_read()?;
        Ok(ReadGuard { lock: self })
    }
}

/// A held read lock. Releases on drop, on whatever context the dropping task
/// is running on.
#[must_use]
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a GraphLock,
}

impl ReadGuard<'_> {
    /// The lock this guard holds.
    pub fn lock(&self) -> &GraphLock {
        self.lock
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}
