// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The exclusive (write) side of the lock.

use crate::GraphLock;
use crate::TryLockError;
use event_listener::Listener;
use futures::FutureExt;
use std::future::poll_fn;
use std::pin::pin;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;

impl GraphLock {
    /// Acquires the lock for write, waiting for all readers to drain.
    ///
    /// While waiting, the calling task yields, so the rest of the thread's
    /// event loop keeps running. Each call must be matched by exactly one
    /// [`release_write`](Self::release_write).
    ///
    /// This has no timer, so it does not warn about stalled readers. Use
    /// [`acquire_write_with_sleep`](Self::acquire_write_with_sleep) to get
    /// stall warnings from an async writer.
    ///
    /// # Panics
    ///
    /// Panics if another writer holds the lock or is waiting for it. Writers
    /// are not queued; callers must serialize them.
    ///
    /// If the returned future is dropped before completing, the write intent is
    /// withdrawn and parked readers are woken.
    pub async fn acquire_write(&self) {
        self.acquire_write_with_sleep(|_| std::future::pending()).await
    }

    /// Like [`acquire_write`](Self::acquire_write), but logs a warning each
    /// time the readers take longer than the configured stall timeout to drain.
    ///
    /// `sleep` returns a future that completes after the given duration, using
    /// whatever timer the caller's executor provides. The timeout doubles after
    /// each warning, up to the configured maximum.
    pub async fn acquire_write_with_sleep<F>(&self, mut sleep: impl FnMut(Duration) -> F)
    where
        F: Future<Output = ()>,
    {
        self.announce_writer();
        let mut pending = PendingWrite(Some(self));
        let start = Instant::now();
        let mut timeout = self.state.config.stall_timeout;
        loop {
            let mut listener = self.state.writer_event.listen();
            if self.poll_readers() == 0 {
                break;
            }
            let mut timer = pin!(sleep(timeout));
            let kicked = poll_fn(|cx| {
                if listener.poll_unpin(cx).is_ready() {
                    Poll::Ready(true)
                } else if timer.as_mut().poll(cx).is_ready() {
                    Poll::Ready(false)
                } else {
                    Poll::Pending
                }
            })
            .await;
            if !kicked {
                self.warn_stall(start.elapsed());
                timeout = (timeout * 2).min(self.state.config.max_stall_timeout);
            }
        }
        pending.0 = None;
        self.acquired_write(start);
    }

    /// Like [`acquire_write`](Self::acquire_write), but blocks the calling
    /// thread instead of yielding.
    ///
    /// For callers that are not running inside an executor. Calling this from
    /// a task on a worker thread stalls every other task on that thread.
    #[track_caller]
    pub fn acquire_write_blocking(&self) {
        self.announce_writer();
        let start = Instant::now();
        let mut timeout = self.state.config.stall_timeout;
        loop {
            let listener = self.state.writer_event.listen();
            if self.poll_readers() == 0 {
                break;
            }
            if listener.wait_timeout(timeout).is_none() {
                self.warn_stall(start.elapsed());
                timeout = (timeout * 2).min(self.state.config.max_stall_timeout);
            }
        }
        self.acquired_write(start);
    }

    /// Tries to acquire the lock for write without waiting.
    ///
    /// Fails with [`TryLockError::WriterActive`] if another writer is present,
    /// or [`TryLockError::ReadersActive`] if any readers hold the lock. In the
    /// latter case the write intent is withdrawn before returning.
    pub fn try_acquire_write(&self) -> Result<(), TryLockError> {
        self.state
            .has_writer
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .map_err(|_| TryLockError::WriterActive)?;
        fence(Ordering::SeqCst);
        let readers = self.poll_readers();
        if readers != 0 {
            self.clear_writer();
            return Err(TryLockError::ReadersActive(readers));
        }
        self.acquired_write(Instant::now());
        Ok(())
    }

    /// Releases the write lock and wakes every parked reader.
    ///
    /// # Panics
    ///
    /// Panics if the write lock is not held.
    #[track_caller]
    pub fn release_write(&self) {
        self.clear_writer();
        tracing::debug!("released graph write lock");
    }

    /// Acquires the lock for write, returning a guard that releases it on drop.
    ///
    /// See [`acquire_write`](Self::acquire_write).
    pub async fn write(&self) -> WriteGuard<'_> {
        self.acquire_write().await;
        WriteGuard { lock: self }
    }

    /// Acquires the lock for write by blocking the thread, returning a guard
    /// that releases it on drop.
    ///
    /// See [`acquire_write_blocking`](Self::acquire_write_blocking).
    #[track_caller]
    pub fn write_blocking(&self) -> WriteGuard<'_> {
        self.acquire_write_blocking();
        WriteGuard { lock: self }
    }

    /// Tries to acquire the lock for write without waiting, returning a guard
    /// that releases it on drop.
    pub fn try_write(&self) -> Result<WriteGuard<'_>, TryLockError> {
        self.try_acquire_write()?;
        Ok(WriteGuard { lock: self })
    }

    #[track_caller]
    fn announce_writer(&self) {
        let had_writer = self.state.has_writer.swap(true, Ordering::Relaxed);
        assert!(
            !had_writer,
            "graph write lock acquired while another writer is active"
        );
        // Pairs with the fence in `start_read`: any reader this writer fails to
        // count is guaranteed to see the flag and back out.
        fence(Ordering::SeqCst);
        tracing::debug!("waiting for graph readers to drain");
    }

    /// Counts the outstanding readers.
    fn poll_readers(&self) -> isize {
        self.state.counters.writer_polls.increment();
        let total = self.state.registry.lock().reader_total();
        // Only overflows with an absurd number of concurrent readers.
        assert!(total >= 0, "graph reader count went negative: {total}");
        total
    }

    fn acquired_write(&self, start: Instant) {
        self.state.counters.writes.increment();
        tracing::debug!(
            wait_us = start.elapsed().as_micros() as u64,
            "acquired graph write lock"
        );
    }

    #[track_caller]
    fn clear_writer(&self) {
        let _registry = self.state.registry.lock();
        assert!(
            self.state.has_writer.load(Ordering::Relaxed),
            "graph write lock released without being held"
        );
        self.state.has_writer.store(false, Ordering::Release);
        // Readers park while holding the registry lock, so every reader that
        // saw the flag is listening by now.
        self.state.readers_event.notify(usize::MAX);
    }

    fn warn_stall(&self, waited: Duration) {
        self.state.counters.writer_stalls.increment();
        let registry = self.state.registry.lock();
        let busy = registry
            .nonzero_contexts()
            .map(|(name, count)| format!("{name}={count}"))
            .collect::<Vec<_>>()
            .join(",");
        tracing::warn!(
            waited_ms = waited.as_millis() as u64,
            leftover = registry.leftover(),
            %busy,
            "graph writer stalled waiting for readers"
        );
    }
}

/// Withdraws the write intent of an `acquire_write` future dropped before it
/// completed.
struct PendingWrite<'a>(Option<&'a GraphLock>);

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.0 {
            tracing::debug!("graph write acquisition abandoned");
            lock.clear_writer();
        }
    }
}

/// A held write lock. Releases on drop.
#[must_use]
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a GraphLock,
}

impl WriteGuard<'_> {
    /// The lock this guard holds.
    pub fn lock(&self) -> &GraphLock {
        self.lock
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
