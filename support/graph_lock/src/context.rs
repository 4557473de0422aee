// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Worker contexts and the registry of live contexts.

use crate::GraphLock;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::AtomicIsize;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Owner id of a context that is not registered with any lock.
const UNOWNED: u64 = 0;

/// The per-thread reader bookkeeping for one worker thread's event loop.
///
/// Readers running on the thread adjust `reader_count` with plain atomic
/// operations, so readers on different threads never contend on the same
/// cache line.
///
/// A context belongs to at most one lock at a time.
#[derive(Debug)]
#[repr(align(64))]
pub struct WorkerContext {
    /// Readers that acquired on this context minus readers that released on
    /// it. Goes negative when tasks migrate here while holding the lock.
    reader_count: AtomicIsize,
    /// Id of the lock this context is registered with, or `UNOWNED`.
    owner: AtomicU64,
    /// Live `ContextEnterGuard`s for this context, across all threads.
    entered: AtomicUsize,
    name: String,
}

impl WorkerContext {
    /// Returns a new, unregistered context.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reader_count: AtomicIsize::new(0),
            owner: AtomicU64::new(UNOWNED),
            entered: AtomicUsize::new(0),
            name: name.into(),
        })
    }

    /// Returns true if this context is registered with some lock.
    pub fn is_registered(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNOWNED
    }

    fn is_owned_by(&self, lock_id: u64) -> bool {
        self.owner.load(Ordering::Relaxed) == lock_id
    }

    /// The context's name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A snapshot of this context's reader count.
    pub fn reader_count(&self) -> isize {
        self.reader_count.load(Ordering::Relaxed)
    }

    pub(crate) fn counter(&self) -> &AtomicIsize {
        &self.reader_count
    }
}

/// The live contexts of a lock, plus the counts left behind by contexts that
/// have been unregistered.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    contexts: Vec<Arc<WorkerContext>>,
    leftover: isize,
}

impl Registry {
    /// Sums the leftover count and every live context's count.
    ///
    /// Readers update their counters without holding the registry lock, so
    /// this is only a snapshot.
    pub(crate) fn reader_total(&self) -> isize {
        self.contexts.iter().fold(self.leftover, |total, ctx| {
            total + ctx.reader_count.load(Ordering::Acquire)
        })
    }

    pub(crate) fn leftover(&self) -> isize {
        self.leftover
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.len()
    }

    pub(crate) fn nonzero_contexts(&self) -> impl Iterator<Item = (&str, isize)> {
        self.contexts
            .iter()
            .map(|ctx| (ctx.name(), ctx.reader_count()))
            .filter(|&(_, count)| count != 0)
    }
}

thread_local! {
    /// The contexts the current thread is running on, innermost last, tagged
    /// with the id of the lock each belongs to.
    static CURRENT: RefCell<Vec<(u64, Arc<WorkerContext>)>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` with the innermost context the current thread has entered for
/// lock `lock_id`, or returns `None` if there is none.
pub(crate) fn with_current<R>(lock_id: u64, f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
    CURRENT.with_borrow(|stack| {
        stack
            .iter()
            .rev()
            .find(|(id, _)| *id == lock_id)
            .map(|(_, ctx)| f(ctx))
    })
}

/// Marks the current thread as running on a worker context until dropped.
///
/// Returned by [`GraphLock::enter`].
#[must_use]
#[derive(Debug)]
pub struct ContextEnterGuard {
    ctx: Arc<WorkerContext>,
    // Bound to the thread whose stack it was pushed on.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextEnterGuard {
    fn drop(&mut self) {
        self.ctx.entered.fetch_sub(1, Ordering::Relaxed);
        let popped = CURRENT.with_borrow_mut(Vec::pop);
        // Don't double panic if the stack was unwound out of order.
        if !std::thread::panicking() {
            let (_, ctx) = popped.expect("context stack is empty");
            assert!(
                Arc::ptr_eq(&ctx, &self.ctx),
                "contexts exited out of order: expected {}, found {}",
                self.ctx.name(),
                ctx.name()
            );
        }
    }
}

/// A worker context that is registered with a lock and entered on the current
/// thread for as long as this lives.
///
/// Returned by [`GraphLock::attach_thread`]. On drop, the context is exited and
/// unregistered.
#[must_use]
#[derive(Debug)]
pub struct ThreadAttachment {
    lock: GraphLock,
    ctx: Arc<WorkerContext>,
    enter: Option<ContextEnterGuard>,
}

impl ThreadAttachment {
    /// The attached context.
    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }
}

impl Drop for ThreadAttachment {
    fn drop(&mut self) {
        drop(self.enter.take());
        self.lock.unregister_context(&self.ctx);
    }
}

impl GraphLock {
    /// Registers `ctx` so that its readers are visible to writers.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` is already registered, with this lock or any other, or
    /// has a nonzero reader count.
    #[track_caller]
    pub fn register_context(&self, ctx: &Arc<WorkerContext>) {
        let mut registry = self.state.registry.lock();
        assert_eq!(
            ctx.reader_count(),
            0,
            "registering context {} with a nonzero reader count",
            ctx.name()
        );
        if let Err(owner) = ctx.owner.compare_exchange(
            UNOWNED,
            self.state.id,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            if owner == self.state.id {
                panic!("context {} is already registered", ctx.name());
            }
            panic!(
                "context {} is already registered with another graph lock",
                ctx.name()
            );
        }
        registry.contexts.push(ctx.clone());
        tracing::debug!(context = ctx.name(), "registered graph lock context");
    }

    /// Unregisters `ctx`.
    ///
    /// Any readers still accounted to `ctx` (tasks that acquired here and
    /// migrated away) are folded into the lock's leftover count, so they stay
    /// visible to writers until they release elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` is not registered with this lock, or if any thread is
    /// still running on it (see [`enter`](Self::enter)).
    #[track_caller]
    pub fn unregister_context(&self, ctx: &Arc<WorkerContext>) {
        let mut registry = self.state.registry.lock();
        let i = registry
            .contexts
            .iter()
            .position(|c| Arc::ptr_eq(c, ctx))
            .unwrap_or_else(|| panic!("context {} is not registered", ctx.name()));
        // `enter` bumps this under the registry lock, so no thread can enter
        // the context between this check and the removal.
        assert_eq!(
            ctx.entered.load(Ordering::Relaxed),
            0,
            "unregistering context {} while it is entered",
            ctx.name()
        );
        registry.contexts.swap_remove(i);
        let folded = ctx.reader_count.swap(0, Ordering::AcqRel);
        registry.leftover += folded;
        ctx.owner.store(UNOWNED, Ordering::Release);
        tracing::debug!(
            context = ctx.name(),
            folded,
            leftover = registry.leftover,
            "unregistered graph lock context"
        );
    }

    /// Returns the number of outstanding readers across all contexts, live or
    /// unregistered.
    ///
    /// Readers adjust their counters without taking the registry lock, so the
    /// value is only a snapshot and may be momentarily stale.
    pub fn total_reader_count(&self) -> isize {
        self.state.registry.lock().reader_total()
    }

    /// Marks the current thread as running on `ctx` until the returned guard is
    /// dropped.
    ///
    /// This is how the task runtime tells the lock which context a task is
    /// executing on. Entries nest; the innermost one wins.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` is not registered with this lock.
    #[track_caller]
    pub fn enter(&self, ctx: &Arc<WorkerContext>) -> ContextEnterGuard {
        {
            let _registry = self.state.registry.lock();
            assert!(
                ctx.is_owned_by(self.state.id),
                "entering unregistered context {}",
                ctx.name()
            );
            ctx.entered.fetch_add(1, Ordering::Relaxed);
        }
        CURRENT.with_borrow_mut(|stack| stack.push((self.state.id, ctx.clone())));
        ContextEnterGuard {
            ctx: ctx.clone(),
            _not_send: PhantomData,
        }
    }

    /// Creates a context for the current thread, registers it, and enters it.
    ///
    /// Worker threads call this when they start; dropping the returned
    /// attachment when the thread retires undoes all three steps.
    pub fn attach_thread(&self, name: impl Into<String>) -> ThreadAttachment {
        let ctx = WorkerContext::new(name);
        self.register_context(&ctx);
        let enter = self.enter(&ctx);
        ThreadAttachment {
            lock: self.clone(),
            ctx,
            enter: Some(enter),
        }
    }

    /// Runs `f` on the context the calling task is currently executing on.
    #[track_caller]
    pub(crate) fn with_current_context<R>(&self, f: impl FnOnce(&WorkerContext) -> R) -> R {
        let id = self.state.id;
        let r = with_current(id, |ctx| {
            debug_assert!(ctx.is_owned_by(id), "context {} is not registered", ctx.name());
            f(ctx)
        });
        match r {
            Some(r) => r,
            None => panic!(
                "graph lock used for read outside a worker context on thread {:?}",
                std::thread::current().name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::GraphLock;
    use crate::WorkerContext;
    use crate::test_support::init_tracing;
    use futures::executor::block_on;
    use std::sync::atomic::Ordering;

    #[test]
    fn register_and_unregister() {
        init_tracing();
        let lock = GraphLock::new();
        let a = WorkerContext::new("a");
        let b = WorkerContext::new("b");
        lock.register_context(&a);
        lock.register_context(&b);
        assert_eq!(lock.stats().contexts, 2);
        lock.unregister_context(&a);
        lock.unregister_context(&b);
        let stats = lock.stats();
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.leftover, 0);
    }

    #[test]
    #[should_panic(expected = "registering context busy with a nonzero reader count")]
    fn register_busy_context() {
        init_tracing();
        let lock = GraphLock::new();
        let ctx = WorkerContext::new("busy");
        ctx.counter().store(1, Ordering::Relaxed);
        lock.register_context(&ctx);
    }

    #[test]
    #[should_panic(expected = "context twice is already registered")]
    fn register_twice() {
        init_tracing();
        let lock = GraphLock::new();
        let ctx = WorkerContext::new("twice");
        lock.register_context(&ctx);
        lock.register_context(&ctx);
    }

    /// A context shared between two locks would count its readers toward
    /// both, so the second registration is refused.
    #[test]
    #[should_panic(expected = "context shared is already registered with another graph lock")]
    fn register_with_two_locks() {
        init_tracing();
        let first = GraphLock::new();
        let second = GraphLock::new();
        let ctx = WorkerContext::new("shared");
        first.register_context(&ctx);
        second.register_context(&ctx);
    }

    /// Once released by one lock, a context can join another.
    #[test]
    fn context_moves_between_locks() {
        init_tracing();
        let first = GraphLock::new();
        let second = GraphLock::new();
        let ctx = WorkerContext::new("mover");
        first.register_context(&ctx);
        assert!(ctx.is_registered());
        first.unregister_context(&ctx);
        assert!(!ctx.is_registered());

        second.register_context(&ctx);
        let _enter = second.enter(&ctx);
        block_on(second.acquire_read());
        assert_eq!(second.total_reader_count(), 1);
        assert_eq!(first.total_reader_count(), 0);
        second.release_read();
    }

    #[test]
    #[should_panic(expected = "entering unregistered context foreign")]
    fn enter_context_of_other_lock() {
        init_tracing();
        let first = GraphLock::new();
        let second = GraphLock::new();
        let ctx = WorkerContext::new("foreign");
        first.register_context(&ctx);
        let _guard = second.enter(&ctx);
    }

    /// Readers on a context that was unregistered under them would no longer
    /// be visible to writers, so unregistering an entered context is refused.
    #[test]
    #[should_panic(expected = "unregistering context active while it is entered")]
    fn unregister_entered_context() {
        init_tracing();
        let lock = GraphLock::new();
        let ctx = WorkerContext::new("active");
        lock.register_context(&ctx);
        let _guard = lock.enter(&ctx);
        lock.unregister_context(&ctx);
    }

    /// An entry on another thread also keeps the context registered.
    #[test]
    fn unregister_after_exit_on_other_thread() {
        init_tracing();
        let lock = GraphLock::new();
        let ctx = WorkerContext::new("handoff");
        lock.register_context(&ctx);

        let (entered_send, entered_recv) = std::sync::mpsc::channel();
        let (exit_send, exit_recv) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn({
            let lock = lock.clone();
            let ctx = ctx.clone();
            move || {
                let _enter = lock.enter(&ctx);
                entered_send.send(()).unwrap();
                exit_recv.recv().unwrap();
            }
        });

        entered_recv.recv().unwrap();
        let refused = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.unregister_context(&ctx)
        }));
        assert!(refused.is_err());
        assert_eq!(lock.stats().contexts, 1);

        exit_send.send(()).unwrap();
        thread.join().unwrap();
        lock.unregister_context(&ctx);
        assert_eq!(lock.stats().contexts, 0);
    }

    #[test]
    #[should_panic(expected = "context stranger is not registered")]
    fn unregister_unknown() {
        init_tracing();
        let lock = GraphLock::new();
        lock.unregister_context(&WorkerContext::new("stranger"));
    }

    #[test]
    #[should_panic(expected = "entering unregistered context loose")]
    fn enter_unregistered() {
        init_tracing();
        let lock = GraphLock::new();
        let _guard = lock.enter(&WorkerContext::new("loose"));
    }

    /// A retiring context's in-flight readers move to the leftover count.
    #[test]
    fn unregister_folds_in_flight_readers() {
        init_tracing();
        let lock = GraphLock::new();
        let ctx = WorkerContext::new("retiring");
        lock.register_context(&ctx);
        ctx.counter().store(3, Ordering::Relaxed);
        lock.unregister_context(&ctx);

        let stats = lock.stats();
        assert_eq!(stats.leftover, 3);
        assert_eq!(lock.total_reader_count(), 3);
        assert_eq!(ctx.reader_count(), 0);
    }

    /// A reader that acquires on one context and releases on another leaves
    /// the two counters unbalanced but the total at zero.
    #[test]
    fn migrated_reader_balances_total() {
        init_tracing();
        let lock = GraphLock::new();
        let a = WorkerContext::new("a");
        let b = WorkerContext::new("b");
        lock.register_context(&a);
        lock.register_context(&b);

        {
            let _a = lock.enter(&a);
            block_on(lock.acquire_read());
        }
        assert_eq!(a.reader_count(), 1);
        assert_eq!(lock.total_reader_count(), 1);
        {
            let _b = lock.enter(&b);
            lock.release_read();
        }
        assert_eq!(a.reader_count(), 1);
        assert_eq!(b.reader_count(), -1);
        assert_eq!(lock.total_reader_count(), 0);

        // Retiring either context keeps the total conserved.
        lock.unregister_context(&a);
        assert_eq!(lock.stats().leftover, 1);
        assert_eq!(lock.total_reader_count(), 0);
    }

    #[test]
    fn nested_enter_uses_innermost() {
        init_tracing();
        let lock = GraphLock::new();
        let outer = WorkerContext::new("outer");
        let inner = WorkerContext::new("inner");
        lock.register_context(&outer);
        lock.register_context(&inner);

        let _outer = lock.enter(&outer);
        {
            let _inner = lock.enter(&inner);
            assert_eq!(lock.with_current_context(|ctx| ctx.name().to_owned()), "inner");
        }
        assert_eq!(lock.with_current_context(|ctx| ctx.name().to_owned()), "outer");
    }

    #[test]
    fn contexts_are_per_lock() {
        init_tracing();
        let first = GraphLock::new();
        let second = GraphLock::new();
        let _first = first.attach_thread("first");
        let _second = second.attach_thread("second");

        block_on(first.acquire_read());
        assert_eq!(first.total_reader_count(), 1);
        assert_eq!(second.total_reader_count(), 0);
        first.release_read();
    }

    #[test]
    fn attachment_unregisters_on_drop() {
        init_tracing();
        let lock = GraphLock::new();
        let attachment = lock.attach_thread("worker");
        assert_eq!(attachment.context().name(), "worker");
        assert_eq!(lock.stats().contexts, 1);
        drop(attachment);
        assert_eq!(lock.stats().contexts, 0);
        assert!(super::with_current(lock.state.id, |_| ()).is_none());
    }
}
