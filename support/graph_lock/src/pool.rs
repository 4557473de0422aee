// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Running graph lock users on a [`ThreadPool`].
//!
//! Each pool thread gets its own worker context for as long as it runs. Tasks
//! on the pool are woken onto whichever thread is free, so a task that parks
//! on the lock may well resume on a different context.

use crate::GraphLock;
use crate::ThreadAttachment;
use futures::executor::ThreadPool;
use futures::executor::ThreadPoolBuilder;
use std::cell::RefCell;

thread_local! {
    static ATTACHMENT: RefCell<Option<ThreadAttachment>> = const { RefCell::new(None) };
}

/// Returns a [`ThreadPool`] builder whose threads attach to `lock` when they
/// start and detach when they stop.
///
/// Threads are named `{name_prefix}{index}`, and so are their contexts. The
/// builder's `after_start` and `before_stop` hooks are used for this; setting
/// them again on the returned builder replaces this behavior.
pub fn thread_pool_builder(lock: &GraphLock, name_prefix: &str) -> ThreadPoolBuilder {
    let mut builder = ThreadPool::builder();
    let lock = lock.clone();
    let prefix = name_prefix.to_owned();
    builder
        .name_prefix(name_prefix)
        .after_start(move |index| {
            let attachment = lock.attach_thread(format!("{prefix}{index}"));
            ATTACHMENT.with_borrow_mut(|slot| {
                assert!(slot.is_none(), "pool thread attached twice");
                *slot = Some(attachment);
            });
        })
        .before_stop(|_| {
            let attachment = ATTACHMENT.with_borrow_mut(Option::take);
            drop(attachment);
        });
    builder
}
