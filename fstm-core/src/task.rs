// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

thread_local!(static CURRENT_TASK: TaskId = TaskId::fresh());

/// Identity of a logical task that commits transactions.
///
/// Transactions can ask for the identity of the task that commits them
/// with `Stm::task_id`. Data structures such as reentrant locks use it
/// to recognize their owner.
///
/// Every thread has its own identity, returned by `TaskId::current`.
/// Every `Stm::commit_async` future gets a fresh identity. Async tasks
/// that commit more than once as the same owner allocate one with
/// `TaskId::fresh` and pass it to `Commit::as_task`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate a new, process-unique identity.
    pub fn fresh() -> TaskId {
        TaskId(NEXT_TASK.fetch_add(1, Ordering::Relaxed))
    }

    /// The identity of the calling thread.
    pub fn current() -> TaskId {
        CURRENT_TASK.with(|t| *t)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn current_is_stable_per_thread() {
        assert_eq!(TaskId::current(), TaskId::current());
    }

    #[test]
    fn threads_differ() {
        let here = TaskId::current();
        let there = thread::spawn(TaskId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn fresh_is_unique() {
        assert_ne!(TaskId::fresh(), TaskId::fresh());
    }
}
