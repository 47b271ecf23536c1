// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;
use std::time::Instant;

use crate::TaskId;

static NEXT_WAITER: AtomicU64 = AtomicU64::new(0);

/// State of a waiting transaction, protected by the mutex.
struct WaitState {
    /// false once one of the observed vars has changed.
    blocked: bool,

    /// Set when the transaction waits inside of an async task.
    waker: Option<Waker>,
}

/// A control block for a transaction that called `retry`.
///
/// The transaction registers it on every var it has read. A commit that
/// changes one of those vars calls `set_changed`, which resumes the
/// transaction either by unparking its thread or by waking its task.
///
/// Be careful when using this, because you can easily create deadlocks.
pub struct ControlBlock {
    id: u64,

    /// The task that is waiting.
    task: TaskId,

    state: Mutex<WaitState>,

    /// condition variable that is used for pausing and
    /// waking the thread
    wait_cvar: Condvar,
}

impl ControlBlock {
    /// create a new ControlBlock for `task`
    pub fn new(task: TaskId) -> ControlBlock {
        ControlBlock {
            id: NEXT_WAITER.fetch_add(1, Ordering::Relaxed),
            task,
            state: Mutex::new(WaitState {
                blocked: true,
                waker: None,
            }),
            wait_cvar: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// inform the control block that a variable has changed
    ///
    /// need to be called from outside of STM
    pub fn set_changed(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.blocked = false;
            state.waker.take()
        };
        // wake thread
        self.wait_cvar.notify_one();
        // wake task
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_changed(&self) -> bool {
        !self.state.lock().blocked
    }

    /// Block until one variable has changed.
    ///
    /// `wait` may immediately return.
    ///
    /// `wait` needs to be called by the STM instance itself.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.blocked {
            self.wait_cvar.wait(&mut state);
        }
    }

    /// Like `wait`, but give up at `deadline`.
    ///
    /// Returns true if a variable has changed.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while state.blocked {
            if self.wait_cvar.wait_until(&mut state, deadline).timed_out() {
                return !state.blocked;
            }
        }
        true
    }

    /// Store the waker of an async task.
    ///
    /// Returns false if a variable has already changed, in which case the
    /// waker is not stored and the task should continue right away.
    pub fn register_waker(&self, waker: &Waker) -> bool {
        let mut state = self.state.lock();
        if !state.blocked {
            return false;
        }
        match state.waker {
            Some(ref w) if w.will_wake(waker) => {}
            _ => state.waker = Some(waker.clone()),
        }
        true
    }
}
