// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

pub mod control_block;
pub mod future;
pub mod interpreter;
pub mod log_var;
pub mod waiters;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::cell::Cell;
use std::collections::btree_map::Entry::*;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use self::control_block::ControlBlock;
use self::log_var::{ArcAny, LogVar};
use super::result::*;
use super::tvar::{CellId, TVar, Versioned};
use super::TaskId;

thread_local!(static TRANSACTION_RUNNING: Cell<bool> = const { Cell::new(false) });

/// `TransactionGuard` checks against nested STM calls.
///
/// Use guard, so that it correctly marks the Transaction as finished.
struct TransactionGuard;

impl TransactionGuard {
    pub fn new() -> TransactionGuard {
        TRANSACTION_RUNNING.with(|t| {
            assert!(!t.get(), "STM: Nested Transaction");
            t.set(true);
        });
        TransactionGuard
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        TRANSACTION_RUNNING.with(|t| {
            t.set(false);
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionControl {
    Retry,
    Abort,
}

/// Why an attempt has to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    /// A var read by the attempt was changed by another commit.
    Conflict,

    /// The attempt called `retry`.
    Retry,
}

/// Position in the undo log, taken when a branch starts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Savepoint(usize);

/// A lock taken during commit.
enum Lock<'a> {
    Read(RwLockReadGuard<'a, Versioned>),
    Write(RwLockWriteGuard<'a, Versioned>, &'a ArcAny),
}

/// Release locks in reverse order of acquisition.
fn unlock(mut locks: Vec<Lock<'_>>) {
    while let Some(lock) = locks.pop() {
        drop(lock);
    }
}

/// Transaction tracks all the read and written variables.
///
/// It is the journal of a single attempt. It is used for checking vars, to
/// ensure atomicity.
pub struct Transaction {
    /// Map of all vars that map the `CellId` of a var to a `LogVar`.
    ///
    /// The logs need to be accessed in a order to prevend dead-locks on locking.
    /// `CellId`s are handed out in creation order, so the order is the same
    /// for every transaction.
    vars: BTreeMap<CellId, LogVar>,

    /// Prior state of every entry changed while a savepoint is open.
    /// `None` marks an entry that did not exist before.
    undo: Vec<(CellId, Option<LogVar>)>,

    /// Number of open savepoints.
    savepoints: usize,

    /// The task that commits.
    task: TaskId,
}

impl Transaction {
    /// Create a new log.
    ///
    /// Normally you don't need to call this directly.
    /// Use `Stm::commit` or `atomically` instead.
    fn new(task: TaskId) -> Transaction {
        Transaction {
            vars: BTreeMap::new(),
            undo: Vec::new(),
            savepoints: 0,
            task,
        }
    }

    /// The task that commits this transaction.
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Run a function with a transaction on the current thread.
    ///
    /// It is equivalent to `atomically`.
    pub fn with<A, E, F>(f: F) -> Result<A, CommitError<E>>
    where
        F: Fn(&mut Transaction) -> StmResult<A, E>,
    {
        Transaction::with_control(TaskId::current(), |_| TransactionControl::Retry, None, f)
    }

    /// Run a function with a transaction.
    ///
    /// `with_control` takes another control function, that
    /// can steer the control flow and possible terminate early.
    ///
    /// `control` can react to counters, timeouts or external inputs.
    ///
    /// It allows the user to fall back to another strategy, like a global lock
    /// in the case of too much contention.
    ///
    /// When `deadline` passes while waiting after `retry`, the transaction
    /// gives up with `CommitError::Interrupted`.
    pub fn with_control<A, E, F, C>(
        task: TaskId,
        mut control: C,
        deadline: Option<Instant>,
        f: F,
    ) -> Result<A, CommitError<E>>
    where
        F: Fn(&mut Transaction) -> StmResult<A, E>,
        C: FnMut(Restart) -> TransactionControl,
    {
        let mut transaction = Transaction::new(task);
        let mut attempts = 0u64;

        // loop until success
        loop {
            attempts += 1;

            // run the computation
            let restart = match transaction.attempt(&f) {
                // on success exit loop
                Ok(t) => {
                    if transaction.commit() {
                        trace!(%task, attempts, "transaction committed");
                        return Ok(t);
                    }
                    debug!(%task, attempts, "transaction conflict, restarting");
                    Restart::Conflict
                }

                // A failure or defect only counts if the attempt saw a
                // consistent state. Otherwise it may come from a torn read.
                Err(StmError::Fail(e)) => {
                    if transaction.validate() {
                        return Err(CommitError::Failed(e));
                    }
                    debug!(%task, attempts, "failure on stale reads, restarting");
                    Restart::Conflict
                }
                Err(StmError::Die(d)) => {
                    if transaction.validate() {
                        debug!(%task, defect = %d, "transaction died");
                        return Err(CommitError::Died(d));
                    }
                    debug!(%task, attempts, defect = %d, "defect on stale reads, restarting");
                    Restart::Conflict
                }
                Err(StmError::Retry) => Restart::Retry,
            };

            // Check if the user wants to abort the transaction.
            if let TransactionControl::Abort = control(restart) {
                return Err(CommitError::Interrupted);
            }

            // on retry wait for changes
            if restart == Restart::Retry && !transaction.wait_for_change(deadline) {
                debug!(%task, "transaction gave up waiting for a change");
                return Err(CommitError::Interrupted);
            }

            // clear log before retrying computation
            transaction.clear();
        }
    }

    /// Run one attempt of `f`.
    ///
    /// A panic inside of `f` becomes a defect. Nothing has been published at
    /// that point, so dropping the log is enough.
    fn attempt<A, E, F>(&mut self, f: &F) -> StmResult<A, E>
    where
        F: Fn(&mut Transaction) -> StmResult<A, E>,
    {
        let _guard = TransactionGuard::new();
        match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(payload) => Err(StmError::Die(Defect::from_panic(payload))),
        }
    }

    /// Perform a downcast on a var.
    pub(crate) fn downcast<T: Any + Clone>(var: ArcAny) -> T {
        match var.downcast_ref::<T>() {
            Some(s) => s.clone(),
            None => unreachable!("TVar has wrong type"),
        }
    }

    /// Read a variable and return the value.
    ///
    /// The first read of a var logs its committed version. Later reads in
    /// the same attempt return the logged value, including own writes.
    ///
    /// The returned value is not always consistent with the current value of the var,
    /// but may be an outdated or or not yet commited value.
    /// Just the commit of wrong values is prevented by STM.
    pub fn read<T: Send + Sync + Any + Clone>(&mut self, var: &TVar<T>) -> T {
        let ctrl = var.control_block();
        let id = ctrl.id();
        // Check if the same var was accessed before.
        let value = match self.vars.entry(id) {
            // If the variable has been accessed before, then load that value.
            Occupied(entry) => entry.get().read(),

            // Else load the variable statically.
            Vacant(entry) => {
                if self.savepoints > 0 {
                    self.undo.push((id, None));
                }
                entry.insert(LogVar::load(ctrl)).read()
            }
        };

        Transaction::downcast(value)
    }

    /// Write a variable.
    ///
    /// The write is not immediately visible to other threads,
    /// but atomically commited at the end of the computation.
    pub fn write<T: Any + Send + Sync + Clone>(&mut self, var: &TVar<T>, value: T) {
        // box the value
        let boxed = Arc::new(value);

        let ctrl = var.control_block();
        let id = ctrl.id();
        let recording = self.savepoints > 0;
        // update or create new entry
        match self.vars.entry(id) {
            Occupied(mut entry) => {
                if recording {
                    self.undo.push((id, Some(entry.get().clone())));
                }
                entry.get_mut().write(boxed)
            }
            Vacant(entry) => {
                if recording {
                    self.undo.push((id, None));
                }
                entry.insert(LogVar::load(ctrl)).write(boxed)
            }
        }
    }

    /// Start a branch that may be abandoned with `restore`.
    ///
    /// From now on every change of the log is recorded, so that undoing a
    /// branch costs as much as the branch itself.
    pub(crate) fn savepoint(&mut self) -> Savepoint {
        self.savepoints += 1;
        Savepoint(self.undo.len())
    }

    /// Keep the changes made since `savepoint`.
    pub(crate) fn release(&mut self, _savepoint: Savepoint) {
        self.close_savepoint();
    }

    /// Undo the changes made since `savepoint`.
    ///
    /// Vars first accessed after the savepoint stay in the log as reads, so
    /// that a commit still validates them and a retry still waits for them.
    pub(crate) fn restore(&mut self, savepoint: Savepoint) {
        let undone = self.undo.split_off(savepoint.0);
        for (id, prior) in undone.into_iter().rev() {
            match prior {
                Some(log) => {
                    self.vars.insert(id, log);
                }
                None => {
                    if let Some(log) = self.vars.remove(&id) {
                        self.vars.insert(id, log.obsolete());
                    }
                }
            }
        }
        self.close_savepoint();
    }

    fn close_savepoint(&mut self) {
        self.savepoints = self.savepoints.saturating_sub(1);
        if self.savepoints == 0 {
            self.undo.clear();
        }
    }

    /// Clear the log's data.
    ///
    /// This should be used before redoing a computation, but
    /// nowhere else.
    fn clear(&mut self) {
        self.vars.clear();
        self.undo.clear();
        self.savepoints = 0;
    }

    /// Ids of all vars the attempt depends on.
    pub(crate) fn read_set(&self) -> Vec<CellId> {
        self.vars.keys().copied().collect()
    }

    /// Ids of all vars the attempt wants to publish.
    pub(crate) fn write_set(&self) -> Vec<CellId> {
        self.vars
            .iter()
            .filter(|(_, log)| log.written)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Register a control block on every read var.
    ///
    /// Returns the control block and whether all vars are still unchanged.
    /// If one has changed already, the commit that changed it may have
    /// happened before the registration and will not wake us.
    pub(crate) fn register_waiter(&self) -> (Arc<ControlBlock>, bool) {
        let ctrl = Arc::new(ControlBlock::new(self.task));
        let reads = self.read_set();
        waiters::register(&ctrl, &reads);

        let unchanged = self.vars.values().all(LogVar::is_current);
        debug!(task = %self.task, vars = reads.len(), unchanged, "transaction waits for a change");
        (ctrl, unchanged)
    }

    /// Wait for any variable to change,
    /// because the change may lead to a new calculation result.
    ///
    /// Returns false if `deadline` has passed first.
    fn wait_for_change(&mut self, deadline: Option<Instant>) -> bool {
        let (ctrl, blocking) = self.register_waiter();

        // If no var has changed, then block.
        let changed = if !blocking {
            true
        } else {
            match deadline {
                Some(deadline) => ctrl.wait_until(deadline),
                None => {
                    ctrl.wait();
                    true
                }
            }
        };

        // A woken control block has already been removed by the commit
        // that woke it, but timeouts and early exits have not.
        waiters::deregister(&ctrl);
        changed
    }

    /// Lock every logged var in `CellId` order and check its version.
    ///
    /// Written vars are write locked if `publish` is set, all others are
    /// read locked. Returns `None` with every lock released if a var has
    /// changed since the attempt first accessed it.
    fn lock_current(&self, publish: bool) -> Option<Vec<Lock<'_>>> {
        let mut locks = Vec::with_capacity(self.vars.len());

        for log in self.vars.values() {
            if publish && log.written {
                // We need to check for consistency and
                // take a write lock.
                let lock = log.var.value.write();
                if lock.version != log.version {
                    trace!(var = ?log.var.id(), "stale write");
                    unlock(locks);
                    return None;
                }
                locks.push(Lock::Write(lock, &log.value));
            } else {
                // Take read lock and check for consistency.
                let lock = log.var.value.read();
                if lock.version != log.version {
                    trace!(var = ?log.var.id(), "stale read");
                    unlock(locks);
                    return None;
                }
                locks.push(Lock::Read(lock));
            }
        }

        Some(locks)
    }

    /// Check that every logged var is still at the observed version.
    ///
    /// All vars are locked at the same time, so the check sees a single
    /// consistent state. Nothing is published.
    pub(crate) fn validate(&self) -> bool {
        match self.lock_current(false) {
            Some(locks) => {
                unlock(locks);
                true
            }
            None => false,
        }
    }

    /// Write the log back to the variables.
    ///
    /// Return true for success and false, if a read var has changed
    pub(crate) fn commit(&mut self) -> bool {
        // Use two phase locking for safely writing data back to the vars.

        // First phase: acquire locks in `CellId` order.
        // Check for consistency of all the reads and perform
        // an early return if something is not consistent.
        let mut locks = match self.lock_current(true) {
            Some(locks) => locks,
            None => return false,
        };

        // Second phase: write back and release
        for lock in &mut locks {
            if let Lock::Write(guard, value) = lock {
                guard.version += 1;
                guard.value = (*value).clone();
            }
        }
        unlock(locks);

        // Unblock all transactions waiting for the written vars.
        waiters::notify(&self.write_set());

        // Commit succeded.
        true
    }
}
