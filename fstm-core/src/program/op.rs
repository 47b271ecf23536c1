//! The untyped representation of transaction programs.
//!
//! `Stm<E, A>` is a typed handle around an `Op`. Values travel through the
//! interpreter as `Box<dyn Any + Send>` and are downcast again at the typed
//! boundary, so a mismatch is a bug in this crate and never a user error.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

use crate::result::{Defect, StmError, StmResult};
use crate::Transaction;

pub type Value = Box<dyn Any + Send>;

/// Continuation of `FlatMap` and both branches of `Fold`.
pub type Cont = Arc<dyn Fn(Value) -> Arc<Op> + Send + Sync>;

/// Access to the journal of the running attempt.
pub type JournalFn = Arc<dyn Fn(&mut Transaction) -> Exit + Send + Sync>;

/// Source of the value of `Succeed` and `Fail`.
pub enum Thunk {
    /// Computed again every time the program runs.
    Lazy(Arc<dyn Fn() -> Value + Send + Sync>),

    /// A value produced while an attempt runs.
    ///
    /// Continuations build these for the rest of the same attempt, so each
    /// one is evaluated exactly once.
    Now(Once<Value>),
}

impl Thunk {
    pub fn force(&self) -> Option<Value> {
        match self {
            Thunk::Lazy(f) => Some(f()),
            Thunk::Now(once) => once.take(),
        }
    }
}

/// A value that can be taken by a `Fn` closure exactly once.
pub struct Once<T>(Mutex<Option<T>>);

impl<T> Once<T> {
    pub fn new(value: T) -> Once<T> {
        Once(Mutex::new(Some(value)))
    }

    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }
}

pub enum Op {
    Succeed(Thunk),
    Fail(Thunk),
    Die(Defect),
    Retry,

    /// Reads and writes of vars, and everything else that needs the journal.
    Journal(JournalFn),

    /// Run the program, then feed its value to the continuation.
    FlatMap(Arc<Op>, Cont),

    /// Run `body`. On a typed failure, drop its writes and continue with
    /// `on_failure`; on success continue with `on_success`.
    Fold {
        body: Arc<Op>,
        on_failure: Cont,
        on_success: Cont,
    },

    /// Run `first`. If it retries, or fails and `on_failure` is set, drop
    /// its writes and run `second`.
    OrElse {
        first: Arc<Op>,
        second: Arc<Op>,
        on_failure: bool,
    },
}

/// How an attempt, or a part of it, ended.
pub enum Exit {
    Succeed(Value),
    Fail(Value),
    Die(Defect),
    Retry,
}

impl Exit {
    pub fn from_result<A, E>(result: StmResult<A, E>) -> Exit
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        match result {
            Ok(a) => Exit::Succeed(Box::new(a)),
            Err(StmError::Fail(e)) => Exit::Fail(Box::new(e)),
            Err(StmError::Retry) => Exit::Retry,
            Err(StmError::Die(d)) => Exit::Die(d),
        }
    }

    pub fn into_result<A, E>(self) -> StmResult<A, E>
    where
        A: 'static,
        E: 'static,
    {
        match self {
            Exit::Succeed(v) => Ok(unbox(v)),
            Exit::Fail(e) => Err(StmError::Fail(unbox(e))),
            Exit::Retry => Err(StmError::Retry),
            Exit::Die(d) => Err(StmError::Die(d)),
        }
    }
}

/// Downcast a value of the interpreter.
pub fn unbox<T: 'static>(value: Value) -> T {
    match value.downcast::<T>() {
        Ok(v) => *v,
        Err(_) => unreachable!("transaction value has wrong type"),
    }
}

/// The defect raised when a `Thunk::Now` is evaluated a second time.
pub fn consumed() -> Defect {
    Defect::new("transaction value was consumed twice")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn once_takes_a_single_time() {
        let once = Once::new(42);
        assert_eq!(once.take(), Some(42));
        assert_eq!(once.take(), None);
    }

    #[test]
    fn lazy_thunk_repeats() {
        let thunk = Thunk::Lazy(Arc::new(|| Box::new(7) as Value));
        assert_eq!(unbox::<i32>(thunk.force().unwrap()), 7);
        assert_eq!(unbox::<i32>(thunk.force().unwrap()), 7);
    }

    #[test]
    fn exit_round_trips_failure() {
        let exit = Exit::from_result::<i32, &str>(Err(StmError::Fail("boom")));
        assert_eq!(exit.into_result::<i32, &str>(), Err(StmError::Fail("boom")));
    }
}
