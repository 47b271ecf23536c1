// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transaction programs.
//!
//! A `Stm<E, A>` describes a transaction that either succeeds with an `A`,
//! fails with an `E`, dies with a `Defect` or retries. Building a program
//! does nothing. It only runs when committed, and it may run many times:
//! once per attempt.

pub mod collect;
pub(crate) mod op;

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use self::op::{consumed, unbox, Cont, Exit, Once, Op, Thunk, Value};
use crate::backoff::Backoff;
use crate::result::{CommitError, Defect, NoSuchElement, StmError, StmResult};
use crate::transaction::future::Commit;
use crate::transaction::{interpreter, Restart, TransactionControl};
use crate::{TaskId, Transaction};

/// A transaction that succeeds with an `A` or fails with an `E`.
///
/// `Stm` is cheap to clone. Clones share the same program.
///
/// ```
/// # use fstm_core::*;
/// let sender = TVar::new(100);
/// let receiver = TVar::new(0);
///
/// let transfer = sender
///     .get::<()>()
///     .flat_map(|balance| Stm::check(move || balance >= 50))
///     .zip_right(&sender.update(|n| n - 50))
///     .zip_right(&receiver.update(|n| n + 50));
///
/// transfer.commit().unwrap();
/// assert_eq!(sender.read_atomic(), 50);
/// assert_eq!(receiver.read_atomic(), 50);
/// ```
pub struct Stm<E, A> {
    op: Arc<Op>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for Stm<E, A> {
    fn clone(&self) -> Self {
        Stm::wrap(self.op.clone())
    }
}

impl<E, A> Debug for Stm<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm").finish_non_exhaustive()
    }
}

impl<E, A> Stm<E, A> {
    fn wrap(op: Arc<Op>) -> Stm<E, A> {
        Stm {
            op,
            _marker: PhantomData,
        }
    }

    fn from_op(op: Op) -> Stm<E, A> {
        Stm::wrap(Arc::new(op))
    }
}

/// Lift a typed continuation.
fn cont<A, E, B, F>(f: F) -> Cont
where
    A: 'static,
    F: Fn(A) -> Stm<E, B> + Send + Sync + 'static,
{
    Arc::new(move |v: Value| f(unbox::<A>(v)).op)
}

impl<E, A> Stm<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// A transaction that succeeds with `value`.
    pub fn succeed(value: A) -> Stm<E, A>
    where
        A: Clone + Sync,
    {
        Stm::from_op(Op::Succeed(Thunk::Lazy(Arc::new(move || {
            Box::new(value.clone()) as Value
        }))))
    }

    /// A transaction that succeeds with the result of `f`.
    ///
    /// `f` runs once per attempt.
    pub fn succeed_with<F>(f: F) -> Stm<E, A>
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Stm::from_op(Op::Succeed(Thunk::Lazy(Arc::new(move || Box::new(f()) as Value))))
    }

    /// Succeed with a value computed while the attempt runs.
    pub(crate) fn now(value: A) -> Stm<E, A> {
        Stm::from_op(Op::Succeed(Thunk::Now(Once::new(Box::new(value)))))
    }

    /// A transaction that fails with `error`.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let x = Stm::<_, i32>::fail("bye bye world").commit();
    /// assert_eq!(x, Err(CommitError::Failed("bye bye world")));
    /// ```
    pub fn fail(error: E) -> Stm<E, A>
    where
        E: Clone + Sync,
    {
        Stm::from_op(Op::Fail(Thunk::Lazy(Arc::new(move || {
            Box::new(error.clone()) as Value
        }))))
    }

    /// A transaction that fails with the result of `f`.
    pub fn fail_with<F>(f: F) -> Stm<E, A>
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        Stm::from_op(Op::Fail(Thunk::Lazy(Arc::new(move || Box::new(f()) as Value))))
    }

    pub(crate) fn fail_now(error: E) -> Stm<E, A> {
        Stm::from_op(Op::Fail(Thunk::Now(Once::new(Box::new(error)))))
    }

    /// A transaction that dies with `defect`.
    pub fn die(defect: Defect) -> Stm<E, A> {
        Stm::from_op(Op::Die(defect))
    }

    pub fn die_message(message: impl Into<String>) -> Stm<E, A> {
        Stm::die(Defect::new(message))
    }

    /// Abort the attempt and run the whole transaction again.
    ///
    /// Semantically `retry` allows spin-lock-like behavior, but the library
    /// blocks until one of the used `TVar`s has changed, to keep CPU-usage low.
    ///
    /// `Stm::or_try` allows to define alternatives. If the first program
    /// wants to retry, then the second one has a chance to run.
    pub fn retry() -> Stm<E, A> {
        Stm::from_op(Op::Retry)
    }

    /// Build the program anew for every attempt.
    pub fn suspend<F>(f: F) -> Stm<E, A>
    where
        F: Fn() -> Stm<E, A> + Send + Sync + 'static,
    {
        Stm::<E, ()>::unit().flat_map(move |()| f())
    }

    /// Lift a closure in the style of `atomically`.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let var = TVar::new(41);
    /// let v = var.clone();
    /// let x = Stm::<(), _>::from_fn(move |tx| {
    ///     let x = v.read(tx);
    ///     guard(x > 0)?;
    ///     v.write(tx, x + 1);
    ///     Ok(x + 1)
    /// })
    /// .commit();
    /// assert_eq!(x, Ok(42));
    /// ```
    pub fn from_fn<F>(f: F) -> Stm<E, A>
    where
        F: Fn(&mut Transaction) -> StmResult<A, E> + Send + Sync + 'static,
    {
        Stm::from_op(Op::Journal(Arc::new(move |tx: &mut Transaction| {
            Exit::from_result(f(tx))
        })))
    }

    /// Run one attempt of the program against `tx`.
    pub(crate) fn run(&self, tx: &mut Transaction) -> StmResult<A, E> {
        interpreter::run(&self.op, tx).into_result()
    }

    /// Feed the result of this transaction to `f` and run the returned one.
    pub fn flat_map<B, F>(&self, f: F) -> Stm<E, B>
    where
        B: Send + 'static,
        F: Fn(A) -> Stm<E, B> + Send + Sync + 'static,
    {
        Stm::from_op(Op::FlatMap(self.op.clone(), cont(f)))
    }

    /// Run `that` after this transaction and keep its result.
    pub fn zip_right<B>(&self, that: &Stm<E, B>) -> Stm<E, B>
    where
        B: Send + 'static,
    {
        let that = that.op.clone();
        Stm::from_op(Op::FlatMap(self.op.clone(), Arc::new(move |_: Value| that.clone())))
    }

    /// Run `that` after this transaction and keep the first result.
    pub fn zip_left<B>(&self, that: &Stm<E, B>) -> Stm<E, A>
    where
        B: Send + 'static,
    {
        self.zip_with(that, |a, _| a)
    }

    pub fn zip<B>(&self, that: &Stm<E, B>) -> Stm<E, (A, B)>
    where
        B: Send + 'static,
    {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run both transactions in sequence and combine the results with `f`.
    pub fn zip_with<B, C, F>(&self, that: &Stm<E, B>, f: F) -> Stm<E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let that = that.clone();
        let f = Arc::new(f);
        self.flat_map(move |a| {
            let a = Once::new(a);
            let f = f.clone();
            that.flat_map(move |b| match a.take() {
                Some(a) => Stm::now(f(a, b)),
                None => Stm::die(consumed()),
            })
        })
    }

    /// Run the transaction built by `f` for its effects and keep the
    /// original result.
    pub fn tap<B, F>(&self, f: F) -> Stm<E, A>
    where
        B: Send + 'static,
        F: Fn(&A) -> Stm<E, B> + Send + Sync + 'static,
    {
        self.flat_map(move |a| f(&a).zip_right(&Stm::now(a)))
    }

    pub fn map<B, F>(&self, f: F) -> Stm<E, B>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        self.flat_map(move |a| Stm::now(f(a)))
    }

    /// Replace the result with `value`.
    pub fn as_value<B>(&self, value: B) -> Stm<E, B>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.map(move |_| value.clone())
    }

    /// Ignore the result.
    pub fn unit_value(&self) -> Stm<E, ()> {
        self.map(|_| ())
    }

    pub fn map_error<E2, F>(&self, f: F) -> Stm<E2, A>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        self.fold_stm(move |e| Stm::fail_now(f(e)), Stm::now)
    }

    /// Map both the failure and the success channel.
    pub fn map_both<E2, B, F, G>(&self, on_failure: F, on_success: G) -> Stm<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
        G: Fn(A) -> B + Send + Sync + 'static,
    {
        self.fold_stm(
            move |e| Stm::fail_now(on_failure(e)),
            move |a| Stm::now(on_success(a)),
        )
    }

    /// Continue with `on_failure` or `on_success`.
    ///
    /// Writes staged by a failed transaction are dropped before
    /// `on_failure` runs. Retries and defects are not handled.
    pub fn fold_stm<E2, B, F, G>(&self, on_failure: F, on_success: G) -> Stm<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        F: Fn(E) -> Stm<E2, B> + Send + Sync + 'static,
        G: Fn(A) -> Stm<E2, B> + Send + Sync + 'static,
    {
        Stm::from_op(Op::Fold {
            body: self.op.clone(),
            on_failure: cont(on_failure),
            on_success: cont(on_success),
        })
    }

    /// Handle both failure and success with pure functions.
    pub fn fold<E2, B, F, G>(&self, on_failure: F, on_success: G) -> Stm<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        F: Fn(E) -> B + Send + Sync + 'static,
        G: Fn(A) -> B + Send + Sync + 'static,
    {
        self.fold_stm(
            move |e| Stm::now(on_failure(e)),
            move |a| Stm::now(on_success(a)),
        )
    }

    /// Recover from every typed failure.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let x = Stm::<_, String>::fail("boom")
    ///     .catch_all(|e| Stm::<(), _>::succeed_with(move || format!("{}!", e)))
    ///     .commit();
    /// assert_eq!(x, Ok("boom!".to_string()));
    /// ```
    pub fn catch_all<E2, F>(&self, f: F) -> Stm<E2, A>
    where
        E2: Send + 'static,
        F: Fn(E) -> Stm<E2, A> + Send + Sync + 'static,
    {
        self.fold_stm(f, Stm::now)
    }

    /// Recover from the failures for which `f` returns a transaction.
    ///
    /// All other failures pass through unchanged.
    pub fn catch_some<F>(&self, f: F) -> Stm<E, A>
    where
        F: Fn(&E) -> Option<Stm<E, A>> + Send + Sync + 'static,
    {
        self.fold_stm(
            move |e| match f(&e) {
                Some(recover) => recover,
                None => Stm::fail_now(e),
            },
            Stm::now,
        )
    }

    /// Move the failure into the success channel.
    pub fn either<E2>(&self) -> Stm<E2, Result<A, E>>
    where
        E2: Send + 'static,
    {
        self.fold(Err, Ok)
    }

    /// Succeed with `None` on failure.
    pub fn option<E2>(&self) -> Stm<E2, Option<A>>
    where
        E2: Send + 'static,
    {
        self.fold(|_| None, Some)
    }

    /// Turn a failure into a defect.
    pub fn or_die<E2>(&self) -> Stm<E2, A>
    where
        E2: Send + 'static,
        E: Debug,
    {
        self.or_die_with(|e| Defect::new(format!("{:?}", e)))
    }

    pub fn or_die_with<E2, F>(&self, f: F) -> Stm<E2, A>
    where
        E2: Send + 'static,
        F: Fn(E) -> Defect + Send + Sync + 'static,
    {
        self.fold_stm(move |e| Stm::die(f(e)), Stm::now)
    }

    /// Replace a failure with the result of the transaction built by `f`.
    pub fn flat_map_error<E2, F>(&self, f: F) -> Stm<E2, A>
    where
        E2: Send + 'static,
        F: Fn(E) -> Stm<E2, E2> + Send + Sync + 'static,
    {
        self.fold_stm(move |e| f(e).flat_map(Stm::fail_now), Stm::now)
    }

    /// Fail with the error returned by `f`, if any.
    pub fn reject<F>(&self, f: F) -> Stm<E, A>
    where
        F: Fn(&A) -> Option<E> + Send + Sync + 'static,
    {
        self.flat_map(move |a| match f(&a) {
            Some(e) => Stm::fail_now(e),
            None => Stm::now(a),
        })
    }

    /// Fail with the result of the transaction returned by `f`, if any.
    pub fn reject_stm<F>(&self, f: F) -> Stm<E, A>
    where
        F: Fn(&A) -> Option<Stm<E, E>> + Send + Sync + 'static,
    {
        self.flat_map(move |a| match f(&a) {
            Some(error) => error.flat_map(Stm::fail_now),
            None => Stm::now(a),
        })
    }

    /// Run `that` if this transaction fails or retries.
    ///
    /// Writes of this transaction are dropped before `that` runs.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let var = TVar::new(42);
    /// let x = var
    ///     .set::<&str>(23)
    ///     .zip_right(&Stm::fail("no"))
    ///     .or_else(&var.get::<()>())
    ///     .commit();
    /// assert_eq!(x, Ok(42));
    /// ```
    pub fn or_else<E2>(&self, that: &Stm<E2, A>) -> Stm<E2, A>
    where
        E2: Send + 'static,
    {
        Stm::from_op(Op::OrElse {
            first: self.op.clone(),
            second: that.op.clone(),
            on_failure: true,
        })
    }

    /// Run `that` if this transaction retries.
    ///
    /// Writes of this transaction are dropped before `that` runs. If both
    /// retry, the whole transaction waits for the vars read by either.
    /// Failures pass through.
    pub fn or_try(&self, that: &Stm<E, A>) -> Stm<E, A> {
        Stm::from_op(Op::OrElse {
            first: self.op.clone(),
            second: that.op.clone(),
            on_failure: false,
        })
    }

    /// Succeed with `None` instead of retrying.
    pub fn optionally(&self) -> Stm<E, Option<A>> {
        self.map(Some).or_try(&Stm::succeed_with(|| None))
    }

    /// Keep the result if `predicate` holds, otherwise continue with the
    /// transaction built by `or_else`.
    pub fn filter_or_else_with<P, F>(&self, predicate: P, or_else: F) -> Stm<E, A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
        F: Fn(A) -> Stm<E, A> + Send + Sync + 'static,
    {
        self.flat_map(move |a| if predicate(&a) { Stm::now(a) } else { or_else(a) })
    }

    pub fn filter_or_else<P>(&self, predicate: P, that: &Stm<E, A>) -> Stm<E, A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let that = that.clone();
        self.filter_or_else_with(predicate, move |_| that.clone())
    }

    pub fn filter_or_fail<P>(&self, predicate: P, error: E) -> Stm<E, A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
        E: Clone + Sync,
    {
        self.filter_or_else_with(predicate, move |_| Stm::fail_now(error.clone()))
    }

    pub fn filter_or_die<P>(&self, predicate: P, defect: Defect) -> Stm<E, A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.filter_or_else_with(predicate, move |_| Stm::die(defect.clone()))
    }

    pub fn filter_or_die_message<P>(&self, predicate: P, message: impl Into<String>) -> Stm<E, A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.filter_or_die(predicate, Defect::new(message))
    }

    pub fn filter_or_retry<P>(&self, predicate: P) -> Stm<E, A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.filter_or_else_with(predicate, |_| Stm::retry())
    }

    /// Retry until the result satisfies `predicate`.
    pub fn retry_until<P>(&self, predicate: P) -> Stm<E, A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.filter_or_retry(predicate)
    }

    /// Retry while the result satisfies `predicate`.
    pub fn retry_while<P>(&self, predicate: P) -> Stm<E, A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.filter_or_retry(move |a| !predicate(a))
    }

    /// Run the transaction only if `condition` holds.
    pub fn when(&self, condition: bool) -> Stm<E, ()> {
        if condition {
            self.unit_value()
        } else {
            Stm::unit()
        }
    }

    /// Run `summary` before and after this transaction and combine both
    /// results with `f`.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let counter = TVar::new(0);
    /// let increment = counter.update_and_get::<(), _>(|n| n + 1);
    /// let x = increment.summarized(&increment, |start, end| end - start).commit();
    /// assert_eq!(x, Ok((2, 2)));
    /// ```
    pub fn summarized<S, B, F>(&self, summary: &Stm<E, S>, f: F) -> Stm<E, (B, A)>
    where
        S: Send + 'static,
        B: Send + 'static,
        F: Fn(S, S) -> B + Send + Sync + 'static,
    {
        summary
            .zip(self)
            .zip(summary)
            .map(move |((start, a), end)| (f(start, end), a))
    }

    /// Commit the transaction on the current thread.
    ///
    /// Blocks the thread while the transaction waits after `retry`.
    pub fn commit(&self) -> Result<A, CommitError<E>> {
        self.commit_as(TaskId::current())
    }

    /// Commit the transaction on behalf of `task`.
    pub fn commit_as(&self, task: TaskId) -> Result<A, CommitError<E>> {
        Transaction::with_control(task, |_| TransactionControl::Retry, None, |tx| self.run(tx))
    }

    /// Commit, but stop waiting after `retry` once `timeout` has passed
    /// since the call.
    pub fn commit_timeout(&self, timeout: Duration) -> Result<A, CommitError<E>> {
        let deadline = Instant::now() + timeout;
        Transaction::with_control(
            TaskId::current(),
            |_| TransactionControl::Retry,
            Some(deadline),
            |tx| self.run(tx),
        )
    }

    /// Commit with a control function that sees every restart.
    ///
    /// See `Transaction::with_control`.
    pub fn commit_with_control<C>(&self, control: C) -> Result<A, CommitError<E>>
    where
        C: FnMut(Restart) -> TransactionControl,
    {
        Transaction::with_control(TaskId::current(), control, None, |tx| self.run(tx))
    }

    /// Commit again after every typed failure, sleeping as `backoff` says.
    ///
    /// This is meant for transactions that poll a condition which no var
    /// expresses. Defects are returned right away.
    pub fn commit_eventually(&self, backoff: &Backoff) -> Result<A, CommitError<E>> {
        let mut failures = 0u32;
        loop {
            match self.commit() {
                Err(CommitError::Failed(_)) => {
                    let delay = backoff.delay(failures);
                    debug!(failures, ?delay, "transaction failed, committing again");
                    thread::sleep(delay);
                    failures = failures.saturating_add(1);
                }
                other => return other,
            }
        }
    }

    /// Commit from an async task.
    ///
    /// The returned future suspends the task instead of blocking the thread
    /// while the transaction waits after `retry`.
    ///
    /// Each future commits as a fresh `TaskId`. Use `Commit::as_task` to
    /// commit several transactions as the same task.
    pub fn commit_async(&self) -> Commit<E, A> {
        Commit::new(self.clone())
    }
}

impl<E> Stm<E, ()>
where
    E: Send + 'static,
{
    pub fn unit() -> Stm<E, ()> {
        Stm::succeed(())
    }

    /// Succeed if `predicate` holds, retry otherwise.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let var = TVar::new(42);
    /// let x = var
    ///     .get::<()>()
    ///     .tap(|v| { let v = *v; Stm::check(move || v == 42) })
    ///     .commit();
    /// assert_eq!(x, Ok(42));
    /// ```
    pub fn check<F>(predicate: F) -> Stm<E, ()>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Stm::from_fn(move |_| if predicate() { Ok(()) } else { Err(StmError::Retry) })
    }
}

impl<E> Stm<E, TaskId>
where
    E: Send + 'static,
{
    /// The task that commits the transaction.
    pub fn task_id() -> Stm<E, TaskId> {
        Stm::from_fn(|tx| Ok(tx.task()))
    }
}

impl<E> Stm<E, bool>
where
    E: Send + 'static,
{
    /// Run `on_true` or `on_false` depending on the result.
    pub fn if_stm<B>(&self, on_true: &Stm<E, B>, on_false: &Stm<E, B>) -> Stm<E, B>
    where
        B: Send + 'static,
    {
        let on_true = on_true.clone();
        let on_false = on_false.clone();
        self.flat_map(move |b| if b { on_true.clone() } else { on_false.clone() })
    }
}

impl<E, A> Stm<E, Stm<E, A>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    pub fn flatten(&self) -> Stm<E, A> {
        self.flat_map(|inner| inner)
    }
}

impl<E, A> Stm<E, Option<A>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Succeed with the inner value.
    ///
    /// Fails with `None` if there is no value and with `Some(e)` if the
    /// transaction failed with `e`.
    pub fn some(&self) -> Stm<Option<E>, A> {
        self.fold_stm(
            |e| Stm::fail_now(Some(e)),
            |a| match a {
                Some(a) => Stm::now(a),
                None => Stm::fail_now(None),
            },
        )
    }

    pub fn some_or_else(&self, default: A) -> Stm<E, A>
    where
        A: Clone + Sync,
    {
        self.map(move |a| a.unwrap_or_else(|| default.clone()))
    }

    /// Continue with `that` if there is no value.
    pub fn some_or_else_stm(&self, that: &Stm<E, A>) -> Stm<E, A> {
        let that = that.clone();
        self.flat_map(move |a| match a {
            Some(a) => Stm::now(a),
            None => that.clone(),
        })
    }

    pub fn some_or_fail(&self, error: E) -> Stm<E, A>
    where
        E: Clone + Sync,
    {
        self.flat_map(move |a| match a {
            Some(a) => Stm::now(a),
            None => Stm::fail_now(error.clone()),
        })
    }

    /// Fail with `NoSuchElement` if there is no value.
    pub fn some_or_fail_exception(&self) -> Stm<E, A>
    where
        E: From<NoSuchElement>,
    {
        self.flat_map(|a| match a {
            Some(a) => Stm::now(a),
            None => Stm::fail_now(E::from(NoSuchElement)),
        })
    }

    /// Succeed if there is no value.
    ///
    /// Fails with `None` if there is one and with `Some(e)` if the
    /// transaction failed with `e`.
    pub fn none(&self) -> Stm<Option<E>, ()> {
        self.fold_stm(
            |e| Stm::fail_now(Some(e)),
            |a| match a {
                Some(_) => Stm::fail_now(None),
                None => Stm::now(()),
            },
        )
    }
}

impl<E, A> Stm<E, Vec<A>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Succeed with the first element, see `some` for the failures.
    pub fn head(&self) -> Stm<Option<E>, A> {
        self.map(|items| items.into_iter().next()).some()
    }
}

impl<E, A> Stm<Option<E>, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Fail with the inner error, or with `default` if there is none.
    pub fn flatten_error_option(&self, default: E) -> Stm<E, A>
    where
        E: Clone + Sync,
    {
        self.map_error(move |e| e.unwrap_or_else(|| default.clone()))
    }

    /// Turn a failure with `None` into a success with `None`.
    pub fn unsome(&self) -> Stm<E, Option<A>> {
        self.fold_stm(
            |e| match e {
                Some(e) => Stm::fail_now(e),
                None => Stm::now(None),
            },
            |a| Stm::now(Some(a)),
        )
    }
}

/// `Err` is the left and `Ok` the right side of a result value.
impl<E, R, L> Stm<E, Result<R, L>>
where
    E: Send + 'static,
    R: Send + 'static,
    L: Send + 'static,
{
    /// Succeed with a left value.
    ///
    /// Fails with `Ok(r)` on a right value and with `Err(e)` if the
    /// transaction failed with `e`.
    pub fn left(&self) -> Stm<Result<R, E>, L> {
        self.fold_stm(
            |e| Stm::fail_now(Err(e)),
            |value| match value {
                Err(l) => Stm::now(l),
                Ok(r) => Stm::fail_now(Ok(r)),
            },
        )
    }

    /// Succeed with a right value.
    ///
    /// Fails with `Err(l)` on a left value and with `Ok(e)` if the
    /// transaction failed with `e`.
    pub fn right(&self) -> Stm<Result<E, L>, R> {
        self.fold_stm(
            |e| Stm::fail_now(Ok(e)),
            |value| match value {
                Ok(r) => Stm::now(r),
                Err(l) => Stm::fail_now(Err(l)),
            },
        )
    }
}

impl<E, A> Stm<E, Result<A, E>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Move an `Err` value into the failure channel.
    pub fn absolve(&self) -> Stm<E, A> {
        self.flat_map(|value| match value {
            Ok(a) => Stm::now(a),
            Err(e) => Stm::fail_now(e),
        })
    }
}

impl<A> Stm<A, A>
where
    A: Send + 'static,
{
    /// Succeed with the value of either channel.
    pub fn merge<E2>(&self) -> Stm<E2, A>
    where
        E2: Send + 'static,
    {
        self.fold_stm(Stm::now, Stm::now)
    }
}
