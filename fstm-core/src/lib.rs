// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM.
//!
//! With locks the sequential composition of two
//! two threadsafe actions is no longer threadsafe because
//! other threads may interfer in between of these actions.
//! Applying a third lock to protect both may lead to common sources of errors
//! like deadlocks or race conditions.
//!
//! Unlike locks Software transactional memory is composable.
//! It is typically implemented by writing all read and write
//! operations in a log. When the action has finished and
//! all the used `TVar`s are consistent, the writes are commited as
//! a single atomic operation.
//! Otherwise the computation repeats. This may lead to starvation,
//! but avoids common sources of bugs.
//!
//! Panicing within STM does not poison the `TVar`s. STM ensures consistency by
//! never committing on panic. The panic is reported as a `Defect`.
//!
//! # Usage
//!
//! Transactions are values of type `Stm<E, A>`. They succeed with an `A`,
//! fail with a typed error `E`, die with a `Defect`, or `retry`. Build them
//! from the operations of `TVar` and the combinators of `Stm`, then run them
//! with `Stm::commit` or, from async code, `Stm::commit_async`.
//!
//! ```
//! # use fstm_core::*;
//! let var = TVar::new(14);
//! let x = var.set::<()>(42).zip_right(&var.get()).commit();
//! assert_eq!(x, Ok(42));
//! ```
//!
//! A typed failure aborts the transaction. Nothing is written and the
//! error is returned to the caller, unless a combinator like `catch_all`
//! handles it inside the transaction.
//!
//! ```
//! # use fstm_core::*;
//! let var = TVar::new(0);
//! let x = var
//!     .set(1)
//!     .zip_right(&Stm::<_, i32>::fail("boom"))
//!     .commit();
//! assert_eq!(x, Err(CommitError::Failed("boom")));
//! assert_eq!(var.read_atomic(), 0);
//! ```
//!
//! The closure style of rust-stm is still available through `atomically`.
//! Use ? on `StmResult`, to propagate a transaction error through the system.
//! Do not handle the error yourself.
//!
//! ```
//! # use fstm_core::{atomically, TVar};
//! let var = TVar::new(0);
//!
//! let x = atomically(|trans| {
//!     var.write(trans, 42);
//!     Ok::<_, fstm_core::StmError<()>>(var.read(trans))
//! });
//!
//! assert_eq!(x, Ok(42));
//! ```
//!
//! # Transaction safety
//!
//! Software transactional memory is completely safe in the rust sense, so
//! undefined behavior will never occur.
//! Still there are multiple rules that
//! you should obey when dealing with software transactional memory.
//!
//! * Don't run code with side effects, especially no IO-code.
//! Transactions repeat in failure cases. Using IO would repeat this IO-code.
//! * Don't handle `StmResult` yourself.
//! Use `Stm::or_else` and `Stm::or_try` to combine alternative paths and
//! `Stm::optionally` to check if an inner transaction retried.
//! * Don't commit inside of another transaction. Nested commits are detected
//! at runtime and turned into a defect.
//! * Don't mix locks and transactions. Your code will easily deadlock or slow
//! down unpredictably.
//! * Don't use inner mutability to change the content of a `TVar`.
//!
//! # Speed
//!
//! Generally keep your atomic blocks as small as possible, because
//! the more time you spend, the more likely it is, to collide with
//! other threads. For STM, reading `TVar`s is quite slow, because it
//! needs to look them up in the log every time.
//! Every used `TVar` increases the chance of collisions. Therefore you should
//! keep the amount of accessed variables as low as needed.
//!
//! # Logging
//!
//! The engine reports attempts, conflicts and suspensions through `tracing`
//! at the `trace` and `debug` levels. It never installs a subscriber.

mod backoff;
mod program;
mod result;
mod task;
mod transaction;
mod tvar;


pub use backoff::Backoff;
pub use program::collect::{
    collect_all, filter_list, filter_not_list, for_each, partition, reduce, reduce_right,
    replicate, replicate_stm,
};
pub use program::Stm;
pub use result::*;
pub use task::TaskId;
pub use transaction::future::Commit;
pub use transaction::{Restart, Transaction, TransactionControl};
pub use tvar::{CellId, TVar};

#[inline]
/// Call `retry` to abort an operation and run the whole transaction again.
///
/// Semantically `retry` allows spin-lock-like behavior, but the library
/// blocks until one of the used `TVar`s has changed, to keep CPU-usage low.
///
/// # Examples
///
/// ```no_run
/// # use fstm_core::*;
/// let infinite_retry: Result<i32, CommitError<()>> = atomically(|_| retry());
/// ```
pub fn retry<T, E>() -> StmResult<T, E> {
    Err(StmError::Retry)
}

/// Run a function atomically by using Software Transactional Memory.
/// It calls to `Transaction::with` internally, but is more explicit.
pub fn atomically<A, E, F>(f: F) -> Result<A, CommitError<E>>
where
    F: Fn(&mut Transaction) -> StmResult<A, E>,
{
    Transaction::with(f)
}

#[inline]
/// Unwrap `Option` or call retry if it is `None`.
///
/// # Example
///
/// ```
/// # use fstm_core::*;
/// let x = TVar::new(Some(42));
///
/// let inner = atomically(|tx| {
///     let inner = unwrap_or_retry(x.read(tx))?;
///     Ok::<_, StmError<()>>(inner)
/// });
/// assert_eq!(inner, Ok(42));
/// ```
pub fn unwrap_or_retry<T>(option: Option<T>) -> Result<T, Retry> {
    option.ok_or(Retry)
}

#[inline]
/// Retry until `cond` is true.
///
/// # Example
///
/// ```
/// # use fstm_core::*;
/// let var = TVar::new(42);
///
/// let x = atomically(|tx| {
///     let v = var.read(tx);
///     guard(v == 42)?;
///     // v is now always 42.
///     Ok::<_, StmError<()>>(v)
/// });
/// assert_eq!(x, Ok(42));
/// ```
pub fn guard(cond: bool) -> Result<(), Retry> {
    if cond {
        Ok(())
    } else {
        Err(Retry)
    }
}

#[cfg(test)]
mod test_lib {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn infinite_retry() {
        let terminated = test::terminates(300, || {
            let _infinite_retry: Result<i32, CommitError<()>> = atomically(|_| retry());
        });
        assert!(!terminated);
    }

    #[test]
    fn stm_nested() {
        let var = TVar::new(0);

        let x = atomically(|tx| {
            var.write(tx, 42);
            Ok::<_, StmError<()>>(var.read(tx))
        });

        assert_eq!(x, Ok(42));
    }

    #[test]
    fn closure_and_program_style_mix() {
        let var = TVar::new(1);
        let double = var.update::<(), _>(|x| x * 2);

        let x = atomically(|tx| {
            double.run(tx)?;
            let v = var.read(tx);
            guard(v == 2)?;
            Ok(v)
        });

        assert_eq!(x, Ok(2));
    }

    /// Thread 1 waits for a value, thread 2 writes it with the closure style.
    #[test]
    fn threaded_closure_style() {
        let var = TVar::new(None);
        let varc = var.clone();

        let x = test::run_async(
            800,
            move || {
                atomically(|tx| {
                    let x = unwrap_or_retry(varc.read(tx))?;
                    Ok::<_, StmError<()>>(x)
                })
            },
            || {
                thread::sleep(Duration::from_millis(100));
                atomically(|tx| {
                    var.write(tx, Some(42));
                    Ok::<_, StmError<()>>(())
                })
                .unwrap();
            },
        )
        .unwrap();

        assert_eq!(x, Ok(42));
    }

    #[test]
    fn set_then_get_single_cell() {
        let r = TVar::new(14);
        let x = r.set::<()>(42).zip_right(&r.get()).commit();
        assert_eq!(x, Ok(42));
    }

    #[test]
    fn suspended_transfer_resumes() {
        test::init_tracing();

        let sender = TVar::new(100);
        let receiver = TVar::new(0);

        let transfer = {
            let sender = sender.clone();
            let receiver = receiver.clone();
            sender
                .get::<()>()
                .tap(|balance| {
                    let balance = *balance;
                    Stm::check(move || balance >= 150)
                })
                .tap(move |_| receiver.update(|n| n + 150))
                .tap({
                    let sender = sender.clone();
                    move |_| sender.update(|n| n - 150)
                })
        };

        let handle = thread::spawn(move || transfer.commit());
        thread::sleep(Duration::from_millis(50));
        sender.update::<(), _>(|n| n + 100).commit().unwrap();

        let done = test::run_async(
            2000,
            {
                let sender = sender.clone();
                move || sender.get::<()>().retry_until(|n| *n == 50).commit()
            },
            || {},
        );

        assert_eq!(done, Some(Ok(50)));
        assert_eq!(handle.join().unwrap(), Ok(200));
        assert_eq!(sender.read_atomic(), 50);
        assert_eq!(receiver.read_atomic(), 150);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let counter = TVar::new(0);
        let increment = counter
            .get::<()>()
            .flat_map({
                let counter = counter.clone();
                move |n| counter.set(n + 1)
            })
            .zip_right(&counter.get());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let increment = increment.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        increment.commit().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.read_atomic(), 1000);
        assert_eq!(counter.version(), 1000);
    }

    #[test]
    fn failed_branch_writes_are_dropped() {
        let var = TVar::new(String::from("untouched"));
        let x = var
            .set("written".to_string())
            .zip_right(&Stm::fail("boom".to_string()))
            .catch_all(|e| Stm::<(), _>::succeed_with(move || format!("{}!", e)))
            .commit();

        assert_eq!(x, Ok("boom!".to_string()));
        assert_eq!(var.read_atomic(), "untouched");
    }

    #[test]
    fn replicate_scenarios() {
        let twelve = Stm::<(), _>::succeed(12);
        assert!(replicate(-2, &twelve).is_empty());
        assert!(replicate(0, &twelve).is_empty());
        assert_eq!(collect_all(replicate(2, &twelve)).commit(), Ok(vec![12, 12]));
    }

    /// The waiting task stays suspended while the condition does not hold,
    /// even though the var changed.
    #[test]
    fn check_stays_suspended_until_condition_holds() {
        let var = TVar::new(10);
        let varc = var.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = thread::spawn(move || {
            let x = varc
                .get::<()>()
                .tap(|n| {
                    let n = *n;
                    Stm::check(move || n > 42)
                })
                .commit();
            let _ = tx.send(());
            x
        });

        thread::sleep(Duration::from_millis(50));
        var.set::<()>(9).commit().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        var.set::<()>(43).commit().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(handle.join().unwrap(), Ok(43));
    }

    #[test]
    fn commit_with_control_sees_retries() {
        let mut restarts = Vec::new();
        let x = Stm::<(), i32>::retry().commit_with_control(|restart| {
            restarts.push(restart);
            TransactionControl::Abort
        });
        assert_eq!(x, Err(CommitError::Interrupted));
        assert_eq!(restarts, vec![Restart::Retry]);
    }
}
