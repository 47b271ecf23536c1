//! Runs a program against the journal of one attempt.
//!
//! The interpreter keeps its continuations on an explicit stack, so long
//! chains of `flat_map` and the bulk combinators do not grow the call stack.
//! It never touches the committed state of a var; everything goes through
//! the journal.

use std::sync::Arc;

use super::{Savepoint, Transaction};
use crate::program::op::{consumed, Cont, Exit, Op};

enum Frame {
    /// Continue a `FlatMap` with the value.
    Continue(Cont),

    Fold {
        on_failure: Cont,
        on_success: Cont,
        savepoint: Savepoint,
    },

    OrElse {
        second: Arc<Op>,
        on_failure: bool,
        savepoint: Savepoint,
    },
}

/// Interpret `program` until it succeeds, fails, dies or retries.
pub fn run(program: &Arc<Op>, tx: &mut Transaction) -> Exit {
    let mut stack: Vec<Frame> = Vec::new();
    let mut current = program.clone();

    loop {
        let mut exit = match &*current {
            Op::Succeed(thunk) => match thunk.force() {
                Some(v) => Exit::Succeed(v),
                None => Exit::Die(consumed()),
            },
            Op::Fail(thunk) => match thunk.force() {
                Some(e) => Exit::Fail(e),
                None => Exit::Die(consumed()),
            },
            Op::Die(defect) => Exit::Die(defect.clone()),
            Op::Retry => Exit::Retry,
            Op::Journal(f) => f(tx),
            Op::FlatMap(inner, k) => {
                stack.push(Frame::Continue(k.clone()));
                current = inner.clone();
                continue;
            }
            Op::Fold {
                body,
                on_failure,
                on_success,
            } => {
                stack.push(Frame::Fold {
                    on_failure: on_failure.clone(),
                    on_success: on_success.clone(),
                    savepoint: tx.savepoint(),
                });
                current = body.clone();
                continue;
            }
            Op::OrElse {
                first,
                second,
                on_failure,
            } => {
                stack.push(Frame::OrElse {
                    second: second.clone(),
                    on_failure: *on_failure,
                    savepoint: tx.savepoint(),
                });
                current = first.clone();
                continue;
            }
        };

        // Unwind until a frame handles the exit and yields the next program.
        current = loop {
            let frame = match stack.pop() {
                Some(frame) => frame,
                None => return exit,
            };

            exit = match (frame, exit) {
                (Frame::Continue(k), Exit::Succeed(v)) => break k(v),
                (
                    Frame::Fold {
                        on_success,
                        savepoint,
                        ..
                    },
                    Exit::Succeed(v),
                ) => {
                    tx.release(savepoint);
                    break on_success(v);
                }
                (
                    Frame::Fold {
                        on_failure,
                        savepoint,
                        ..
                    },
                    Exit::Fail(e),
                ) => {
                    tx.restore(savepoint);
                    break on_failure(e);
                }
                (Frame::OrElse { second, savepoint, .. }, Exit::Retry) => {
                    tx.restore(savepoint);
                    break second;
                }
                (
                    Frame::OrElse {
                        second,
                        savepoint,
                        on_failure: true,
                    },
                    Exit::Fail(_),
                ) => {
                    tx.restore(savepoint);
                    break second;
                }
                // Everything else passes the frame. A branch frame closes
                // its savepoint on the way out.
                (Frame::Fold { savepoint, .. }, exit) | (Frame::OrElse { savepoint, .. }, exit) => {
                    tx.release(savepoint);
                    exit
                }
                (Frame::Continue(_), exit) => exit,
            };
        };
    }
}

#[cfg(test)]
mod test {
    use super::super::Transaction;
    use crate::{partition, Stm, TVar, TaskId};

    /// Items at odd positions write and then fail. Only their writes are
    /// undone, and no undo entries outlive the bulk run.
    #[test]
    fn partition_undoes_failed_items_only() {
        let vars: Vec<TVar<i32>> = (0..1000).map(TVar::new).collect();
        let program = partition::<i32, (), _, _, _, _>(vars.clone(), |var: TVar<i32>| {
            var.update(|n| n + 1)
                .zip_right(&var.get())
                .flat_map(|n| if n % 2 == 0 { Stm::fail(n) } else { Stm::succeed(n) })
        });

        let mut tx = Transaction::new(TaskId::current());
        let (failed, kept) = program.run(&mut tx).unwrap();

        assert_eq!(failed.len(), 500);
        assert_eq!(kept.len(), 500);
        assert_eq!((failed[0], kept[0]), (2, 1));
        assert_eq!(tx.read_set().len(), 1000);
        assert_eq!(tx.write_set().len(), 500);
        assert_eq!(tx.savepoints, 0);
        assert!(tx.undo.is_empty());

        assert!(tx.commit());
        assert_eq!(vars[0].read_atomic(), 1);
        assert_eq!(vars[1].read_atomic(), 1);
        assert_eq!(vars[1].version(), 0);
    }
}
