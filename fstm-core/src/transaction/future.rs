//! Committing from async tasks.
//!
//! A `Commit` runs attempts inside of `poll`. When an attempt retries, the
//! future registers its waker on every var the attempt read and returns
//! `Pending`, so the executor thread is free for other tasks. A commit that
//! changes one of the vars wakes the task and the next `poll` runs a fresh
//! attempt.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::{debug, trace};

use super::control_block::ControlBlock;
use super::{waiters, Transaction};
use crate::program::Stm;
use crate::result::{CommitError, StmError};
use crate::TaskId;

/// Future returned by `Stm::commit_async`.
///
/// Dropping it while it waits for a change cancels the commit. Nothing has
/// been published at that point.
#[must_use = "futures do nothing unless polled"]
pub struct Commit<E, A> {
    program: Stm<E, A>,
    task: TaskId,

    /// Set while the last attempt waits for a change.
    waiting: Option<Arc<ControlBlock>>,
}

impl<E, A> Commit<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Every future gets a fresh `TaskId`. Tasks of one executor share
    /// their worker threads, so the id of the thread would not tell them
    /// apart.
    pub(crate) fn new(program: Stm<E, A>) -> Commit<E, A> {
        Commit {
            program,
            task: TaskId::fresh(),
            waiting: None,
        }
    }

    /// Commit on behalf of `task`.
    ///
    /// Needed whenever two commits must be recognized as the same task,
    /// for example to re-enter or release a lock taken by an earlier one.
    pub fn as_task(mut self, task: TaskId) -> Commit<E, A> {
        self.task = task;
        self
    }
}

impl<E, A> Commit<E, A> {
    fn stop_waiting(&mut self) {
        if let Some(ctrl) = self.waiting.take() {
            waiters::deregister(&ctrl);
        }
    }
}

impl<E, A> Future for Commit<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    type Output = Result<A, CommitError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(ctrl) = &this.waiting {
            if ctrl.register_waker(cx.waker()) {
                return Poll::Pending;
            }
            this.stop_waiting();
        }

        let program = this.program.clone();
        let mut transaction = Transaction::new(this.task);

        loop {
            match transaction.attempt(&|tx: &mut Transaction| program.run(tx)) {
                Ok(a) => {
                    if transaction.commit() {
                        trace!(task = %this.task, "transaction committed");
                        return Poll::Ready(Ok(a));
                    }
                    debug!(task = %this.task, "transaction conflict, restarting");
                }
                Err(StmError::Fail(e)) => {
                    if transaction.validate() {
                        return Poll::Ready(Err(CommitError::Failed(e)));
                    }
                    debug!(task = %this.task, "failure on stale reads, restarting");
                }
                Err(StmError::Die(d)) => {
                    if transaction.validate() {
                        return Poll::Ready(Err(CommitError::Died(d)));
                    }
                    debug!(task = %this.task, defect = %d, "defect on stale reads, restarting");
                }
                Err(StmError::Retry) => {
                    let (ctrl, unchanged) = transaction.register_waiter();
                    if unchanged && ctrl.register_waker(cx.waker()) {
                        this.waiting = Some(ctrl);
                        return Poll::Pending;
                    }
                    waiters::deregister(&ctrl);
                }
            }

            transaction.clear();
        }
    }
}

impl<E, A> Drop for Commit<E, A> {
    fn drop(&mut self) {
        self.stop_waiting();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::result::StmError;
    use crate::{Stm, TVar};

    #[tokio::test]
    async fn commit_async_simple() {
        let var = TVar::new(14);
        let x = var.get::<()>().commit_async().await;
        assert_eq!(x, Ok(14));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commit_async_wakes_on_change() {
        let var = TVar::new(0);
        let waiting = var
            .get::<()>()
            .flat_map(|x| if x == 0 { Stm::retry() } else { Stm::succeed(x) });

        let handle = tokio::spawn(waiting.commit_async());

        tokio::time::sleep(Duration::from_millis(50)).await;
        var.set::<()>(42).commit_async().await.unwrap();

        let x = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("commit did not wake up")
            .unwrap();
        assert_eq!(x, Ok(42));
    }

    #[tokio::test]
    async fn dropped_commit_deregisters() {
        let var = TVar::new(0);
        let waiting = var
            .get::<()>()
            .flat_map(|x| if x == 0 { Stm::retry() } else { Stm::succeed(x) });

        let timed_out = tokio::time::timeout(Duration::from_millis(20), waiting.commit_async()).await;
        assert!(timed_out.is_err());
        assert_eq!(super::waiters::waiting_on(var.id()), 0);
    }

    /// The first attempt reads `a` before and `b` after a commit that keeps
    /// them equal. Its failure must not reach the caller.
    #[tokio::test]
    async fn failure_on_torn_read_restarts() {
        let a = TVar::new(0);
        let b = TVar::new(0);
        let interfered = Arc::new(AtomicBool::new(false));

        let equal = {
            let (a, b) = (a.clone(), b.clone());
            Stm::from_fn(move |tx| {
                let x = a.read(tx);
                if !interfered.swap(true, Ordering::SeqCst) {
                    let (a, b) = (a.clone(), b.clone());
                    thread::spawn(move || a.set::<()>(1).zip_right(&b.set(1)).commit())
                        .join()
                        .unwrap()
                        .unwrap();
                }
                let y = b.read(tx);
                if x != y {
                    return Err(StmError::Fail("torn"));
                }
                Ok(x)
            })
        };

        assert_eq!(equal.commit_async().await, Ok(1));
    }
}
