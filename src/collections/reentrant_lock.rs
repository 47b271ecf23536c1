use std::collections::BTreeMap;
use std::convert::Infallible;

use fstm_core::*;
use tracing::warn;

/// State of a `TReentrantLock`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unlocked,

    /// Held by readers only. Maps every reading task to its reentrant count.
    ReadLocked { readers: BTreeMap<TaskId, usize> },

    /// Held by a single writer, which may also hold read locks.
    WriteLocked {
        owner: TaskId,
        writes: usize,
        reads: usize,
    },
}

impl LockState {
    fn read_locks_of(&self, task: TaskId) -> usize {
        match self {
            LockState::Unlocked => 0,
            LockState::ReadLocked { readers } => readers.get(&task).copied().unwrap_or(0),
            LockState::WriteLocked { owner, reads, .. } if *owner == task => *reads,
            LockState::WriteLocked { .. } => 0,
        }
    }

    fn write_locks_of(&self, task: TaskId) -> usize {
        match self {
            LockState::WriteLocked { owner, writes, .. } if *owner == task => *writes,
            _ => 0,
        }
    }

    fn read_locks(&self) -> usize {
        match self {
            LockState::Unlocked => 0,
            LockState::ReadLocked { readers } => readers.values().sum(),
            LockState::WriteLocked { reads, .. } => *reads,
        }
    }

    fn write_locks(&self) -> usize {
        match self {
            LockState::WriteLocked { writes, .. } => *writes,
            _ => 0,
        }
    }
}

/// A reentrant read/write lock on top of software transactional memory.
///
/// Any number of tasks can hold read locks at the same time, but a write
/// lock excludes every other task. The task holding the write lock may also
/// take read locks, and a task that is the only reader may take the write
/// lock.
///
/// Locks belong to the `TaskId` committing the transaction. Acquiring
/// retries until the lock is available, so acquisitions compose with other
/// transactions.
///
/// ```
/// # use fstm::collections::TReentrantLock;
/// let lock = TReentrantLock::new();
/// {
///     let guard = lock.write_lock().unwrap();
///     assert_eq!(guard.count(), 1);
///     assert!(lock.write_locked::<()>().commit().unwrap());
/// }
/// assert!(!lock.is_locked::<()>().commit().unwrap());
/// ```
#[derive(Clone, Debug)]
pub struct TReentrantLock {
    state: TVar<LockState>,
}

impl Default for TReentrantLock {
    fn default() -> TReentrantLock {
        TReentrantLock::new()
    }
}

impl TReentrantLock {
    pub fn new() -> TReentrantLock {
        TReentrantLock {
            state: TVar::new(LockState::Unlocked),
        }
    }

    /// Acquire a read lock. Returns the number of read locks the task holds.
    ///
    /// Retries while another task holds the write lock.
    pub fn acquire_read<E: Send + 'static>(&self) -> Stm<E, usize> {
        let state = self.state.clone();
        Stm::from_fn(move |tx| {
            let task = tx.task();
            let (count, next) = match state.read(tx) {
                LockState::Unlocked => {
                    let readers = BTreeMap::from([(task, 1)]);
                    (1, LockState::ReadLocked { readers })
                }
                LockState::ReadLocked { mut readers } => {
                    let count = readers.entry(task).or_insert(0);
                    *count += 1;
                    (*count, LockState::ReadLocked { readers })
                }
                LockState::WriteLocked {
                    owner,
                    writes,
                    reads,
                } if owner == task => (
                    reads + 1,
                    LockState::WriteLocked {
                        owner,
                        writes,
                        reads: reads + 1,
                    },
                ),
                LockState::WriteLocked { .. } => return retry(),
            };
            state.write(tx, next);
            Ok(count)
        })
    }

    /// Release a read lock. Returns the number of read locks the task still
    /// holds.
    ///
    /// Dies if the task does not hold a read lock.
    pub fn release_read<E: Send + 'static>(&self) -> Stm<E, usize> {
        let state = self.state.clone();
        Stm::from_fn(move |tx| {
            let task = tx.task();
            let (count, next) = match state.read(tx) {
                LockState::ReadLocked { mut readers } if readers.contains_key(&task) => {
                    let count = readers.get(&task).copied().unwrap_or(0) - 1;
                    if count == 0 {
                        readers.remove(&task);
                    } else {
                        readers.insert(task, count);
                    }
                    if readers.is_empty() {
                        (count, LockState::Unlocked)
                    } else {
                        (count, LockState::ReadLocked { readers })
                    }
                }
                LockState::WriteLocked {
                    owner,
                    writes,
                    reads,
                } if owner == task && reads > 0 => (
                    reads - 1,
                    LockState::WriteLocked {
                        owner,
                        writes,
                        reads: reads - 1,
                    },
                ),
                _ => return Err(not_held(task, "read")),
            };
            state.write(tx, next);
            Ok(count)
        })
    }

    /// Acquire the write lock. Returns the number of write locks the task
    /// holds.
    ///
    /// Retries while another task holds any lock.
    pub fn acquire_write<E: Send + 'static>(&self) -> Stm<E, usize> {
        let state = self.state.clone();
        Stm::from_fn(move |tx| {
            let task = tx.task();
            let (count, next) = match state.read(tx) {
                LockState::Unlocked => (
                    1,
                    LockState::WriteLocked {
                        owner: task,
                        writes: 1,
                        reads: 0,
                    },
                ),
                // Upgrade if the task is the only reader.
                LockState::ReadLocked { readers } if readers.keys().all(|t| *t == task) => (
                    1,
                    LockState::WriteLocked {
                        owner: task,
                        writes: 1,
                        reads: readers.get(&task).copied().unwrap_or(0),
                    },
                ),
                LockState::WriteLocked {
                    owner,
                    writes,
                    reads,
                } if owner == task => (
                    writes + 1,
                    LockState::WriteLocked {
                        owner,
                        writes: writes + 1,
                        reads,
                    },
                ),
                _ => return retry(),
            };
            state.write(tx, next);
            Ok(count)
        })
    }

    /// Release the write lock. Returns the number of write locks the task
    /// still holds.
    ///
    /// Read locks taken while writing stay with the task. Dies if the task
    /// does not hold the write lock.
    pub fn release_write<E: Send + 'static>(&self) -> Stm<E, usize> {
        let state = self.state.clone();
        Stm::from_fn(move |tx| {
            let task = tx.task();
            let (count, next) = match state.read(tx) {
                LockState::WriteLocked { owner, writes: 1, reads } if owner == task => {
                    if reads == 0 {
                        (0, LockState::Unlocked)
                    } else {
                        let readers = BTreeMap::from([(task, reads)]);
                        (0, LockState::ReadLocked { readers })
                    }
                }
                LockState::WriteLocked {
                    owner,
                    writes,
                    reads,
                } if owner == task => (
                    writes - 1,
                    LockState::WriteLocked {
                        owner,
                        writes: writes - 1,
                        reads,
                    },
                ),
                _ => return Err(not_held(task, "write")),
            };
            state.write(tx, next);
            Ok(count)
        })
    }

    /// Total number of read locks held by all tasks.
    pub fn read_locks<E: Send + 'static>(&self) -> Stm<E, usize> {
        self.state.get().map(|s| s.read_locks())
    }

    /// Number of write locks held by the owner.
    pub fn write_locks<E: Send + 'static>(&self) -> Stm<E, usize> {
        self.state.get().map(|s| s.write_locks())
    }

    /// Number of read locks held by the committing task.
    pub fn task_read_locks<E: Send + 'static>(&self) -> Stm<E, usize> {
        let state = self.state.clone();
        Stm::from_fn(move |tx| Ok(state.read(tx).read_locks_of(tx.task())))
    }

    /// Number of write locks held by the committing task.
    pub fn task_write_locks<E: Send + 'static>(&self) -> Stm<E, usize> {
        let state = self.state.clone();
        Stm::from_fn(move |tx| Ok(state.read(tx).write_locks_of(tx.task())))
    }

    pub fn read_locked<E: Send + 'static>(&self) -> Stm<E, bool> {
        self.read_locks().map(|n| n > 0)
    }

    pub fn write_locked<E: Send + 'static>(&self) -> Stm<E, bool> {
        self.write_locks().map(|n| n > 0)
    }

    pub fn is_locked<E: Send + 'static>(&self) -> Stm<E, bool> {
        self.state.get().map(|s| s != LockState::Unlocked)
    }

    /// Take a read lock for the current thread until the guard is dropped.
    pub fn read_lock(&self) -> Result<ReadGuard, CommitError<Infallible>> {
        self.read_lock_as(TaskId::current())
    }

    /// Take a read lock for `task` until the guard is dropped.
    pub fn read_lock_as(&self, task: TaskId) -> Result<ReadGuard, CommitError<Infallible>> {
        let count = self.acquire_read().commit_as(task)?;
        Ok(ReadGuard {
            lock: self.clone(),
            task,
            count,
        })
    }

    /// Take a read lock from an async task.
    ///
    /// Suspends the task instead of blocking the thread while the lock is
    /// write-locked by another task.
    pub async fn read_lock_async(&self, task: TaskId) -> Result<ReadGuard, CommitError<Infallible>> {
        let count = self.acquire_read().commit_async().as_task(task).await?;
        Ok(ReadGuard {
            lock: self.clone(),
            task,
            count,
        })
    }

    /// Take the write lock for the current thread until the guard is dropped.
    pub fn write_lock(&self) -> Result<WriteGuard, CommitError<Infallible>> {
        self.write_lock_as(TaskId::current())
    }

    /// Take the write lock for `task` until the guard is dropped.
    pub fn write_lock_as(&self, task: TaskId) -> Result<WriteGuard, CommitError<Infallible>> {
        let count = self.acquire_write().commit_as(task)?;
        Ok(WriteGuard {
            lock: self.clone(),
            task,
            count,
        })
    }

    /// Take the write lock from an async task.
    pub async fn write_lock_async(
        &self,
        task: TaskId,
    ) -> Result<WriteGuard, CommitError<Infallible>> {
        let count = self.acquire_write().commit_async().as_task(task).await?;
        Ok(WriteGuard {
            lock: self.clone(),
            task,
            count,
        })
    }
}

fn not_held<E>(task: TaskId, kind: &str) -> StmError<E> {
    StmError::Die(Defect::new(format!("task {} does not hold a {} lock", task, kind)))
}

/// A read lock, released when dropped.
#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct ReadGuard {
    lock: TReentrantLock,
    task: TaskId,
    count: usize,
}

impl ReadGuard {
    /// The number of read locks the task held after acquiring this one.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if let Err(error) = self.lock.release_read::<Infallible>().commit_as(self.task) {
            warn!(task = %self.task, %error, "failed to release read lock");
        }
    }
}

/// A write lock, released when dropped.
#[must_use = "the lock is released when the guard is dropped"]
#[derive(Debug)]
pub struct WriteGuard {
    lock: TReentrantLock,
    task: TaskId,
    count: usize,
}

impl WriteGuard {
    /// The number of write locks the task held after acquiring this one.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Err(error) = self.lock.release_write::<Infallible>().commit_as(self.task) {
            warn!(task = %self.task, %error, "failed to release write lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_lock_is_reentrant() {
        let lock = TReentrantLock::new();
        assert_eq!(lock.acquire_read::<()>().commit(), Ok(1));
        assert_eq!(lock.acquire_read::<()>().commit(), Ok(2));
        assert_eq!(lock.read_locks::<()>().commit(), Ok(2));
        assert_eq!(lock.release_read::<()>().commit(), Ok(1));
        assert_eq!(lock.release_read::<()>().commit(), Ok(0));
        assert_eq!(lock.is_locked::<()>().commit(), Ok(false));
    }

    #[test]
    fn readers_share_the_lock() {
        let lock = TReentrantLock::new();
        let a = TaskId::fresh();
        let b = TaskId::fresh();
        assert_eq!(lock.acquire_read::<()>().commit_as(a), Ok(1));
        assert_eq!(lock.acquire_read::<()>().commit_as(b), Ok(1));
        assert_eq!(lock.read_locks::<()>().commit(), Ok(2));
        assert_eq!(lock.task_read_locks::<()>().commit_as(a), Ok(1));
    }

    #[test]
    fn write_lock_is_reentrant() {
        let lock = TReentrantLock::new();
        assert_eq!(lock.acquire_write::<()>().commit(), Ok(1));
        assert_eq!(lock.acquire_write::<()>().commit(), Ok(2));
        assert_eq!(lock.task_write_locks::<()>().commit(), Ok(2));
        assert_eq!(lock.release_write::<()>().commit(), Ok(1));
        assert_eq!(lock.release_write::<()>().commit(), Ok(0));
        assert_eq!(lock.is_locked::<()>().commit(), Ok(false));
    }

    #[test]
    fn writer_excludes_other_tasks() {
        let lock = TReentrantLock::new();
        let owner = TaskId::fresh();
        let other = TaskId::fresh();

        assert_eq!(lock.acquire_write::<()>().commit_as(owner), Ok(1));
        assert_eq!(lock.acquire_read::<()>().optionally().commit_as(other), Ok(None));
        assert_eq!(lock.acquire_write::<()>().optionally().commit_as(other), Ok(None));
    }

    #[test]
    fn reader_excludes_other_writers() {
        let lock = TReentrantLock::new();
        let reader = TaskId::fresh();
        let writer = TaskId::fresh();

        assert_eq!(lock.acquire_read::<()>().commit_as(reader), Ok(1));
        assert_eq!(lock.acquire_write::<()>().optionally().commit_as(writer), Ok(None));
    }

    #[test]
    fn owner_reads_while_writing() {
        let lock = TReentrantLock::new();
        assert_eq!(lock.acquire_write::<()>().commit(), Ok(1));
        assert_eq!(lock.acquire_read::<()>().commit(), Ok(1));
        assert_eq!(lock.write_locked::<()>().commit(), Ok(true));
        assert_eq!(lock.read_locked::<()>().commit(), Ok(true));

        // Dropping the write lock keeps the read lock.
        assert_eq!(lock.release_write::<()>().commit(), Ok(0));
        assert_eq!(lock.write_locked::<()>().commit(), Ok(false));
        assert_eq!(lock.task_read_locks::<()>().commit(), Ok(1));
        assert_eq!(lock.release_read::<()>().commit(), Ok(0));
        assert_eq!(lock.is_locked::<()>().commit(), Ok(false));
    }

    #[test]
    fn only_reader_upgrades() {
        let lock = TReentrantLock::new();
        assert_eq!(lock.acquire_read::<()>().commit(), Ok(1));
        assert_eq!(lock.acquire_read::<()>().commit(), Ok(2));
        assert_eq!(lock.acquire_write::<()>().commit(), Ok(1));
        assert_eq!(lock.read_locks::<()>().commit(), Ok(2));
        assert_eq!(lock.write_locks::<()>().commit(), Ok(1));
    }

    #[test]
    fn releasing_unheld_lock_dies() {
        let lock = TReentrantLock::new();
        let x = lock.release_read::<()>().commit();
        assert!(matches!(x, Err(CommitError::Died(_))));

        let other = TaskId::fresh();
        lock.acquire_write::<()>().commit_as(other).unwrap();
        let x = lock.release_write::<()>().commit();
        assert!(matches!(x, Err(CommitError::Died(_))));
        assert_eq!(lock.write_locks::<()>().commit(), Ok(1));
    }

    #[test]
    fn guards_release_on_drop() {
        let lock = TReentrantLock::new();
        {
            let read = lock.read_lock().unwrap();
            assert_eq!(read.count(), 1);
            let write = lock.write_lock().unwrap();
            assert_eq!(write.count(), 1);
        }
        assert_eq!(lock.is_locked::<()>().commit(), Ok(false));
    }

    /// A blocked reader wakes up once the writer drops its guard.
    #[test]
    fn blocked_reader_wakes_on_release() {
        let lock = TReentrantLock::new();
        let guard = lock.write_lock().unwrap();

        let (tx, rx) = channel();
        let lockc = lock.clone();
        let reader = thread::spawn(move || {
            let guard = lockc.read_lock().unwrap();
            let _ = tx.send(());
            guard.count()
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(reader.join().unwrap(), 1);
    }

    #[test]
    fn writers_are_mutually_exclusive() {
        let lock = TReentrantLock::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                let overlaps = overlaps.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = lock.write_lock().unwrap();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_micros(100));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(lock.is_locked::<()>().commit(), Ok(false));
    }

    /// Tasks sharing one executor thread are still different owners.
    #[tokio::test(flavor = "current_thread")]
    async fn async_tasks_on_one_thread_exclude_each_other() {
        let lock = TReentrantLock::new();

        let first = tokio::spawn(lock.acquire_write::<()>().commit_async());
        let second = tokio::spawn(lock.acquire_write::<()>().commit_async());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (done, pending) = if first.is_finished() {
            (first, second)
        } else {
            (second, first)
        };
        assert!(!pending.is_finished());
        assert_eq!(done.await.unwrap(), Ok(1));
        assert_eq!(lock.write_locks::<()>().commit(), Ok(1));
        pending.abort();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn async_commits_reenter_with_explicit_task() {
        let lock = TReentrantLock::new();
        let task = TaskId::fresh();

        let first = lock.acquire_write::<()>().commit_async().as_task(task).await;
        let second = lock.acquire_write::<()>().commit_async().as_task(task).await;
        assert_eq!((first, second), (Ok(1), Ok(2)));

        let other = lock.acquire_write::<()>().optionally().commit_async().await;
        assert_eq!(other, Ok(None));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_write_lock_waits_for_readers() {
        let lock = TReentrantLock::new();
        let reader = TaskId::fresh();
        let writer = TaskId::fresh();

        let read = lock.read_lock_async(reader).await.unwrap();

        let lockc = lock.clone();
        let pending = tokio::spawn(async move {
            let guard = lockc.write_lock_async(writer).await.unwrap();
            guard.count()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        drop(read);
        let count = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("writer did not wake up")
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(lock.is_locked::<()>().commit(), Ok(false));
    }
}
