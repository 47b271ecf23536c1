mod reentrant_lock;

pub use self::reentrant_lock::{LockState, ReadGuard, TReentrantLock, WriteGuard};
