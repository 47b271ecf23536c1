//! Registry of transactions blocked on `retry`.
//!
//! There is one registry for the whole process. It maps every var to the
//! control blocks of the transactions waiting for it to change. The
//! registry has its own lock, which is never held together with the lock
//! of a var.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::trace;

use super::control_block::ControlBlock;
use crate::tvar::CellId;

static WAITERS: Mutex<Registry> = Mutex::new(Registry::new());

struct Registry {
    /// Waiters of every var, in registration order.
    by_cell: BTreeMap<CellId, Vec<Arc<ControlBlock>>>,

    /// Vars every waiter is registered on, keyed by `ControlBlock::id`.
    by_waiter: BTreeMap<u64, BTreeSet<CellId>>,
}

impl Registry {
    const fn new() -> Registry {
        Registry {
            by_cell: BTreeMap::new(),
            by_waiter: BTreeMap::new(),
        }
    }

    fn register(&mut self, ctrl: &Arc<ControlBlock>, cells: &[CellId]) {
        let registered = self.by_waiter.entry(ctrl.id()).or_default();
        for &cell in cells {
            if registered.insert(cell) {
                self.by_cell.entry(cell).or_default().push(ctrl.clone());
            }
        }
    }

    /// Remove `waiter` from all vars.
    fn deregister(&mut self, waiter: u64) {
        let cells = match self.by_waiter.remove(&waiter) {
            Some(cells) => cells,
            None => return,
        };
        for cell in cells {
            if let Some(waiting) = self.by_cell.get_mut(&cell) {
                waiting.retain(|c| c.id() != waiter);
                if waiting.is_empty() {
                    self.by_cell.remove(&cell);
                }
            }
        }
    }

    /// Take every waiter of the given vars out of the registry.
    fn take(&mut self, cells: &[CellId]) -> Vec<Arc<ControlBlock>> {
        let mut woken = Vec::new();
        for cell in cells {
            let waiting = match self.by_cell.remove(cell) {
                Some(waiting) => waiting,
                None => continue,
            };
            for ctrl in waiting {
                // The waiter may also sit on other vars. It must not stay
                // there after it has been woken.
                self.deregister(ctrl.id());
                woken.push(ctrl);
            }
        }
        woken
    }

    #[cfg(test)]
    fn waiting_on(&self, cell: CellId) -> usize {
        self.by_cell.get(&cell).map_or(0, Vec::len)
    }

    #[cfg(test)]
    fn registered_on(&self, waiter: u64) -> usize {
        self.by_waiter.get(&waiter).map_or(0, BTreeSet::len)
    }
}

/// Register `ctrl` on every var in `cells`.
///
/// Registering a waiter twice on the same var has no effect.
pub fn register(ctrl: &Arc<ControlBlock>, cells: &[CellId]) {
    trace!(task = %ctrl.task(), vars = cells.len(), "register waiter");
    WAITERS.lock().register(ctrl, cells);
}

/// Remove `ctrl` from every var it waits on.
pub fn deregister(ctrl: &ControlBlock) {
    WAITERS.lock().deregister(ctrl.id());
}

/// Wake every transaction waiting on one of `cells`.
pub fn notify(cells: &[CellId]) {
    if cells.is_empty() {
        return;
    }
    let woken = WAITERS.lock().take(cells);

    // Wake outside of the registry lock, wakers may run arbitrary code.
    for ctrl in woken {
        trace!(task = %ctrl.task(), "wake waiter");
        ctrl.set_changed();
    }
}

#[cfg(test)]
pub fn waiting_on(cell: CellId) -> usize {
    WAITERS.lock().waiting_on(cell)
}

#[cfg(test)]
pub fn registered_on(ctrl: &ControlBlock) -> usize {
    WAITERS.lock().registered_on(ctrl.id())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{TVar, TaskId};

    fn waiter() -> Arc<ControlBlock> {
        Arc::new(ControlBlock::new(TaskId::current()))
    }

    #[test]
    fn register_is_idempotent() {
        let var = TVar::new(0);
        let ctrl = waiter();
        register(&ctrl, &[var.id()]);
        register(&ctrl, &[var.id(), var.id()]);
        assert_eq!(waiting_on(var.id()), 1);
        deregister(&ctrl);
        assert_eq!(waiting_on(var.id()), 0);
    }

    #[test]
    fn register_many_vars_with_repeats() {
        let vars: Vec<_> = (0..10_000).map(TVar::new).collect();
        let ids: Vec<_> = vars.iter().map(TVar::id).collect();
        let ctrl = waiter();

        register(&ctrl, &ids);
        register(&ctrl, &ids[..5_000]);

        assert_eq!(registered_on(&ctrl), 10_000);
        assert_eq!(waiting_on(ids[0]), 1);
        assert_eq!(waiting_on(ids[9_999]), 1);

        notify(&[ids[1234]]);
        assert!(ctrl.is_changed());
        assert_eq!(registered_on(&ctrl), 0);
        assert_eq!(waiting_on(ids[9_999]), 0);
    }

    #[test]
    fn notify_removes_from_all_vars() {
        let a = TVar::new(0);
        let b = TVar::new(0);
        let ctrl = waiter();
        register(&ctrl, &[a.id(), b.id()]);

        notify(&[a.id()]);

        assert!(ctrl.is_changed());
        assert_eq!(waiting_on(a.id()), 0);
        assert_eq!(waiting_on(b.id()), 0);
    }

    #[test]
    fn notify_leaves_other_waiters() {
        let a = TVar::new(0);
        let b = TVar::new(0);
        let on_a = waiter();
        let on_b = waiter();
        register(&on_a, &[a.id()]);
        register(&on_b, &[b.id()]);

        notify(&[a.id()]);

        assert!(on_a.is_changed());
        assert!(!on_b.is_changed());
        assert_eq!(waiting_on(b.id()), 1);
        deregister(&on_b);
    }
}
