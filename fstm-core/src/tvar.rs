// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use parking_lot::RwLock;
use std::any::Any;
use std::cmp;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::program::Stm;
use super::transaction::log_var::ArcAny;
use super::Transaction;

static NEXT_CELL: AtomicU64 = AtomicU64::new(0);

/// Creation-ordered identity of a `TVar`.
///
/// Commits lock cells in ascending `CellId` order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CellId(u64);

impl CellId {
    fn next() -> CellId {
        CellId(NEXT_CELL.fetch_add(1, Ordering::Relaxed))
    }
}

/// The live state of a var: the committed value and how often it was
/// published.
pub struct Versioned {
    pub version: u64,
    pub value: ArcAny,
}

/// `VarControlBlock` contains all the useful data for a `Var` while beeing the same type.
///
/// The control block is accessed from other threads directly whereas `Var`
/// is just a typesafe wrapper around it.
pub struct VarControlBlock {
    id: CellId,

    /// The committed value of the Var and its version.
    ///
    /// Only the commit of a transaction takes the write lock, and only
    /// while holding the locks of every other var it touches in `CellId`
    /// order. Readers take the shared lock for a short copy of the `Arc`.
    pub value: RwLock<Versioned>,
}

impl VarControlBlock {
    /// create a new `VarControlBlock` at version 0
    pub fn new<T>(val: T) -> Arc<VarControlBlock>
    where
        T: Any + Sync + Send,
    {
        let ctrl = VarControlBlock {
            id: CellId::next(),
            value: RwLock::new(Versioned {
                version: 0,
                value: Arc::new(val),
            }),
        };
        Arc::new(ctrl)
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    /// Copy the committed version and value.
    pub fn load(&self) -> (u64, ArcAny) {
        let guard = self.value.read();
        (guard.version, guard.value.clone())
    }

    pub fn version(&self) -> u64 {
        self.value.read().version
    }
}

// Implement some operators so that VarControlBlocks can be sorted.

impl PartialEq for VarControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for VarControlBlock {}

impl Ord for VarControlBlock {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for VarControlBlock {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A variable that can be used in a STM-Block
pub struct TVar<T> {
    /// The control block is the inner of the variable.
    ///
    /// The rest of `TVar` is just the typesafe interface.
    control_block: Arc<VarControlBlock>,

    /// This marker is needed so that the variable can be used in a typesafe
    /// manner.
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        TVar {
            control_block: self.control_block.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> TVar<T>
where
    T: Any + Sync + Send + Clone,
{
    /// Create a new `TVar`.
    pub fn new(val: T) -> TVar<T> {
        TVar {
            control_block: VarControlBlock::new(val),
            _marker: PhantomData,
        }
    }

    /// Create a new `TVar` as part of a transaction.
    ///
    /// Every attempt creates a fresh var. Nobody else can reach it
    /// before the transaction has committed.
    pub fn make<E>(val: T) -> Stm<E, TVar<T>>
    where
        E: Send + 'static,
    {
        Stm::from_fn(move |_| Ok(TVar::new(val.clone())))
    }

    /// `read_atomic` reads a value atomically, without starting a transaction.
    ///
    /// It is semantically equivalent to
    ///
    /// ```
    /// # use fstm_core::*;
    /// let var = TVar::new(0);
    /// let x = var.get::<()>().commit().unwrap();
    /// # assert_eq!(x, var.read_atomic());
    /// ```
    ///
    /// but more efficient.
    ///
    /// `read_atomic` returns a clone of the value.
    pub fn read_atomic(&self) -> T {
        let val = self.read_ref_atomic();
        Transaction::downcast(val)
    }

    /// Read a value atomically but return a reference.
    ///
    /// This is mostly used internally, but can be useful in
    /// some cases, because `read_atomic` clones the
    /// inner value, which may be expensive.
    pub fn read_ref_atomic(&self) -> ArcAny {
        self.control_block.value.read().value.clone()
    }

    /// How often a transaction has published a new value.
    pub fn version(&self) -> u64 {
        self.control_block.version()
    }

    pub fn id(&self) -> CellId {
        self.control_block.id()
    }

    /// Read the var inside of a closure-style transaction.
    ///
    /// It is equivalent to `transaction.read(&var)`, but more
    /// convenient.
    pub fn read(&self, transaction: &mut Transaction) -> T {
        transaction.read(self)
    }

    /// Stage a write inside of a closure-style transaction.
    ///
    /// It is equivalent to `transaction.write(&var, value)`, but more
    /// convenient.
    pub fn write(&self, transaction: &mut Transaction, value: T) {
        transaction.write(self, value)
    }

    /// Modify the content of a `TVar` with the function f.
    pub fn modify_with<F>(&self, transaction: &mut Transaction, f: F)
    where
        F: FnOnce(T) -> T,
    {
        let old = self.read(transaction);
        self.write(transaction, f(old))
    }

    /// Replaces the value of a `TVar` with a new one, returning
    /// the old one.
    pub fn replace(&self, transaction: &mut Transaction, value: T) -> T {
        let old = self.read(transaction);
        self.write(transaction, value);
        old
    }

    /// A transaction reading the var.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let var = TVar::new(14);
    /// let x = var.get::<()>().commit().unwrap();
    /// assert_eq!(x, 14);
    /// ```
    pub fn get<E>(&self) -> Stm<E, T>
    where
        E: Send + 'static,
    {
        let var = self.clone();
        Stm::from_fn(move |tx| Ok(var.read(tx)))
    }

    /// A transaction replacing the value of the var.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let var = TVar::new(14);
    /// let x = var.set::<()>(42).zip_right(&var.get()).commit().unwrap();
    /// assert_eq!(x, 42);
    /// ```
    pub fn set<E>(&self, value: T) -> Stm<E, ()>
    where
        E: Send + 'static,
    {
        let var = self.clone();
        Stm::from_fn(move |tx| {
            var.write(tx, value.clone());
            Ok(())
        })
    }

    /// A transaction applying `f` to the value of the var.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let var = TVar::new(21);
    /// var.update::<(), _>(|x| x * 2).commit().unwrap();
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn update<E, F>(&self, f: F) -> Stm<E, ()>
    where
        E: Send + 'static,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let var = self.clone();
        Stm::from_fn(move |tx| {
            var.modify_with(tx, &f);
            Ok(())
        })
    }

    /// Like `update`, but returns the new value.
    pub fn update_and_get<E, F>(&self, f: F) -> Stm<E, T>
    where
        E: Send + 'static,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let var = self.clone();
        Stm::from_fn(move |tx| {
            let new = f(var.read(tx));
            var.write(tx, new.clone());
            Ok(new)
        })
    }

    /// Like `update`, but returns the old value.
    pub fn get_and_update<E, F>(&self, f: F) -> Stm<E, T>
    where
        E: Send + 'static,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let var = self.clone();
        Stm::from_fn(move |tx| {
            let old = var.read(tx);
            var.write(tx, f(old.clone()));
            Ok(old)
        })
    }

    /// Replace the value, returning the old one.
    pub fn get_and_set<E>(&self, value: T) -> Stm<E, T>
    where
        E: Send + 'static,
    {
        let var = self.clone();
        Stm::from_fn(move |tx| Ok(var.replace(tx, value.clone())))
    }

    /// Compute a result and a new value from the current value.
    ///
    /// ```
    /// # use fstm_core::*;
    /// let var = TVar::new(vec![1, 2, 3]);
    /// let len = var.modify::<(), _, _>(|mut v| {
    ///     v.push(4);
    ///     (v.len(), v)
    /// }).commit().unwrap();
    /// assert_eq!(len, 4);
    /// ```
    pub fn modify<E, B, F>(&self, f: F) -> Stm<E, B>
    where
        E: Send + 'static,
        B: Send + 'static,
        F: Fn(T) -> (B, T) + Send + Sync + 'static,
    {
        let var = self.clone();
        Stm::from_fn(move |tx| {
            let (b, new) = f(var.read(tx));
            var.write(tx, new);
            Ok(b)
        })
    }

    /// Check if two `TVar`s refer to the same position.
    pub fn ref_eq(this: &TVar<T>, other: &TVar<T>) -> bool {
        Arc::ptr_eq(&this.control_block, &other.control_block)
    }

    /// Access the control block of the var.
    ///
    /// Internal use only!
    pub fn control_block(&self) -> &Arc<VarControlBlock> {
        &self.control_block
    }
}

/// Debug output a struct.
///
/// Note that this function does not print the state atomically.
/// If another thread modifies the datastructure at the same time, it may print an inconsistent state.
/// If you need an accurate view, that reflects current thread-local state, you can implement it easily yourself with
/// a transaction.
impl<T> Debug for TVar<T>
where
    T: Any + Sync + Send + Clone,
    T: Debug,
{
    #[inline(never)]
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let x = self.read_atomic();
        f.debug_struct("TVar")
            .field("id", &self.id())
            .field("version", &self.version())
            .field("value", &x)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    // Test if creating and reading a TVar works.
    fn test_read_atomic() {
        let var = TVar::new(42);

        assert_eq!(42, var.read_atomic());
        assert_eq!(0, var.version());
    }

    #[test]
    fn ids_follow_creation_order() {
        let a = TVar::new(1);
        let b = TVar::new(2);
        assert!(a.id() < b.id());
    }

    #[test]
    fn get_initial_value() {
        let var = TVar::new(14);
        assert_eq!(var.get::<()>().commit(), Ok(14));
    }

    #[test]
    fn set_new_value() {
        let var = TVar::new(14);
        let x = var.set::<()>(42).zip_right(&var.get()).commit();
        assert_eq!(x, Ok(42));
        assert_eq!(var.version(), 1);
    }

    #[test]
    fn make_inside_transaction() {
        let x = TVar::make::<()>(14)
            .flat_map(|var| var.set(42).zip_right(&var.get()))
            .commit();
        assert_eq!(x, Ok(42));
    }

    #[test]
    fn get_and_update_returns_old() {
        let var = TVar::new(1);
        let old = var.get_and_update::<(), _>(|x| x + 1).commit();
        assert_eq!(old, Ok(1));
        assert_eq!(var.read_atomic(), 2);
    }

    #[test]
    fn update_and_get_returns_new() {
        let var = TVar::new(1);
        let new = var.update_and_get::<(), _>(|x| x + 1).commit();
        assert_eq!(new, Ok(2));
    }

    #[test]
    fn get_and_set_returns_old() {
        let var = TVar::new("a");
        assert_eq!(var.get_and_set::<()>("b").commit(), Ok("a"));
        assert_eq!(var.read_atomic(), "b");
    }

    #[test]
    fn debug_prints_value() {
        let var = TVar::new(7);
        assert!(format!("{:?}", var).contains("value: 7"));
    }
}
