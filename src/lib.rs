// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements [software transactional memory]
//! (https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM.
//!
//! The engine lives in `fstm-core` and is re-exported here. Transactions
//! are values of type `Stm<E, A>`: build them from `TVar` operations and
//! combinators, then run them with `commit` or `commit_async`.
//!
//! ```
//! use fstm::{Stm, TVar};
//!
//! let sender = TVar::new(100);
//! let receiver = TVar::new(0);
//!
//! let transfer = sender
//!     .get::<&str>()
//!     .reject(|balance| if *balance < 30 { Some("insufficient funds") } else { None })
//!     .zip_right(&sender.update(|n| n - 30))
//!     .zip_right(&receiver.update(|n| n + 30));
//!
//! transfer.commit().unwrap();
//! assert_eq!(receiver.read_atomic(), 30);
//! ```
//!
//! `collections` contains data structures built from transactions.
//!
//! # STM safety
//!
//! Software transactional memory is completely safe in the terms
//! that rust considers safe. Still there are multiple rules that
//! you should obey when dealing with software transactional memory:
//!
//! * Don't run code with side effects, especially no IO-code,
//! because stm is designed to be run multiple times.
//! * Don't commit inside of another transaction. When you use STM in the
//! inner of a function then return a `Stm` instead so that callers can
//! safely compose it into larger blocks.
//! * Don't mix locks and STM. Your code will easily deadlock or slow
//! down unpredictably.
//! * When you put an `Arc` into a `TVar` don't use inner mutability
//! to modify it since the inner still points to the original value.

pub mod collections;

pub use fstm_core::*;
