// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

/// An unexpected fault inside a transaction.
///
/// Defects are not seen by `catch_all` and friends. They abort the attempt
/// without publishing anything and always surface to the committing caller.
/// A panic raised inside a transaction is turned into a defect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect carrying `message`.
    pub fn new(message: impl Into<String>) -> Defect {
        Defect {
            message: Arc::from(message.into()),
        }
    }

    /// Convert the payload of a caught panic.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Defect {
        if let Some(s) = payload.downcast_ref::<&'static str>() {
            Defect::new(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Defect::new(s.clone())
        } else {
            Defect::new("transaction panicked with a non-string payload")
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub enum StmError<E> {
    /// `retry` was called.
    ///
    /// It may block until at least one read variable has changed.
    Retry,

    /// The transaction failed with a typed, recoverable error.
    Fail(E),

    /// The transaction hit a defect.
    Die(Defect),
}

/// Marker returned by `guard` and `unwrap_or_retry`.
///
/// It converts into `StmError::Retry` of any error type, so `?` works
/// inside every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry;

impl<E> From<Retry> for StmError<E> {
    fn from(_: Retry) -> StmError<E> {
        StmError::Retry
    }
}

/// StmResult is a result of a single step of a STM calculation.
///
/// It informs of success or the type of failure. Normally you should not
/// handle it yourself but propagate it with `?`. Recovering from an error
/// by hand, e.g. by using `Result::or`, can break the semantics of stm and
/// leak writes of an abandoned branch.
///
/// Use `Stm::or_else`, `Stm::or_try` and `Stm::catch_all` instead.
pub type StmResult<T, E = std::convert::Infallible> = Result<T, StmError<E>>;

/// Failure of `Stm::some_or_fail_exception` on an empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Error)]
#[error("no such element")]
pub struct NoSuchElement;

/// The reason why a commit did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError<E> {
    /// The transaction failed with a typed error and nothing was published.
    #[error("transaction failed: {0:?}")]
    Failed(E),

    /// The transaction died and nothing was published.
    #[error("transaction died: {0}")]
    Died(Defect),

    /// The committing task gave up while waiting for a retry.
    #[error("transaction interrupted while waiting for a change")]
    Interrupted,
}

impl<E> CommitError<E> {
    /// Return the typed failure, if this is one.
    pub fn failure(self) -> Option<E> {
        match self {
            CommitError::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, CommitError::Interrupted)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defect_from_str_panic() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(Defect::from_panic(payload).message(), "boom");
    }

    #[test]
    fn defect_from_string_panic() {
        let payload: Box<dyn Any + Send> = Box::new(format!("boom {}", 42));
        assert_eq!(Defect::from_panic(payload).message(), "boom 42");
    }

    #[test]
    fn commit_error_display() {
        let err: CommitError<&str> = CommitError::Failed("boom");
        assert_eq!(err.to_string(), "transaction failed: \"boom\"");

        let err: CommitError<()> = CommitError::Died(Defect::new("bad"));
        assert_eq!(err.to_string(), "transaction died: bad");
    }
}
