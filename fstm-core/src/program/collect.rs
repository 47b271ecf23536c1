// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Combinators over many transactions.
//!
//! All of them run their parts strictly from left to right inside a single
//! attempt. The parts are built one by one while the attempt runs, so long
//! inputs do not nest programs.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Stm;

/// Run `step(0)`, `step(1)`, ... `step(len - 1)` in sequence.
fn sequence<E, F>(len: usize, step: Arc<F>) -> Stm<E, ()>
where
    E: Send + 'static,
    F: Fn(usize) -> Stm<E, ()> + Send + Sync + 'static,
{
    fn from<E, F>(index: usize, len: usize, step: Arc<F>) -> Stm<E, ()>
    where
        E: Send + 'static,
        F: Fn(usize) -> Stm<E, ()> + Send + Sync + 'static,
    {
        if index >= len {
            return Stm::unit();
        }
        let next = step.clone();
        step(index).flat_map(move |()| from(index + 1, len, next.clone()))
    }

    from(0, len, step)
}

/// Apply `f` to every item and collect the results.
fn collect_with<E, A, B, F>(items: Arc<Vec<A>>, f: Arc<F>) -> Stm<E, Vec<B>>
where
    E: Send + 'static,
    A: Clone + Send + Sync + 'static,
    B: Send + 'static,
    F: Fn(A) -> Stm<E, B> + Send + Sync + 'static,
{
    Stm::suspend(move || {
        // One buffer per attempt.
        let len = items.len();
        let out = Arc::new(Mutex::new(Vec::with_capacity(len)));
        let push = out.clone();
        let items = items.clone();
        let f = f.clone();
        let step = move |i: usize| {
            let push = push.clone();
            f(items[i].clone()).map(move |b| push.lock().push(b))
        };

        sequence(len, Arc::new(step)).map(move |()| mem::take(&mut *out.lock()))
    })
}

/// Run all transactions in order and collect their results.
///
/// ```
/// # use fstm_core::*;
/// let x = collect_all(vec![Stm::<(), _>::succeed(1), Stm::succeed(2)]).commit();
/// assert_eq!(x, Ok(vec![1, 2]));
/// ```
pub fn collect_all<E, A, I>(stms: I) -> Stm<E, Vec<A>>
where
    E: Send + 'static,
    A: Send + 'static,
    I: IntoIterator<Item = Stm<E, A>>,
{
    let stms: Vec<Stm<E, A>> = stms.into_iter().collect();
    collect_with(Arc::new(stms), Arc::new(|stm: Stm<E, A>| stm))
}

/// Run the transaction built by `f` for every item and collect the results.
pub fn for_each<E, A, B, I, F>(items: I, f: F) -> Stm<E, Vec<B>>
where
    E: Send + 'static,
    A: Clone + Send + Sync + 'static,
    B: Send + 'static,
    I: IntoIterator<Item = A>,
    F: Fn(A) -> Stm<E, B> + Send + Sync + 'static,
{
    let items: Vec<A> = items.into_iter().collect();
    collect_with(Arc::new(items), Arc::new(f))
}

/// Fold the items from the left with a transactional function.
///
/// ```
/// # use fstm_core::*;
/// let x = reduce(vec!["b", "c"], String::from("a"), |acc, s| {
///     Stm::<(), _>::succeed(acc + s)
/// });
/// assert_eq!(x.commit(), Ok("abc".to_string()));
/// ```
pub fn reduce<E, A, Z, I, F>(items: I, zero: Z, f: F) -> Stm<E, Z>
where
    E: Send + 'static,
    A: Clone + Send + Sync + 'static,
    Z: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = A>,
    F: Fn(Z, A) -> Stm<E, Z> + Send + Sync + 'static,
{
    let items: Arc<Vec<A>> = Arc::new(items.into_iter().collect());
    let f = Arc::new(f);
    Stm::succeed(zero).flat_map(move |z| reduce_from(items.clone(), 0, z, f.clone()))
}

fn reduce_from<E, A, Z, F>(items: Arc<Vec<A>>, index: usize, z: Z, f: Arc<F>) -> Stm<E, Z>
where
    E: Send + 'static,
    A: Clone + Send + Sync + 'static,
    Z: Send + 'static,
    F: Fn(Z, A) -> Stm<E, Z> + Send + Sync + 'static,
{
    match items.get(index) {
        None => Stm::now(z),
        Some(a) => {
            let next = f.clone();
            let rest = items.clone();
            f(z, a.clone()).flat_map(move |z| reduce_from(rest.clone(), index + 1, z, next.clone()))
        }
    }
}

/// Fold the items from the right with a transactional function.
pub fn reduce_right<E, A, Z, I, F>(items: I, zero: Z, f: F) -> Stm<E, Z>
where
    E: Send + 'static,
    A: Clone + Send + Sync + 'static,
    Z: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = A>,
    F: Fn(A, Z) -> Stm<E, Z> + Send + Sync + 'static,
{
    let mut items: Vec<A> = items.into_iter().collect();
    items.reverse();
    reduce(items, zero, move |z, a| f(a, z))
}

/// Run the transaction built by `f` for every item, collecting the failures
/// and the successes separately. Both keep the order of the items.
pub fn partition<E, E2, A, B, I, F>(items: I, f: F) -> Stm<E2, (Vec<E>, Vec<B>)>
where
    E: Send + 'static,
    E2: Send + 'static,
    A: Clone + Send + Sync + 'static,
    B: Send + 'static,
    I: IntoIterator<Item = A>,
    F: Fn(A) -> Stm<E, B> + Send + Sync + 'static,
{
    for_each(items, move |a| f(a).either()).map(|results| {
        let mut failures = Vec::new();
        let mut successes = Vec::new();
        for result in results {
            match result {
                Ok(b) => successes.push(b),
                Err(e) => failures.push(e),
            }
        }
        (failures, successes)
    })
}

/// `n` copies of `stm`. Empty unless `n` is positive.
pub fn replicate<E, A>(n: i64, stm: &Stm<E, A>) -> Vec<Stm<E, A>> {
    let n = usize::try_from(n).unwrap_or(0);
    vec![stm.clone(); n]
}

/// Run `stm` `n` times and collect the results.
pub fn replicate_stm<E, A>(n: i64, stm: &Stm<E, A>) -> Stm<E, Vec<A>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    collect_all(replicate(n, stm))
}

/// Keep the items for which `f` succeeds with `true`.
pub fn filter_list<E, A, I, F>(items: I, f: F) -> Stm<E, Vec<A>>
where
    E: Send + 'static,
    A: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = A>,
    F: Fn(A) -> Stm<E, bool> + Send + Sync + 'static,
{
    for_each(items, move |a: A| {
        let keep = a.clone();
        f(a).map(move |b| if b { Some(keep.clone()) } else { None })
    })
    .map(|kept| kept.into_iter().flatten().collect())
}

/// Keep the items for which `f` succeeds with `false`.
pub fn filter_not_list<E, A, I, F>(items: I, f: F) -> Stm<E, Vec<A>>
where
    E: Send + 'static,
    A: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = A>,
    F: Fn(A) -> Stm<E, bool> + Send + Sync + 'static,
{
    filter_list(items, move |a| f(a).map(|b| !b))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::result::CommitError;
    use crate::TVar;

    #[test]
    fn collect_all_in_order() {
        let var = TVar::new(Vec::new());
        let push = |n: i32| var.update::<(), _>(move |mut v: Vec<i32>| {
            v.push(n);
            v
        });
        let x = collect_all(vec![push(1), push(2), push(3)]).commit();
        assert_eq!(x, Ok(vec![(), (), ()]));
        assert_eq!(var.read_atomic(), vec![1, 2, 3]);
    }

    #[test]
    fn collect_all_is_reusable() {
        let stm = collect_all(vec![Stm::<(), _>::succeed(1), Stm::succeed(2)]);
        assert_eq!(stm.commit(), Ok(vec![1, 2]));
        assert_eq!(stm.commit(), Ok(vec![1, 2]));
    }

    #[test]
    fn collect_all_stops_at_failure() {
        let var = TVar::new(0);
        let x = collect_all(vec![
            var.update(|n| n + 1),
            Stm::fail("boom"),
            var.update(|n| n + 1),
        ])
        .commit();
        assert_eq!(x, Err(CommitError::Failed("boom")));
        assert_eq!(var.read_atomic(), 0);
    }

    #[test]
    fn for_each_long_input() {
        let var = TVar::new(0u64);
        let items: Vec<u64> = (0..50_000).collect();
        let x = for_each(items, {
            let var = var.clone();
            move |n| var.update_and_get::<(), _>(move |sum| sum + n)
        })
        .map(|sums| sums.len())
        .commit();
        assert_eq!(x, Ok(50_000));
        assert_eq!(var.read_atomic(), 50_000 * 49_999 / 2);
    }

    #[test]
    fn reduce_from_left() {
        let x = reduce(vec![1, 2, 3], String::new(), |acc, n| {
            Stm::<(), _>::succeed(format!("{}{}", acc, n))
        });
        assert_eq!(x.commit(), Ok("123".to_string()));
    }

    #[test]
    fn reduce_right_from_right() {
        let x = reduce_right(vec![1, 2, 3], String::new(), |n, acc| {
            Stm::<(), _>::succeed(format!("{}{}", acc, n))
        });
        assert_eq!(x.commit(), Ok("321".to_string()));
    }

    #[test]
    fn reduce_empty_returns_zero() {
        let x = reduce(Vec::<i32>::new(), 7, |acc, n| Stm::<(), _>::succeed(acc + n));
        assert_eq!(x.commit(), Ok(7));
    }

    #[test]
    fn partition_keeps_order() {
        let x = partition::<_, (), _, _, _, _>(0..10, |n: i32| {
            if n % 2 == 0 {
                Stm::fail(n)
            } else {
                Stm::succeed(n)
            }
        });
        assert_eq!(x.commit(), Ok((vec![0, 2, 4, 6, 8], vec![1, 3, 5, 7, 9])));
    }

    #[test]
    fn replicate_non_positive_is_empty() {
        let stm = Stm::<(), _>::succeed(12);
        assert!(replicate(0, &stm).is_empty());
        assert!(replicate(-2, &stm).is_empty());
        assert_eq!(collect_all(replicate(-2, &stm)).commit(), Ok(vec![]));
    }

    #[test]
    fn replicate_positive() {
        let stm = Stm::<(), _>::succeed(12);
        assert_eq!(replicate_stm(2, &stm).commit(), Ok(vec![12, 12]));
    }

    #[test]
    fn filter_list_keeps_matching() {
        let x = filter_list(vec![2, 4, 6, 3, 5, 6], |n| Stm::<(), _>::succeed(n % 2 == 0));
        assert_eq!(x.commit(), Ok(vec![2, 4, 6, 6]));
    }

    #[test]
    fn filter_not_list_drops_matching() {
        let x = filter_not_list(vec![2, 4, 6, 3, 5, 6], |n| Stm::<(), _>::succeed(n % 2 == 0));
        assert_eq!(x.commit(), Ok(vec![3, 5]));
    }
}
