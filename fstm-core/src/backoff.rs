// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::time::Duration;

/// How long `Stm::commit_eventually` sleeps after a failed commit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Always sleep the same time.
    Fixed(Duration),

    /// Start with `initial` and multiply by `factor` after every failure,
    /// but never sleep longer than `max`.
    Exponential {
        initial: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Backoff {
    /// The delay after `failures` earlier failures.
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                factor,
                max,
            } => {
                let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
                let nanos = initial.as_nanos() as f64 * factor.max(1.0).powi(exponent);
                if nanos.is_finite() && nanos < max.as_nanos() as f64 {
                    Duration::from_nanos(nanos as u64)
                } else {
                    max
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::Exponential {
            initial: Duration::from_millis(1),
            factor: 2.0,
            max: Duration::from_millis(100),
        }
    }
}
