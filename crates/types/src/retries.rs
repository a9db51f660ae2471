// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies used when an optimistic write loses against a concurrent writer.

use std::borrow::Cow;
use std::cmp;
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;
use serde_with::serde_as;

const DEFAULT_JITTER_MULTIPLIER: f32 = 0.3;

/// Policy to space out retries.
///
/// ```rust
/// use std::time::Duration;
/// use cdc_types::retries::RetryPolicy;
///
/// let policy = RetryPolicy::fixed_delay(Duration::from_millis(100), None);
/// let mut delays = policy.into_iter();
/// assert!(delays.next().is_some());
/// ```
#[serde_as]
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// Don't retry.
    #[default]
    None,
    /// Wait `interval` between attempts.
    FixedDelay {
        #[serde_as(as = "serde_with::DisplayFromStr")]
        interval: humantime::Duration,
        /// Infinite retries if unset.
        max_attempts: Option<NonZeroUsize>,
    },
    /// The next delay is `min(last_delay * factor, max_interval)`.
    Exponential {
        #[serde_as(as = "serde_with::DisplayFromStr")]
        initial_interval: humantime::Duration,
        factor: f32,
        max_attempts: Option<NonZeroUsize>,
        #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
        max_interval: Option<humantime::Duration>,
    },
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<NonZeroUsize>) -> Self {
        Self::FixedDelay {
            interval: interval.into(),
            max_attempts,
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<NonZeroUsize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval: initial_interval.into(),
            factor,
            max_attempts,
            max_interval: max_interval.map(Into::into),
        }
    }

    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Retries `operation` as long as `condition` holds for its error and the policy
    /// has attempts left.
    pub async fn retry_if<T, E, Fn, Fut, C>(
        self,
        mut operation: Fn,
        mut condition: C,
    ) -> Result<T, E>
    where
        Fn: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnMut(&E) -> bool,
    {
        let mut retry_iter = self.into_iter();
        loop {
            match operation().await {
                Ok(res) => return Ok(res),
                Err(err) if condition(&err) => match retry_iter.next() {
                    Some(pause) => tokio::time::sleep(pause).await,
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    pub fn iter(&self) -> RetryIter<'_> {
        RetryIter {
            policy: Cow::Borrowed(self),
            attempts: 0,
            last_retry: None,
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter<'static>;

    fn into_iter(self) -> Self::IntoIter {
        RetryIter {
            policy: Cow::Owned(self),
            attempts: 0,
            last_retry: None,
        }
    }
}

#[derive(Debug)]
pub struct RetryIter<'a> {
    policy: Cow<'a, RetryPolicy>,
    attempts: usize,
    last_retry: Option<Duration>,
}

impl RetryIter<'_> {
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    fn exhausted(&self) -> bool {
        self.policy
            .max_attempts()
            .is_some_and(|limit| self.attempts > limit.get())
    }
}

impl Iterator for RetryIter<'_> {
    type Item = Duration;

    /// Adds up to 30% of the delay as jitter.
    fn next(&mut self) -> Option<Self::Item> {
        self.attempts += 1;
        if self.exhausted() {
            return None;
        }
        let delay = match self.policy.as_ref() {
            RetryPolicy::None => return None,
            RetryPolicy::FixedDelay { interval, .. } => **interval,
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_interval,
                ..
            } => {
                let next = match self.last_retry {
                    Some(last) => cmp::min(
                        last.mul_f32(*factor),
                        max_interval.map(Into::into).unwrap_or(Duration::MAX),
                    ),
                    None => **initial_interval,
                };
                self.last_retry = Some(next);
                next
            }
        };
        Some(with_jitter(delay, DEFAULT_JITTER_MULTIPLIER))
    }
}

// Jitter ranges from 3ms to (max_multiplier * duration). The lower bound keeps retries off
// round values where many writers would otherwise line up.
static MIN_JITTER: Duration = Duration::from_millis(3);

pub fn with_jitter(duration: Duration, max_multiplier: f32) -> Duration {
    let max_jitter = duration.mul_f32(max_multiplier);
    if max_jitter <= MIN_JITTER {
        duration + MIN_JITTER
    } else {
        duration + rand::rng().random_range(MIN_JITTER..max_jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};

    use googletest::prelude::*;
    use test_log::test;

    fn within_jitter(expected: Duration, actual: Duration) -> bool {
        actual >= expected + MIN_JITTER
            && actual <= expected + expected.mul_f32(DEFAULT_JITTER_MULTIPLIER)
    }

    #[test]
    fn none_never_retries() {
        assert_that!(RetryPolicy::None.into_iter().next(), none());
    }

    #[test]
    fn fixed_delay_respects_max_attempts() {
        let delays = RetryPolicy::fixed_delay(Duration::from_millis(100), NonZeroUsize::new(3))
            .into_iter()
            .collect::<Vec<_>>();
        assert_that!(delays, len(eq(3)));
        for delay in delays {
            assert!(within_jitter(Duration::from_millis(100), delay));
        }
    }

    #[test]
    fn exponential_is_capped() {
        let delays = RetryPolicy::exponential(
            Duration::from_millis(100),
            2.0,
            NonZeroUsize::new(5),
            Some(Duration::from_millis(500)),
        )
        .into_iter()
        .collect::<Vec<_>>();
        let expected = [100, 200, 400, 500, 500].map(Duration::from_millis);
        assert_that!(delays, len(eq(expected.len())));
        for (expected, actual) in expected.into_iter().zip(delays) {
            assert!(within_jitter(expected, actual));
        }
    }

    #[test]
    fn serde_uses_humantime() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"type": "fixed-delay", "interval": "250ms", "max-attempts": 10}"#,
        )
        .unwrap();
        assert_eq!(
            policy,
            RetryPolicy::fixed_delay(Duration::from_millis(250), NonZeroUsize::new(10))
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn conditional_retry() {
        let policy = RetryPolicy::fixed_delay(Duration::from_millis(100), NonZeroUsize::new(10));
        let attempts = AtomicU64::new(0);

        let result = policy
            .retry_if(
                || {
                    let previous = attempts.fetch_add(1, Ordering::Relaxed);
                    std::future::ready(Err::<(), _>(previous))
                },
                |err| *err < 5,
            )
            .await;

        assert_eq!(result, Err(5));
    }
}
