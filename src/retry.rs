// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Two-Tier Retry Strategy
//!
//! Failed work items go through two tiers:
//!
//! 1. **Application tier**: while attempts remain, the consumer re-publishes
//!    the envelope to its own queue after a capped exponential backoff,
//!    carrying `retry-count` = attempts so far.
//! 2. **Broker tier**: once attempts are exhausted the delivery is rejected
//!    without requeue and the broker's dead-letter routing, preset on the
//!    queue, moves it to the DLQ.
//!
//! The decision is a pure function of the handler outcome and the envelope's
//! retry count. Timing goes through `RetryScheduler` so it can be replaced in
//! tests.

use crate::errors::HandlerError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::time::Duration;

/// Backoff base: attempt `k` waits `BASE_DELAY_MS * 2^k`.
pub const BASE_DELAY_MS: u64 = 1000;
/// Upper bound of the backoff.
pub const MAX_DELAY_MS: u64 = 60_000;

/// What the consumer does with a delivery after the handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge, the work item is done
    Ack,
    /// Re-publish after `delay` with `retry-count` = `retry_count`
    Retry { retry_count: u32, delay: Duration },
    /// Reject without requeue so the broker dead-letters it
    DeadLetter { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries }
    }

    /// `min(1000 * 2^retry_count, 60000)` milliseconds.
    pub fn delay(retry_count: u32) -> Duration {
        let ms = 1u64
            .checked_shl(retry_count)
            .and_then(|factor| BASE_DELAY_MS.checked_mul(factor))
            .map_or(MAX_DELAY_MS, |ms| ms.min(MAX_DELAY_MS));
        Duration::from_millis(ms)
    }

    /// Maps a handler outcome and the previous `retry-count` to a disposition.
    pub fn decide(&self, outcome: &Result<(), HandlerError>, previous: u32) -> Disposition {
        match outcome {
            Ok(()) => Disposition::Ack,
            Err(HandlerError::Malformed(_)) => Disposition::DeadLetter {
                attempts: previous.saturating_add(1),
            },
            Err(HandlerError::Failed(_)) => {
                let retry_count = previous.saturating_add(1);
                if retry_count < self.max_retries {
                    Disposition::Retry {
                        retry_count,
                        delay: RetryPolicy::delay(retry_count),
                    }
                } else {
                    Disposition::DeadLetter {
                        attempts: retry_count,
                    }
                }
            }
        }
    }
}

/// Runs deferred work after a delay.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    /// Runs `task` once `delay` has elapsed, without blocking the caller.
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>);

    /// Suspends the caller for `delay`.
    async fn wait(&self, delay: Duration);
}

/// Timer-backed scheduler on the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRetryScheduler;

#[async_trait]
impl RetryScheduler for TokioRetryScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }

    async fn wait(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::{Arc, Mutex};

    /// Records every requested delay and runs work immediately.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingScheduler {
        pub(crate) delays: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingScheduler {
        pub(crate) fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RetryScheduler for RecordingScheduler {
        fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
            self.delays.lock().unwrap().push(delay);
            tokio::spawn(task);
        }

        async fn wait(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let expected = [
            (1, 2_000),
            (2, 4_000),
            (3, 8_000),
            (4, 16_000),
            (5, 32_000),
            (6, 60_000),
            (7, 60_000),
            (40, 60_000),
            (64, 60_000),
            (u32::MAX, 60_000),
        ];
        for (k, ms) in expected {
            assert_eq!(RetryPolicy::delay(k), Duration::from_millis(ms), "k = {k}");
        }
    }

    #[test]
    fn retry_delays_stay_within_bounds() {
        let policy = RetryPolicy::new(50);
        for previous in 0..49 {
            match policy.decide(&Err(HandlerError::failed("boom")), previous) {
                Disposition::Retry { retry_count, delay } => {
                    assert_eq!(retry_count, previous + 1);
                    assert!(delay >= Duration::from_secs(2));
                    assert!(delay <= Duration::from_secs(60));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn success_acks_whatever_the_count() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(&Ok(()), 0), Disposition::Ack);
        assert_eq!(policy.decide(&Ok(()), 2), Disposition::Ack);
    }

    #[test]
    fn failures_retry_until_max_then_dead_letter() {
        let policy = RetryPolicy::default();
        let failure = Err(HandlerError::failed("declined"));

        assert_eq!(
            policy.decide(&failure, 0),
            Disposition::Retry {
                retry_count: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.decide(&failure, 1),
            Disposition::Retry {
                retry_count: 2,
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(
            policy.decide(&failure, 2),
            Disposition::DeadLetter { attempts: 3 }
        );
    }

    #[test]
    fn single_attempt_policy_dead_letters_first_failure() {
        let policy = RetryPolicy::new(1);
        assert_eq!(
            policy.decide(&Err(HandlerError::failed("x")), 0),
            Disposition::DeadLetter { attempts: 1 }
        );
    }

    #[test]
    fn malformed_messages_skip_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&Err(HandlerError::Malformed("eof".to_owned())), 0),
            Disposition::DeadLetter { attempts: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_runs_after_delay() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let started = tokio::time::Instant::now();

        TokioRetryScheduler.schedule(
            Duration::from_secs(4),
            async move {
                *flag.lock().unwrap() = true;
            }
            .boxed(),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!*ran.lock().unwrap());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(*ran.lock().unwrap());
        assert!(started.elapsed() >= Duration::from_secs(4));
    }
}
