// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry a condition until it holds or a deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

// Lower bound on the sleep between attempts.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(thiserror::Error, Debug)]
pub enum Error<E> {
    /// The condition itself failed. Not retried.
    #[error("condition failed: {0}")]
    Condition(E),
    #[error("condition not met after {attempts} attempts in {elapsed:?}")]
    Timeout { elapsed: Duration, attempts: u32 },
}

/// Evaluates `condition` immediately and then every `interval` until it returns
/// `Ok(true)`, returns an error, or `timeout` has elapsed.
///
/// `Ok(false)` means "not yet". The wait before each retry is cut short so the poll
/// never runs past the deadline by more than one condition evaluation.
pub async fn poll<F, Fut, E>(interval: Duration, timeout: Duration, mut condition: F) -> Result<(), Error<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let interval = interval.max(MIN_INTERVAL);
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts = next_attempt(attempts);
        if condition().await.map_err(Error::Condition)? {
            trace!(attempts, elapsed = ?start.elapsed(), "condition met");
            return Ok(());
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::Timeout { elapsed, attempts });
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}

// Very long polls with a tiny interval must not overflow the count.
fn next_attempt(attempts: u32) -> u32 {
    attempts.saturating_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(
        retries: u32,
    ) -> (
        Arc<AtomicU32>,
        impl FnMut() -> std::future::Ready<Result<bool, String>>,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let condition = move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(n >= retries))
        };
        (calls, condition)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_immediately() {
        let (calls, condition) = counting(0);
        let start = Instant::now();
        poll(Duration::from_secs(1), Duration::from_secs(5), condition)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        for k in [1u32, 3, 7] {
            let (calls, condition) = counting(k);
            let interval = Duration::from_millis(100);
            let start = Instant::now();
            poll(interval, Duration::from_secs(60), condition)
                .await
                .unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), k + 1);
            assert!(start.elapsed() >= interval * k);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_within_one_interval_of_deadline() {
        let interval = Duration::from_millis(300);
        let deadline = Duration::from_secs(1);
        let start = Instant::now();
        let res = poll(interval, deadline, || async { Ok::<_, String>(false) }).await;
        let elapsed = start.elapsed();
        match res {
            Err(Error::Timeout {
                elapsed: reported,
                attempts,
            }) => {
                assert!(reported >= deadline);
                // 0, 300, 600, 900 and the final attempt at the deadline.
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(elapsed >= deadline);
        assert!(elapsed < deadline + interval);
    }

    #[tokio::test(start_paused = true)]
    async fn condition_error_stops_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res = poll(Duration::from_millis(10), Duration::from_secs(5), move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 2 {
                    Err("service returned 500".to_string())
                } else {
                    Ok(false)
                }
            }
        })
        .await;
        match res {
            Err(Error::Condition(e)) => assert_eq!(e, "service returned 500"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinct_from_condition_error() {
        let res = poll(Duration::from_millis(10), Duration::ZERO, || async {
            Ok::<_, String>(false)
        })
        .await;
        assert!(matches!(res, Err(Error::Timeout { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_sleeps() {
        let (calls, condition) = counting(u32::MAX);
        let res = poll(Duration::ZERO, Duration::from_millis(10), condition).await;
        assert!(matches!(res, Err(Error::Timeout { .. })));
        // One attempt per millisecond, plus the first.
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn attempt_count_saturates() {
        assert_eq!(next_attempt(0), 1);
        assert_eq!(next_attempt(u32::MAX - 1), u32::MAX);
        assert_eq!(next_attempt(u32::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn two_retries_in_real_time() {
        let (calls, condition) = counting(2);
        let start = std::time::Instant::now();
        poll(Duration::from_millis(10), Duration::from_secs(5), condition)
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(5));
    }
}
