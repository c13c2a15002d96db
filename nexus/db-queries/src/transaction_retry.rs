// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helper types for performing automatic transaction retries

use chrono::Utc;
use rand::{thread_rng, Rng};
use slog::Logger;
use std::sync::Mutex;
use std::time::Duration;

struct RetryHelperInner {
    start: chrono::DateTime<Utc>,
    attempts: u32,
}

impl RetryHelperInner {
    fn new() -> Self {
        Self { start: Utc::now(), attempts: 1 }
    }

    fn tick(&mut self) -> Self {
        let start = self.start;
        let attempts = self.attempts;

        self.start = Utc::now();
        self.attempts += 1;

        Self { start, attempts }
    }
}

/// Helper utility for tracking retry attempts and latency.
///
/// Intended to wrap operations that fail with a retryable error (today, a
/// timed-out wait for a capacity row lock).
pub struct RetryHelper {
    log: Logger,
    name: &'static str,
    max_attempts: u32,
    inner: Mutex<RetryHelperInner>,
}

const MIN_RETRY_BACKOFF: Duration = Duration::from_millis(0);
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(50);
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

impl RetryHelper {
    /// Creates a new RetryHelper, and starts a timer tracking the transaction
    /// duration.
    pub fn new(log: &Logger, name: &'static str) -> Self {
        Self {
            log: log.new(o!("transaction" => name)),
            name,
            max_attempts: MAX_RETRY_ATTEMPTS,
            inner: Mutex::new(RetryHelperInner::new()),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The attempt currently in progress, starting at 1.
    pub fn attempts(&self) -> u32 {
        self.inner.lock().unwrap().attempts
    }

    // Called upon retryable transaction failure.
    //
    // This function:
    // - Logs the duration of the failed attempt
    // - Performs a random (uniform) backoff (limited to less than 50 ms)
    // - Returns "true" if the transaction should be restarted
    pub async fn retry_callback(&self) -> bool {
        // Look at the current attempt and start time so we can log this
        // information before we start sleeping.
        let (start, attempt) = {
            let inner = self.inner.lock().unwrap();
            (inner.start, inner.attempts)
        };

        let latency = (Utc::now() - start)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();

        debug!(
            self.log,
            "retryable failure";
            "attempt" => attempt,
            "latency_secs" => latency,
        );

        // This backoff is not exponential. If we're repeatedly failing, the
        // contention is better surfaced to the caller than hidden here.
        let duration = {
            let mut rng = thread_rng();
            rng.gen_range(MIN_RETRY_BACKOFF..MAX_RETRY_BACKOFF)
        };
        tokio::time::sleep(duration).await;

        // Now that we've finished sleeping, reset the timer and bump the number
        // of attempts we've tried.
        let inner = self.inner.lock().unwrap().tick();
        let retry = inner.attempts < self.max_attempts;
        if !retry {
            warn!(
                self.log,
                "giving up after repeated retryable failures";
                "attempts" => inner.attempts,
            );
        }
        retry
    }
}
