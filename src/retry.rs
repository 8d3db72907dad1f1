// Copyright 2024 Atlas Relayer Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry policies for the chain pipelines.

use std::time::Duration;

use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};

const fn default_poll_interval_ms() -> u64 {
    3_000
}

const fn default_block_retry_interval_ms() -> u64 {
    5_000
}

const fn default_tx_retry_interval_ms() -> u64 {
    10_000
}

const fn default_messenger_interval_ms() -> u64 {
    30_000
}

const fn default_tx_status_timeout_ms() -> u64 {
    180_000
}

const fn default_alert_threshold() -> u64 {
    10
}

/// Every timer the listener and writer use, fixed at construction.
///
/// The per-chain pipelines never invent their own intervals: anything that
/// sleeps reads it from here, which keeps the retry behaviour of a chain
/// reviewable in one place in its configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPolicy {
    /// How long to wait before re-checking the chain tip when the cursor
    /// has caught up to `latest - confirmations`, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval: u64,
    /// How long to wait before retrying a block whose processing failed,
    /// in milliseconds.
    #[serde(default = "default_block_retry_interval_ms")]
    pub block_retry_interval: u64,
    /// How long the writer waits between submission attempts, in
    /// milliseconds.
    #[serde(default = "default_tx_retry_interval_ms")]
    pub tx_retry_interval: u64,
    /// The long sleep used when the listener is at the tip, in
    /// milliseconds.
    #[serde(default = "default_messenger_interval_ms")]
    pub messenger_interval: u64,
    /// How long to poll for a transaction receipt before giving up, in
    /// milliseconds.
    #[serde(default = "default_tx_status_timeout_ms")]
    pub tx_status_timeout: u64,
    /// Emit an alert after this many consecutive failures.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval_ms(),
            block_retry_interval: default_block_retry_interval_ms(),
            tx_retry_interval: default_tx_retry_interval_ms(),
            messenger_interval: default_messenger_interval_ms(),
            tx_status_timeout: default_tx_status_timeout_ms(),
            alert_threshold: default_alert_threshold(),
        }
    }
}

impl RetryPolicy {
    /// The short sleep used while waiting for confirmations.
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    /// The sleep used before retrying a failed block.
    pub fn block_retry(&self) -> Duration {
        Duration::from_millis(self.block_retry_interval)
    }

    /// The sleep used between transaction submission attempts.
    pub fn tx_retry(&self) -> Duration {
        Duration::from_millis(self.tx_retry_interval)
    }

    /// The long sleep used once the listener is at the chain tip.
    pub fn messenger(&self) -> Duration {
        Duration::from_millis(self.messenger_interval)
    }

    /// How long the writer polls for a receipt.
    pub fn tx_status_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_status_timeout)
    }

    /// A policy with millisecond-scale intervals, for tests.
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            poll_interval: 5,
            block_retry_interval: 5,
            tx_retry_interval: 5,
            messenger_interval: 5,
            tx_status_timeout: 50,
            alert_threshold: 3,
        }
    }
}

/// Constant with Max Retry Count is a backoff policy which always returns
/// a constant duration, until it exceeds the maximum retry count.
#[derive(Debug)]
pub struct ConstantWithMaxRetryCount {
    interval: Duration,
    max_retry_count: usize,
    count: usize,
}

impl ConstantWithMaxRetryCount {
    /// Creates a new Constant backoff with `interval` and `max_retry_count`.
    /// `interval` is the duration to wait between retries, and
    /// `max_retry_count` is the maximum number of retries, after which we
    /// return `None` to indicate that we should stop retrying.
    pub fn new(interval: Duration, max_retry_count: usize) -> Self {
        Self {
            interval,
            max_retry_count,
            count: 0,
        }
    }
}

impl Backoff for ConstantWithMaxRetryCount {
    fn next_backoff(&mut self) -> Option<Duration> {
        (self.count < self.max_retry_count).then(|| {
            self.count += 1;
            self.interval
        })
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}
