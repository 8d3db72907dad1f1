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

use prometheus::{
    Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::types::ChainId;
use crate::Result;

/// A struct definition for collecting metrics in the relayer.
///
/// Counters live in a private registry, so tests can build as many
/// instances as they like without name collisions.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Blocks fully processed across all chains.
    pub blocks_processed: IntCounter,
    /// Messages handed from listeners to writers.
    pub messages_dispatched: IntCounter,
    /// Transactions accepted by a chain endpoint.
    pub transactions_submitted: IntCounter,
    /// Submission attempts that had to be retried.
    pub transaction_retries: IntCounter,
    /// Submissions the chain reported as already landed.
    pub duplicates_acked: IntCounter,
    /// Operator alerts emitted.
    pub alerts_emitted: IntCounter,
    /// Last processed block per chain.
    pub last_processed_block: IntGaugeVec,
}

impl Metrics {
    /// Instantiates the counters and registers them.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let blocks_processed = IntCounter::new(
            "blocks_processed",
            "The total number of blocks fully processed",
        )?;
        let messages_dispatched = IntCounter::new(
            "messages_dispatched",
            "The total number of messages handed to destination writers",
        )?;
        let transactions_submitted = IntCounter::new(
            "transactions_submitted",
            "The total number of transactions accepted by a chain endpoint",
        )?;
        let transaction_retries = IntCounter::new(
            "transaction_retries",
            "The total number of submission attempts that were retried",
        )?;
        let duplicates_acked = IntCounter::new(
            "duplicates_acked",
            "Submissions the chain reported as duplicates, acked as success",
        )?;
        let alerts_emitted = IntCounter::new(
            "alerts_emitted",
            "The total number of operator alerts emitted",
        )?;
        let last_processed_block = IntGaugeVec::new(
            Opts::new(
                "last_processed_block",
                "Last fully processed block, per chain",
            ),
            &["chain"],
        )?;
        registry.register(Box::new(blocks_processed.clone()))?;
        registry.register(Box::new(messages_dispatched.clone()))?;
        registry.register(Box::new(transactions_submitted.clone()))?;
        registry.register(Box::new(transaction_retries.clone()))?;
        registry.register(Box::new(duplicates_acked.clone()))?;
        registry.register(Box::new(alerts_emitted.clone()))?;
        registry.register(Box::new(last_processed_block.clone()))?;
        Ok(Self {
            registry,
            blocks_processed,
            messages_dispatched,
            transactions_submitted,
            transaction_retries,
            duplicates_acked,
            alerts_emitted,
            last_processed_block,
        })
    }

    /// Records the cursor position of a chain.
    pub fn record_block(&self, chain: ChainId, height: u64) {
        let label = chain.to_string();
        self.last_processed_block
            .with_label_values(&[label.as_str()])
            .set(height as i64);
    }

    /// Serializes the registry in the Prometheus text format.
    pub fn gather(&self) -> Result<String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.blocks_processed.inc();
        assert_eq!(b.blocks_processed.get(), 0);
    }

    #[test]
    fn gauges_show_up_in_the_text_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.record_block(ChainId(97), 1234);
        let text = metrics.gather().unwrap();
        assert!(text.contains("last_processed_block"));
        assert!(text.contains("1234"));
    }
}
