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
//
//! # Balance Monitor Module
//!
//! Watches the submitting account of a chain. Two conditions raise an
//! operator alert: the balance dropping below the configured water line,
//! and the balance sitting unchanged for longer than `change-interval`
//! (a relayer that never spends is a relayer whose submissions are not
//! landing). Neither condition touches the relay pipeline.

use std::sync::Arc;
use std::time::Instant;

use ethers::types::U256;

use crate::client::ChainClient;
use crate::config::ChainConfig;
use crate::context::RelayerContext;
use crate::Result;

/// Per-chain background balance watcher.
pub struct BalanceMonitor {
    config: ChainConfig,
    client: Arc<dyn ChainClient>,
    ctx: RelayerContext,
}

impl BalanceMonitor {
    /// Creates the monitor for one chain.
    pub fn new(
        config: ChainConfig,
        client: Arc<dyn ChainClient>,
        ctx: RelayerContext,
    ) -> Self {
        Self {
            config,
            client,
            ctx,
        }
    }

    /// The chain this monitor watches.
    pub fn chain_id(&self) -> crate::types::ChainId {
        self.config.id
    }

    /// Whether the chain configures anything worth monitoring.
    pub fn is_enabled(&self) -> bool {
        self.config.water_line().is_some()
            || self.config.change_interval().is_some()
    }

    /// Runs until shutdown.
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.ctx.shutdown_signal();
        if !self.is_enabled() {
            shutdown.recv().await;
            return Ok(());
        }
        let water_line = self.config.water_line();
        let change_interval = self.config.change_interval();
        let mut last_balance: Option<U256> = None;
        let mut last_change = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(self.config.balance_interval()) => {}
            }
            let balance = match self.client.balance(self.config.from).await {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::warn!(
                        chain = %self.config.name,
                        "balance check failed: {}",
                        e
                    );
                    continue;
                }
            };
            tracing::debug!(
                chain = %self.config.name,
                %balance,
                "balance checked"
            );
            if Some(balance) != last_balance {
                last_balance = Some(balance);
                last_change = Instant::now();
            } else if let Some(interval) = change_interval {
                if last_change.elapsed() > interval {
                    self.ctx.alert(format!(
                        "balance of {:?} on {} unchanged for {}s, \
                         submissions may not be landing",
                        self.config.from,
                        self.config.name,
                        last_change.elapsed().as_secs(),
                    ));
                    last_change = Instant::now();
                }
            }
            if let Some(line) = water_line {
                if balance < line {
                    self.ctx.alert(format!(
                        "balance of {:?} on {} is {} wei, below the water \
                         line {}",
                        self.config.from, self.config.name, balance, line,
                    ));
                }
            }
        }
    }
}
