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
//! # Relayer Context Module
//!
//! A module for managing the context of the relayer.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::{ChainConfig, RelayerConfig};
use crate::health::HealthState;
use crate::metric::Metrics;
use crate::notifier::Notifier;
use crate::types::ChainId;
use crate::{Error, Result};

/// RelayerContext contains the relayer's configuration and the handles
/// every long-running task shares: the shutdown signal, metrics, health
/// state and the alert notifier.
#[derive(Clone)]
pub struct RelayerContext {
    /// The configuration of the relayer.
    pub config: RelayerConfig,
    /// Broadcasts a shutdown signal to all active tasks.
    ///
    /// The initial `shutdown` trigger is provided by the caller. When a
    /// task is spawned, it is passed a broadcast receiver handle. When a
    /// graceful shutdown is initiated, a `()` value is sent; each active
    /// task receives it, reaches a safe terminal state, and completes.
    notify_shutdown: broadcast::Sender<()>,
    /// Represents the metrics for the relayer.
    pub metrics: Arc<Metrics>,
    /// Per-chain progress for the health endpoint.
    pub health: HealthState,
    /// Out-of-band operator alerts.
    pub notifier: Arc<Notifier>,
}

impl RelayerContext {
    /// Creates a new RelayerContext.
    pub fn new(config: RelayerConfig) -> Result<Self> {
        let (notify_shutdown, _) = broadcast::channel(2);
        let metrics = Arc::new(Metrics::new()?);
        let notifier = Arc::new(Notifier::new(config.alert_hook.clone()));
        Ok(Self {
            config,
            notify_shutdown,
            metrics,
            health: HealthState::default(),
            notifier,
        })
    }

    /// Returns a broadcast receiver handle for the shutdown signal.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends a shutdown signal to all subscribed tasks.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// Emits an operator alert and counts it.
    pub fn alert(&self, text: impl Into<String>) {
        self.metrics.alerts_emitted.inc();
        self.notifier.alert(text);
    }

    /// The configuration of the chain with `chain_id`, hub included.
    pub fn chain(&self, chain_id: ChainId) -> Result<&ChainConfig> {
        std::iter::once(&self.config.hub_chain)
            .chain(&self.config.chains)
            .find(|c| c.id == chain_id)
            .ok_or(Error::ChainNotFound { chain_id })
    }

    /// Whether `chain_id` is on the recompute-receipts-root allow-list.
    pub fn recomputes_receipts_root(&self, chain_id: ChainId) -> bool {
        self.config.recompute_receipt_chains.contains(&chain_id)
    }
}

/// Listens for the shutdown signal.
///
/// Shutdown is signalled using a `broadcast::Receiver`. Only a single
/// value is ever sent. Once a value has been sent via the broadcast
/// channel, the task should shut down.
///
/// The `Shutdown` struct listens for the signal and tracks that the
/// signal has been received. Callers may query for whether the shutdown
/// signal has been received or not.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received.
    shutdown: bool,
    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        // If the shutdown signal has already been received, then return
        // immediately.
        if self.shutdown {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        // Remember that the signal has been received.
        self.shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::retry::RetryPolicy;
    use ethers::types::Address;

    fn minimal_config() -> RelayerConfig {
        let hub = ChainConfig {
            name: "hub".into(),
            id: ChainId(212),
            endpoint: "http://localhost:7445".parse().unwrap(),
            from: Address::zero(),
            keystore_ref: Some("hub.json".into()),
            private_key: None,
            start_block: 0,
            fresh_start: false,
            latest_only: false,
            confirmations: 10,
            event_selectors: vec![],
            sync_to_hub: true,
            sync_chain_ids: vec![],
            hub_chain_id: ChainId(212),
            gas_limit: 4_000_000,
            gas_price: None,
            retry: RetryPolicy::default(),
            opts: Default::default(),
        };
        RelayerConfig {
            hub_chain: hub,
            chains: vec![],
            keystore_path: "/tmp/keys".into(),
            blockstore_path: "/tmp/blocks".into(),
            alert_hook: None,
            recompute_receipt_chains: vec![ChainId(4200)],
            metrics: MetricsConfig::default(),
        }
    }

    #[tokio::test]
    async fn shutdown_reaches_all_subscribers() {
        let ctx = RelayerContext::new(minimal_config()).unwrap();
        let mut first = ctx.shutdown_signal();
        let mut second = ctx.shutdown_signal();
        ctx.shutdown();
        first.recv().await;
        second.recv().await;
        // receiving twice returns immediately.
        first.recv().await;
    }

    #[test]
    fn chain_lookup_includes_the_hub() {
        let ctx = RelayerContext::new(minimal_config()).unwrap();
        assert!(ctx.chain(ChainId(212)).is_ok());
        assert!(matches!(
            ctx.chain(ChainId(1)),
            Err(Error::ChainNotFound { .. })
        ));
        assert!(ctx.recomputes_receipts_root(ChainId(4200)));
        assert!(!ctx.recomputes_receipts_root(ChainId(212)));
    }
}
