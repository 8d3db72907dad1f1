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
//! # Service Module
//!
//! The supervisor. Builds the hub chain first (its client handle is
//! shared with every spoke that needs to look up hub state), registers
//! one writer per chain with the router, and starts listeners last. Every
//! background task is named and owned: shutdown is a broadcast, and tasks
//! that outlive the grace period are aborted rather than orphaned.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::blockstore::BlockStore;
use crate::client::{ChainClient, EvmClient};
use crate::context::RelayerContext;
use crate::keystore;
use crate::listener::Listener;
use crate::monitor::BalanceMonitor;
use crate::router::{Router, INBOX_CAPACITY};
use crate::writer::Writer;
use crate::{Error, Result};

/// How long tasks get to reach a quiescent point after the shutdown
/// broadcast.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The composed relay engine, between `build` and `run`.
pub struct Core {
    ctx: RelayerContext,
    router: Arc<Router>,
    sys_err_tx: mpsc::Sender<Error>,
    sys_err_rx: mpsc::Receiver<Error>,
    writers: Vec<Writer>,
    listeners: Vec<Listener>,
    monitors: Vec<BalanceMonitor>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Core {
    /// Wires every configured chain: clients, wallets, writers,
    /// listeners, monitors. Configuration contradictions surface here,
    /// before anything is spawned.
    pub fn build(
        ctx: RelayerContext,
        store: Arc<dyn BlockStore>,
    ) -> Result<Core> {
        let router = Arc::new(Router::new());
        let (sys_err_tx, sys_err_rx) = mpsc::channel(16);

        // the hub comes first; its client handle is shared read-only with
        // the spokes.
        let hub_config = ctx.config.hub_chain.clone();
        let hub_client: Arc<dyn ChainClient> =
            Arc::new(EvmClient::connect(&hub_config.endpoint)?);
        let hub_light_node = hub_config.light_node().ok();

        let mut chains: Vec<(crate::config::ChainConfig, Arc<dyn ChainClient>)> =
            vec![(hub_config, hub_client.clone())];
        for config in &ctx.config.chains {
            let client: Arc<dyn ChainClient> =
                Arc::new(EvmClient::connect(&config.endpoint)?);
            chains.push((config.clone(), client));
        }

        let mut writers = Vec::with_capacity(chains.len());
        let mut listeners = Vec::with_capacity(chains.len());
        let mut monitors = Vec::with_capacity(chains.len());
        for (config, client) in chains {
            let wallet = keystore::wallet_for_chain(
                &config,
                &ctx.config.keystore_path,
            )?;
            let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
            router.register(config.id, inbox_tx);
            writers.push(Writer::new(
                config.clone(),
                client.clone(),
                wallet,
                inbox_rx,
                ctx.clone(),
            )?);
            listeners.push(Listener::new(
                config.clone(),
                client.clone(),
                hub_client.clone(),
                hub_light_node,
                store.clone(),
                router.clone(),
                ctx.clone(),
            )?);
            monitors.push(BalanceMonitor::new(config, client, ctx.clone()));
        }

        Ok(Core {
            ctx,
            router,
            sys_err_tx,
            sys_err_rx,
            writers,
            listeners,
            monitors,
            tasks: Vec::new(),
        })
    }

    /// The router, mainly useful to probe destinations in tests.
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Spawns everything: writers and monitors first, the health server,
    /// then listeners last so nothing is emitted before its destination
    /// exists.
    pub fn start(&mut self) {
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::Lifecycle,
            started = true,
        );
        for writer in self.writers.drain(..) {
            let name = format!("writer-{}", writer.chain_id());
            let sys_err = self.sys_err_tx.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = writer.run().await {
                    let _ = sys_err.send(e).await;
                }
            });
            self.tasks.push((name, handle));
        }
        for monitor in self.monitors.drain(..) {
            let name = format!("monitor-{}", monitor.chain_id());
            let handle = tokio::spawn(async move {
                if let Err(e) = monitor.run().await {
                    tracing::error!("balance monitor stopped: {}", e);
                }
            });
            self.tasks.push((name, handle));
        }
        if let Some(port) = self.ctx.config.metrics.port {
            let ctx = self.ctx.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = crate::health::serve(ctx, port).await {
                    tracing::error!("health server stopped: {}", e);
                }
            });
            self.tasks.push(("health-server".to_string(), handle));
        }
        for listener in self.listeners.drain(..) {
            let name = format!("listener-{}", listener.chain_id());
            let sys_err = self.sys_err_tx.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    let _ = sys_err.send(e).await;
                }
            });
            self.tasks.push((name, handle));
        }
    }

    /// Broadcasts shutdown and joins every task, aborting stragglers
    /// after [`SHUTDOWN_GRACE`].
    pub async fn stop(&mut self) {
        self.ctx.shutdown();
        let (names, handles): (Vec<_>, Vec<_>) =
            self.tasks.drain(..).unzip();
        let aborts: Vec<_> =
            handles.iter().map(|handle| handle.abort_handle()).collect();
        let joined =
            tokio::time::timeout(SHUTDOWN_GRACE, future::join_all(handles))
                .await;
        match joined {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    match result {
                        Ok(()) => tracing::trace!("task {} stopped", name),
                        Err(e) => tracing::error!(
                            "task {} panicked: {}",
                            name,
                            e
                        ),
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    "tasks did not stop within {:?}, aborting the rest",
                    SHUTDOWN_GRACE,
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::Lifecycle,
            stopped = true,
        );
    }

    /// Starts the engine and runs until ctrl-c or a fatal error, then
    /// shuts down gracefully.
    pub async fn run(mut self) -> Result<()> {
        self.start();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Shutting down...");
            }
            maybe_err = self.sys_err_rx.recv() => {
                if let Some(e) = maybe_err {
                    tracing::error!("Fatal error: {}", e);
                    self.ctx.alert(format!("relayer fatal error: {e}"));
                }
            }
        }
        self.stop().await;
        tracing::info!("Clean exit");
        Ok(())
    }

    /// How many tasks are currently owned.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::InMemoryBlockStore;
    use crate::config::{MetricsConfig, PrivateKey, RelayerConfig};
    use crate::test_utils::test_chain_config;
    use ethers::types::{Address, H256};
    use std::str::FromStr;

    fn runnable_config() -> RelayerConfig {
        // the address belonging to private key 0x...01.
        let from = Address::from_str(
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf",
        )
        .unwrap();
        let key = PrivateKey::from_raw(H256::from_low_u64_be(1));
        let mut hub = test_chain_config(212, 212);
        hub.from = from;
        hub.private_key = Some(key.clone());
        hub.sync_chain_ids = vec![crate::types::ChainId(97)];
        let mut spoke = test_chain_config(97, 212);
        spoke.from = from;
        spoke.private_key = Some(key);
        RelayerConfig {
            hub_chain: hub,
            chains: vec![spoke],
            keystore_path: "/tmp/atlas-test-keys".into(),
            blockstore_path: "/tmp/atlas-test-blocks".into(),
            alert_hook: None,
            recompute_receipt_chains: vec![],
            metrics: MetricsConfig::default(),
        }
    }

    #[tokio::test]
    async fn builds_starts_and_stops_cleanly() {
        let ctx = RelayerContext::new(runnable_config()).unwrap();
        let store = Arc::new(InMemoryBlockStore::default());
        let mut core = Core::build(ctx, store).unwrap();
        assert_eq!(core.task_count(), 0);
        core.start();
        // 2 writers + 2 monitors + 2 listeners, no health server.
        assert_eq!(core.task_count(), 6);
        core.stop().await;
        assert_eq!(core.task_count(), 0);
    }

    #[tokio::test]
    async fn build_rejects_unresolvable_signers() {
        let mut config = runnable_config();
        config.chains[0].private_key = None;
        config.chains[0].keystore_ref = Some("missing.json".into());
        let ctx = RelayerContext::new(config).unwrap();
        let store = Arc::new(InMemoryBlockStore::default());
        assert!(Core::build(ctx, store).is_err());
    }
}
