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
//! # Listener Module
//!
//! One listener per chain scans finalized blocks in strict ascending
//! order, always `confirmations` behind the tip. A block is processed to
//! completion (every message acked by the destination writer) before the
//! cursor persists and advances; a block that fails is retried in place,
//! so restarts and failures can duplicate work but never skip or reorder
//! it. The writer's duplicate handling absorbs the re-emissions.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, Bytes, Filter, Log, Topic, ValueOrArray, H256};
use futures::TryFutureExt;
use tokio::sync::oneshot;

use crate::blockstore::BlockStore;
use crate::client::ChainClient;
use crate::config::ChainConfig;
use crate::context::{RelayerContext, Shutdown};
use crate::proof::ProofBuilder;
use crate::protocol;
use crate::retry::ConstantWithMaxRetryCount;
use crate::router::{Message, Router};
use crate::types::Header;
use crate::{Error, Result};

/// Sleeps for `duration` unless shutdown fires first; returns whether it
/// did.
async fn sleep_or_stop(shutdown: &mut Shutdown, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.recv() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Scans one chain and emits messages for its matching events.
pub struct Listener {
    config: ChainConfig,
    client: Arc<dyn ChainClient>,
    hub_client: Arc<dyn ChainClient>,
    hub_light_node: Option<Address>,
    store: Arc<dyn BlockStore>,
    router: Arc<Router>,
    builder: ProofBuilder,
    ctx: RelayerContext,
    oracle_node: Address,
    topics: Vec<H256>,
    http: reqwest::Client,
}

impl Listener {
    /// Creates the listener for one chain. The filter inputs are resolved
    /// here so a broken `opts` map fails at startup.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChainConfig,
        client: Arc<dyn ChainClient>,
        hub_client: Arc<dyn ChainClient>,
        hub_light_node: Option<Address>,
        store: Arc<dyn BlockStore>,
        router: Arc<Router>,
        ctx: RelayerContext,
    ) -> Result<Self> {
        let oracle_node = config.oracle_node()?;
        let topics = config.event_topics();
        if topics.is_empty() {
            return Err(Error::Generic(
                "chain configures no event selectors",
            ));
        }
        let builder =
            ProofBuilder::new(ctx.recomputes_receipts_root(config.id));
        Ok(Self {
            config,
            client,
            hub_client,
            hub_light_node,
            store,
            router,
            builder,
            ctx,
            oracle_node,
            topics,
            http: reqwest::Client::new(),
        })
    }

    /// The chain this listener scans.
    pub fn chain_id(&self) -> crate::types::ChainId {
        self.config.id
    }

    /// Runs the scan loop until shutdown. Blockstore read errors are
    /// fatal at startup; everything after that is retried in place.
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.ctx.shutdown_signal();
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::Lifecycle,
            chain = %self.config.name,
            chain_id = %self.config.id,
            started = true,
        );
        if !self.config.sync_to_hub && !self.config.is_hub() {
            // this chain only receives; nothing to scan for.
            shutdown.recv().await;
            return Ok(());
        }
        let Some(mut current) = self.initial_cursor(&mut shutdown).await?
        else {
            return Ok(());
        };
        tracing::info!(
            chain = %self.config.name,
            start = current,
            "Starting to scan blocks",
        );
        let mut failures: u64 = 0;
        loop {
            let latest = tokio::select! {
                _ = shutdown.recv() => break,
                latest = self.client.latest_block() => match latest {
                    Ok(latest) => latest,
                    Err(e) => {
                        tracing::warn!(
                            chain = %self.config.name,
                            "Unable to get latest block: {}",
                            e,
                        );
                        if sleep_or_stop(
                            &mut shutdown,
                            self.config.retry.block_retry(),
                        )
                        .await
                        {
                            break;
                        }
                        continue;
                    }
                },
            };
            if latest < current + self.config.confirmations {
                tracing::trace!(
                    chain = %self.config.name,
                    current,
                    latest,
                    "Block not ready, will retry",
                );
                if sleep_or_stop(&mut shutdown, self.config.retry.poll())
                    .await
                {
                    break;
                }
                continue;
            }
            match self.process_block(current).await {
                Ok(()) => {
                    failures = 0;
                    // a failed cursor write costs a re-scan of one block
                    // after restart, not correctness.
                    if let Err(e) = self.store.store(self.config.id, current)
                    {
                        tracing::error!(
                            chain = %self.config.name,
                            block = current,
                            "Failed to write latest block to blockstore: {}",
                            e,
                        );
                    }
                    self.ctx.metrics.blocks_processed.inc();
                    self.ctx.metrics.record_block(self.config.id, current);
                    self.ctx.health.record(
                        self.config.id,
                        &self.config.name,
                        current,
                    );
                    tracing::event!(
                        target: crate::probe::TARGET,
                        tracing::Level::TRACE,
                        kind = %crate::probe::Kind::Sync,
                        chain_id = %self.config.id,
                        block = current,
                        latest,
                    );
                    current += 1;
                    if latest.saturating_sub(current)
                        <= self.config.confirmations
                    {
                        if sleep_or_stop(
                            &mut shutdown,
                            self.config.retry.messenger(),
                        )
                        .await
                        {
                            break;
                        }
                    }
                }
                Err(e) => {
                    if matches!(e, Error::ProofMismatch { .. })
                        && failures == 0
                    {
                        // the operator must see this one right away; the
                        // chain will not advance until it resolves.
                        self.ctx.alert(format!(
                            "chain {}: {}",
                            self.config.name, e
                        ));
                    }
                    failures += 1;
                    tracing::error!(
                        chain = %self.config.name,
                        block = current,
                        "Failed to get events for block: {}",
                        e,
                    );
                    if failures >= self.config.retry.alert_threshold {
                        self.ctx.alert(format!(
                            "chain {} failed {} attempts at block {}: {}",
                            self.config.name, failures, current, e,
                        ));
                        failures = 0;
                    }
                    if sleep_or_stop(
                        &mut shutdown,
                        self.config.retry.block_retry(),
                    )
                    .await
                    {
                        break;
                    }
                }
            }
        }
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::Lifecycle,
            chain_id = %self.config.id,
            stopped = true,
        );
        Ok(())
    }

    /// Resolves the height scanning starts at. `None` means shutdown was
    /// requested while resolving.
    async fn initial_cursor(
        &self,
        shutdown: &mut Shutdown,
    ) -> Result<Option<u64>> {
        if self.config.fresh_start {
            tracing::info!(
                chain = %self.config.name,
                "fresh start: cursor reset to {}",
                self.config.start_block,
            );
            return Ok(Some(self.config.start_block));
        }
        if self.config.latest_only {
            loop {
                match self.client.latest_block().await {
                    Ok(latest) => {
                        tracing::info!(
                            chain = %self.config.name,
                            "latest only: cursor jumps to the tip {}",
                            latest,
                        );
                        return Ok(Some(latest));
                    }
                    Err(e) => {
                        tracing::warn!(
                            chain = %self.config.name,
                            "Unable to get latest block: {}",
                            e,
                        );
                        if sleep_or_stop(
                            shutdown,
                            self.config.retry.block_retry(),
                        )
                        .await
                        {
                            return Ok(None);
                        }
                    }
                }
            }
        }
        if let Some(stored) = self.store.load(self.config.id)? {
            // re-scan the persisted block once; duplicate handling makes
            // that idempotent.
            return Ok(Some(cmp::max(stored, self.config.start_block)));
        }
        // first run: ask the hub how far this chain is already synced.
        if !self.config.is_hub() {
            if let Some(light_node) = self.hub_light_node {
                let synced = self
                    .hub_client
                    .call(
                        light_node,
                        protocol::synced_height_calldata(self.config.id),
                    )
                    .await
                    .map_err(Error::from)
                    .and_then(|ret| protocol::decode_synced_height(&ret));
                match synced {
                    Ok(height) if height > 0 => {
                        let start =
                            cmp::max(height + 1, self.config.start_block);
                        tracing::info!(
                            chain = %self.config.name,
                            synced = height,
                            start,
                            "hub already knows this chain; skipping ahead",
                        );
                        return Ok(Some(start));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            chain = %self.config.name,
                            "hub synced-height lookup failed: {}",
                            e,
                        );
                    }
                }
            }
        }
        Ok(Some(self.config.start_block))
    }

    /// Processes one block to completion: filter, prove, dispatch, await
    /// every ack. Any error leaves the cursor untouched.
    async fn process_block(&self, current: u64) -> Result<()> {
        tracing::debug!(
            chain = %self.config.name,
            block = current,
            "Querying block for events",
        );
        let topic0: Topic = ValueOrArray::Array(
            self.topics.iter().copied().map(Some).collect(),
        );
        let filter = Filter::new()
            .from_block(current)
            .to_block(current)
            .address(self.oracle_node)
            .topic0(topic0);
        let logs = self.client.filter_logs(&filter).await?;
        if logs.is_empty() {
            return Ok(());
        }
        let mut header = self.client.header_by_number(current).await?;
        let receipts = self.client.receipts_for_block(current).await?;
        let root = self.builder.effective_root(&header, &receipts)?;
        header.receipts_root = root;
        tracing::info!(
            chain = %self.config.name,
            block = current,
            logs = logs.len(),
            "Found logs",
        );
        if self.config.is_hub() {
            // fan the hub header out to every subscribed spoke.
            let blob = protocol::header_blob(header.number, root);
            let calldata =
                protocol::pack_update_block_header(self.config.id, &blob);
            for destination in &self.config.sync_chain_ids {
                self.dispatch(Message::sync_from_hub(
                    self.config.id,
                    *destination,
                    calldata.clone(),
                ))
                .await?;
            }
        } else {
            let calldata = self.attestation(&header, root).await?;
            self.dispatch(Message::sync_to_hub(
                self.config.id,
                self.config.hub_chain_id,
                calldata,
            ))
            .await?;
            // within a block, logs go out in index order.
            let mut logs: Vec<Log> = logs;
            logs.sort_by_key(|log| log.log_index.unwrap_or_default());
            for log in &logs {
                let artifact = self.builder.build(&header, &receipts, log)?;
                let calldata =
                    protocol::pack_prove_receipt(self.config.id, &artifact);
                self.dispatch(Message::deliver_proof(
                    self.config.id,
                    self.config.hub_chain_id,
                    calldata,
                ))
                .await?;
            }
        }
        Ok(())
    }

    /// The header attestation calldata, in the zk shape when an endpoint
    /// is configured for the chain.
    async fn attestation(
        &self,
        header: &Header,
        root: H256,
    ) -> Result<Bytes> {
        match self.config.api_url() {
            Some(api_url) => {
                let backoff = ConstantWithMaxRetryCount::new(
                    Duration::from_millis(500),
                    3,
                );
                let zk_proof = backoff::future::retry(backoff, || {
                    protocol::fetch_zk_proof(
                        &self.http,
                        &api_url,
                        self.config.id,
                        header.number,
                    )
                    .map_err(backoff::Error::transient)
                })
                .await?;
                let ret = self
                    .client
                    .call(self.oracle_node, protocol::validators_calldata())
                    .await?;
                let validators = protocol::decode_validators(&ret)?;
                Ok(protocol::pack_propose_with_zk(
                    &validators,
                    header.number,
                    root,
                    &zk_proof,
                ))
            }
            None => Ok(protocol::pack_propose(header.number, root)),
        }
    }

    /// Routes one message and waits for the destination writer's ack.
    async fn dispatch(
        &self,
        (message, done): (Message, oneshot::Receiver<()>),
    ) -> Result<()> {
        self.router.send(message).await?;
        self.ctx.metrics.messages_dispatched.inc();
        done.await.map_err(|_| {
            Error::Generic("writer dropped the message before acking")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::InMemoryBlockStore;
    use crate::router::{MessageKind, INBOX_CAPACITY};
    use crate::test_utils::{
        receipt_with_log, test_chain_config, test_context, MockChain,
    };
    use crate::types::ChainId;
    use ethers::abi::{self, Token};
    use ethers::types::U256;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Registers a stub writer for `chain` that acks everything and
    /// records what it saw.
    fn acking_writer(
        router: &Router,
        chain: ChainId,
    ) -> Arc<Mutex<Vec<(ChainId, MessageKind)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel::<Message>(INBOX_CAPACITY);
        router.register(chain, tx);
        let record = seen.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                record.lock().push((message.source, message.kind));
                message.ack();
            }
        });
        seen
    }

    async fn wait_for_cursor(
        store: &InMemoryBlockStore,
        chain: ChainId,
        height: u64,
    ) {
        use crate::blockstore::BlockStore;
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if store.load(chain).unwrap() >= Some(height) {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cursor did not advance in time");
    }

    struct Fixture {
        mock: Arc<MockChain>,
        store: Arc<InMemoryBlockStore>,
        router: Arc<Router>,
        ctx: RelayerContext,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                mock: Arc::new(MockChain::default()),
                store: Arc::new(InMemoryBlockStore::default()),
                router: Arc::new(Router::new()),
                ctx: test_context(),
            }
        }

        fn listener(&self, config: ChainConfig) -> Listener {
            Listener::new(
                config,
                self.mock.clone(),
                self.mock.clone(),
                None,
                self.store.clone(),
                self.router.clone(),
                self.ctx.clone(),
            )
            .unwrap()
        }
    }

    #[tokio::test]
    async fn happy_path_relays_one_block_and_advances() {
        let fixture = Fixture::new();
        let mut config = test_chain_config(97, 212);
        config.start_block = 100;
        *fixture.mock.latest.lock() = 105;
        let topic = config.event_selectors[0];
        let receipts: Vec<_> =
            (0..4).map(|i| receipt_with_log(i, topic)).collect();
        let log = receipts[2].logs[0].clone();
        fixture.mock.seed_block(100, receipts, vec![log], None);

        let seen = acking_writer(&fixture.router, ChainId(212));
        let listener = fixture.listener(config);
        let handle = tokio::spawn(listener.run());

        // blocks 100..=102 are confirmed (105 - 3); 101 and 102 are empty.
        wait_for_cursor(&fixture.store, ChainId(97), 102).await;
        fixture.ctx.shutdown();
        handle.await.unwrap().unwrap();

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                (ChainId(97), MessageKind::SyncToHub),
                (ChainId(97), MessageKind::DeliverProof),
            ]
        );
        assert_eq!(fixture.ctx.metrics.messages_dispatched.get(), 2);
    }

    #[tokio::test]
    async fn proof_mismatch_stalls_the_chain() {
        let fixture = Fixture::new();
        let mut config = test_chain_config(97, 212);
        config.start_block = 100;
        *fixture.mock.latest.lock() = 110;
        let topic = config.event_selectors[0];
        let receipts: Vec<_> =
            (0..2).map(|i| receipt_with_log(i, topic)).collect();
        let log = receipts[0].logs[0].clone();
        // the header lies about its receipts root.
        fixture.mock.seed_block(
            100,
            receipts,
            vec![log],
            Some(H256::repeat_byte(0xDE)),
        );

        let seen = acking_writer(&fixture.router, ChainId(212));
        let listener = fixture.listener(config);
        let handle = tokio::spawn(listener.run());

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        fixture.ctx.shutdown();
        handle.await.unwrap().unwrap();

        use crate::blockstore::BlockStore;
        assert_eq!(fixture.store.load(ChainId(97)).unwrap(), None);
        assert!(seen.lock().is_empty());
        assert!(fixture.ctx.metrics.alerts_emitted.get() >= 1);
    }

    #[tokio::test]
    async fn restart_resumes_at_the_persisted_cursor() {
        use crate::blockstore::BlockStore;
        let fixture = Fixture::new();
        let mut config = test_chain_config(97, 212);
        config.start_block = 100;
        fixture.store.store(ChainId(97), 137).unwrap();
        *fixture.mock.latest.lock() = 141;
        let topic = config.event_selectors[0];
        let receipts = vec![receipt_with_log(0, topic)];
        let log = receipts[0].logs[0].clone();
        fixture.mock.seed_block(138, receipts, vec![log], None);

        let seen = acking_writer(&fixture.router, ChainId(212));
        let listener = fixture.listener(config);
        let handle = tokio::spawn(listener.run());

        // 137 is re-scanned (empty), 138 re-emits its messages.
        wait_for_cursor(&fixture.store, ChainId(97), 138).await;
        fixture.ctx.shutdown();
        handle.await.unwrap().unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn hub_fans_headers_out_to_spokes() {
        let fixture = Fixture::new();
        let mut config = test_chain_config(212, 212);
        config.start_block = 50;
        config.sync_chain_ids = vec![ChainId(97), ChainId(98)];
        *fixture.mock.latest.lock() = 60;
        let topic = config.event_selectors[0];
        let receipts = vec![receipt_with_log(0, topic)];
        let log = receipts[0].logs[0].clone();
        fixture.mock.seed_block(50, receipts, vec![log], None);

        let first = acking_writer(&fixture.router, ChainId(97));
        let second = acking_writer(&fixture.router, ChainId(98));
        let listener = fixture.listener(config);
        let handle = tokio::spawn(listener.run());

        wait_for_cursor(&fixture.store, ChainId(212), 50).await;
        fixture.ctx.shutdown();
        handle.await.unwrap().unwrap();

        assert_eq!(
            *first.lock(),
            vec![(ChainId(212), MessageKind::SyncFromHub)]
        );
        assert_eq!(
            *second.lock(),
            vec![(ChainId(212), MessageKind::SyncFromHub)]
        );
    }

    #[tokio::test]
    async fn first_run_asks_the_hub_for_the_synced_height() {
        let fixture = Fixture::new();
        let mut config = test_chain_config(97, 212);
        config.start_block = 10;
        *fixture.mock.latest.lock() = 505;
        fixture.mock.script_call_response(
            abi::encode(&[Token::Uint(U256::from(500u64))]).into(),
        );

        let listener = Listener::new(
            config,
            fixture.mock.clone(),
            fixture.mock.clone(),
            Some(Address::repeat_byte(0x0B)),
            fixture.store.clone(),
            fixture.router.clone(),
            fixture.ctx.clone(),
        )
        .unwrap();
        let handle = tokio::spawn(listener.run());

        // scanning starts at 501, not at start_block.
        wait_for_cursor(&fixture.store, ChainId(97), 501).await;
        fixture.ctx.shutdown();
        handle.await.unwrap().unwrap();
    }
}
