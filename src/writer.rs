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
//! # Writer Module
//!
//! One writer per chain owns everything that leaves the process for that
//! chain: the inbound message queue, the nonce lease, and the
//! serialization of submissions. A message is retried until the chain
//! accepts it or reports it as a duplicate; per-message failures never
//! escalate to a process restart, because cross-chain liveness beats a
//! clean crash.

use std::sync::Arc;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use tokio::sync::{mpsc, Mutex, MutexGuard};

use crate::client::ChainClient;
use crate::config::ChainConfig;
use crate::context::{RelayerContext, Shutdown};
use crate::router::{Message, MessageKind};
use crate::types::TxStatus;
use crate::{ChainError, Result};

#[derive(Debug, Default)]
struct NonceState {
    next: U256,
    initialized: bool,
}

/// The exclusive right to submit the next transaction from the writer's
/// account. At most one task holds the lease at a time; `next` advances
/// only when a submission was accepted by the chain.
#[derive(Debug, Default)]
pub struct NonceLease {
    inner: Mutex<NonceState>,
}

impl NonceLease {
    async fn acquire(
        &self,
        client: &dyn ChainClient,
        from: Address,
        refresh: bool,
    ) -> std::result::Result<MutexGuard<'_, NonceState>, ChainError> {
        let mut state = self.inner.lock().await;
        if refresh || !state.initialized {
            state.next = client.current_nonce(from).await?;
            state.initialized = true;
        }
        Ok(state)
    }
}

enum Outcome {
    Acked,
    Retry { refresh_nonce: bool },
}

/// Serializes outbound submissions for one chain.
pub struct Writer {
    config: ChainConfig,
    client: Arc<dyn ChainClient>,
    wallet: LocalWallet,
    inbox: mpsc::Receiver<Message>,
    ctx: RelayerContext,
    nonce: NonceLease,
    light_node: Address,
    mos: Address,
}

impl Writer {
    /// Creates the writer for one chain. Target contracts are resolved
    /// here so a broken `opts` map fails at startup, not on the first
    /// message.
    pub fn new(
        config: ChainConfig,
        client: Arc<dyn ChainClient>,
        wallet: LocalWallet,
        inbox: mpsc::Receiver<Message>,
        ctx: RelayerContext,
    ) -> Result<Self> {
        let light_node = config.light_node()?;
        let mos = config.mos()?;
        Ok(Self {
            config,
            client,
            wallet,
            inbox,
            ctx,
            nonce: NonceLease::default(),
            light_node,
            mos,
        })
    }

    /// The chain this writer submits to.
    pub fn chain_id(&self) -> crate::types::ChainId {
        self.config.id
    }

    /// Drains the inbox until shutdown.
    pub async fn run(mut self) -> Result<()> {
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::TxQueue,
            chain = %self.config.name,
            chain_id = %self.config.id,
            starting = true,
        );
        let mut shutdown = self.ctx.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::event!(
                        target: crate::probe::TARGET,
                        tracing::Level::DEBUG,
                        kind = %crate::probe::Kind::TxQueue,
                        chain_id = %self.config.id,
                        stopping = true,
                    );
                    return Ok(());
                }
                maybe = self.inbox.recv() => match maybe {
                    Some(message) => {
                        self.relay(message, &mut shutdown).await;
                    }
                    // every listener is gone; nothing left to write.
                    None => return Ok(()),
                }
            }
        }
    }

    /// Processes one message to completion: retried until the chain
    /// accepts it, reports it as already landed, or we are shut down.
    async fn relay(&self, message: Message, shutdown: &mut Shutdown) {
        let target = match message.kind {
            MessageKind::DeliverProof => self.mos,
            MessageKind::SyncToHub | MessageKind::SyncFromHub => {
                self.light_node
            }
        };
        let Some(calldata) = message.payload.first().cloned() else {
            tracing::warn!(
                chain_id = %self.config.id,
                "dropping message with empty payload"
            );
            message.ack();
            return;
        };
        let source = message.source;
        let kind = message.kind;
        let mut refresh_nonce = false;
        let mut error_count: u64 = 0;
        let acked = loop {
            match self.attempt(target, &calldata, refresh_nonce).await {
                Outcome::Acked => break true,
                Outcome::Retry { refresh_nonce: refresh } => {
                    refresh_nonce = refresh;
                    error_count += 1;
                    self.ctx.metrics.transaction_retries.inc();
                    if error_count >= self.config.retry.alert_threshold {
                        self.ctx.alert(format!(
                            "writer on {} failed {} consecutive submissions \
                             of a {} message from chain {}",
                            self.config.name, error_count, kind, source,
                        ));
                        error_count = 0;
                    }
                    tracing::event!(
                        target: crate::probe::TARGET,
                        tracing::Level::TRACE,
                        kind = %crate::probe::Kind::Retry,
                        chain_id = %self.config.id,
                        refresh_nonce = refresh,
                    );
                    let stop = tokio::select! {
                        _ = shutdown.recv() => true,
                        _ = tokio::time::sleep(self.config.retry.tx_retry()) => false,
                    };
                    if stop {
                        // in-flight work is abandoned unacked; the
                        // listener will re-emit it after restart.
                        break false;
                    }
                }
            }
        };
        if acked {
            message.ack();
        }
    }

    async fn attempt(
        &self,
        target: Address,
        calldata: &Bytes,
        refresh_nonce: bool,
    ) -> Outcome {
        match self.submit(target, calldata, refresh_nonce).await {
            Ok(tx_hash) => {
                self.ctx.metrics.transactions_submitted.inc();
                let status = self
                    .client
                    .tx_status(tx_hash, self.config.retry.tx_status_timeout())
                    .await;
                match status {
                    Ok(TxStatus::Success) => {
                        tracing::info!(
                            chain_id = %self.config.id,
                            ?tx_hash,
                            "Tx finalized",
                        );
                        Outcome::Acked
                    }
                    Ok(status) => {
                        tracing::warn!(
                            chain_id = %self.config.id,
                            ?tx_hash,
                            %status,
                            "Tx status is not successful, will retry",
                        );
                        Outcome::Retry { refresh_nonce: true }
                    }
                    Err(e) => {
                        tracing::warn!(
                            chain_id = %self.config.id,
                            ?tx_hash,
                            "Status poll failed, will retry: {}",
                            e,
                        );
                        Outcome::Retry {
                            refresh_nonce: e.needs_fresh_nonce(),
                        }
                    }
                }
            }
            Err(e) if e.is_duplicate() => {
                tracing::info!(
                    chain_id = %self.config.id,
                    "chain reports the submission already landed: {}",
                    e,
                );
                self.ctx.metrics.duplicates_acked.inc();
                Outcome::Acked
            }
            Err(e) => {
                match &e {
                    ChainError::Transient(_) => tracing::error!(
                        chain_id = %self.config.id,
                        "submission hit a transient failure, will retry \
                         with the same nonce: {}",
                        e,
                    ),
                    ChainError::NonceInvalid(_) => tracing::error!(
                        chain_id = %self.config.id,
                        "nonce rejected, will retry with a fresh one: {}",
                        e,
                    ),
                    ChainError::InsufficientGas(_) => {
                        tracing::error!(
                            chain_id = %self.config.id,
                            "account cannot cover gas: {}",
                            e,
                        );
                        self.ctx.alert(format!(
                            "account {:?} on {} cannot cover gas: {}",
                            self.config.from, self.config.name, e,
                        ));
                    }
                    _ => tracing::warn!(
                        chain_id = %self.config.id,
                        "submission failed, will retry: {}",
                        e,
                    ),
                }
                Outcome::Retry {
                    refresh_nonce: e.needs_fresh_nonce(),
                }
            }
        }
    }

    /// One signed submission under the nonce lease. The lease is released
    /// as soon as the chain has answered; receipt polling happens outside
    /// it.
    async fn submit(
        &self,
        target: Address,
        calldata: &Bytes,
        refresh_nonce: bool,
    ) -> std::result::Result<H256, ChainError> {
        let mut lease = self
            .nonce
            .acquire(&*self.client, self.config.from, refresh_nonce)
            .await?;
        let nonce = lease.next;
        let gas_price = match self.config.gas_price {
            Some(price) => U256::from(price),
            None => self.client.gas_price().await?,
        };
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.config.from)
            .to(target)
            .gas(self.config.gas_limit)
            .gas_price(gas_price)
            .nonce(nonce)
            .data(calldata.clone())
            .chain_id(self.config.id.0)
            .into();
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| ChainError::Other(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = self.client.send_raw(raw).await?;
        // the chain accepted this nonce; the next submission uses the
        // following one.
        lease.next = nonce + U256::one();
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::TxQueue,
            chain_id = %self.config.id,
            ?tx_hash,
            %nonce,
            submitted = true,
        );
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::INBOX_CAPACITY;
    use crate::test_utils::{test_chain_config, test_context, MockChain};
    use std::time::Duration;

    fn spawn_writer(
        mock: Arc<MockChain>,
        ctx: RelayerContext,
    ) -> mpsc::Sender<Message> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let config = test_chain_config(97, 212);
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let config = ChainConfig {
            from: wallet.address(),
            ..config
        };
        let wallet = wallet.with_chain_id(config.id.0);
        let writer =
            Writer::new(config, mock, wallet, rx, ctx.clone()).unwrap();
        tokio::spawn(writer.run());
        tx
    }

    async fn ack_within(
        done: tokio::sync::oneshot::Receiver<()>,
        millis: u64,
    ) {
        tokio::time::timeout(Duration::from_millis(millis), done)
            .await
            .expect("done signal timed out")
            .expect("writer dropped the message");
    }

    #[tokio::test]
    async fn consecutive_messages_reuse_the_lease() {
        let mock = Arc::new(MockChain::default());
        mock.script_nonces([7u64]);
        mock.script_sends([Ok(H256::repeat_byte(1)), Ok(H256::repeat_byte(2))]);
        let ctx = test_context();
        let inbox = spawn_writer(mock.clone(), ctx);

        for _ in 0..2 {
            let (msg, done) = Message::sync_to_hub(
                crate::types::ChainId(97),
                crate::types::ChainId(212),
                vec![0x01].into(),
            );
            inbox.send(msg).await.unwrap();
            ack_within(done, 1_000).await;
        }
        // the second message pre-increments instead of refreshing.
        assert_eq!(mock.sent_nonces(), vec![7, 8]);
        assert_eq!(mock.nonce_fetches(), 1);
    }

    #[tokio::test]
    async fn nonce_invalid_refreshes_and_succeeds_once() {
        let mock = Arc::new(MockChain::default());
        mock.script_nonces([7u64, 9]);
        mock.script_sends([
            Err(ChainError::NonceInvalid("nonce too low".into())),
            Ok(H256::repeat_byte(3)),
        ]);
        let ctx = test_context();
        let inbox = spawn_writer(mock.clone(), ctx.clone());

        let (msg, done) = Message::sync_to_hub(
            crate::types::ChainId(97),
            crate::types::ChainId(212),
            vec![0x02].into(),
        );
        inbox.send(msg).await.unwrap();
        ack_within(done, 1_000).await;

        assert_eq!(mock.sent_nonces(), vec![7, 9]);
        assert_eq!(mock.nonce_fetches(), 2);
        assert_eq!(ctx.metrics.transaction_retries.get(), 1);
    }

    #[tokio::test]
    async fn duplicate_after_transient_is_acked() {
        let mock = Arc::new(MockChain::default());
        mock.script_nonces([5u64]);
        mock.script_sends([
            Err(ChainError::Transient("unexpected EOF".into())),
            Err(ChainError::Duplicate("order exist".into())),
        ]);
        let ctx = test_context();
        let inbox = spawn_writer(mock.clone(), ctx.clone());

        let (msg, done) = Message::deliver_proof(
            crate::types::ChainId(97),
            crate::types::ChainId(212),
            vec![0x03].into(),
        );
        inbox.send(msg).await.unwrap();
        ack_within(done, 1_000).await;

        assert_eq!(ctx.metrics.duplicates_acked.get(), 1);
        // a transient failure keeps the nonce; no second refresh happened.
        assert_eq!(mock.nonce_fetches(), 1);
    }

    #[tokio::test]
    async fn insufficient_gas_raises_an_alert() {
        let mock = Arc::new(MockChain::default());
        mock.script_nonces([5u64]);
        mock.script_sends([
            Err(ChainError::InsufficientGas(
                "insufficient funds for gas".into(),
            )),
            Ok(H256::repeat_byte(4)),
        ]);
        let ctx = test_context();
        let inbox = spawn_writer(mock.clone(), ctx.clone());

        let (msg, done) = Message::sync_from_hub(
            crate::types::ChainId(212),
            crate::types::ChainId(97),
            vec![0x04].into(),
        );
        inbox.send(msg).await.unwrap();
        ack_within(done, 1_000).await;
        assert!(ctx.metrics.alerts_emitted.get() >= 1);
    }

    #[tokio::test]
    async fn unknown_status_retries_until_duplicate() {
        // the S4 shape: the send lands but the receipt never shows up,
        // the retry is answered with a duplicate error.
        let mock = Arc::new(MockChain::default());
        mock.script_nonces([11u64, 11]);
        mock.script_sends([
            Ok(H256::repeat_byte(5)),
            Err(ChainError::Duplicate("header already synced".into())),
        ]);
        mock.script_statuses([TxStatus::Unknown]);
        let ctx = test_context();
        let inbox = spawn_writer(mock.clone(), ctx.clone());

        let (msg, done) = Message::sync_to_hub(
            crate::types::ChainId(97),
            crate::types::ChainId(212),
            vec![0x05].into(),
        );
        inbox.send(msg).await.unwrap();
        ack_within(done, 1_000).await;
        assert_eq!(ctx.metrics.duplicates_acked.get(), 1);
    }
}
