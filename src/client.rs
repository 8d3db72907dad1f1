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
//! # Chain Client Module
//!
//! The [`ChainClient`] trait is the only surface through which the engine
//! talks to a chain. Adding a chain family means implementing this trait;
//! the listener, writer and monitor are unaware of wire formats.
//!
//! Every operation returns a [`ChainError`]-tagged result. Adapters
//! classify the underlying client's error exactly once, at this boundary.

use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{
    Address, BlockNumber, Bytes, Filter, Log, TransactionReceipt,
    TransactionRequest, H256, U256,
};

use crate::types::{Header, TxStatus};
use crate::ChainError;

/// Result alias for chain-facing operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// The capability set the relay engine consumes from a chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Height of the chain tip.
    async fn latest_block(&self) -> ChainResult<u64>;

    /// The header at `number`.
    async fn header_by_number(&self, number: u64) -> ChainResult<Header>;

    /// Logs matching `filter`.
    async fn filter_logs(&self, filter: &Filter) -> ChainResult<Vec<Log>>;

    /// All receipts of the block at `number`, in block order.
    async fn receipts_for_block(
        &self,
        number: u64,
    ) -> ChainResult<Vec<TransactionReceipt>>;

    /// The pending-inclusive transaction count of `address`.
    async fn current_nonce(&self, address: Address) -> ChainResult<U256>;

    /// The gas price the chain currently suggests.
    async fn gas_price(&self) -> ChainResult<U256>;

    /// The balance of `address` in wei.
    async fn balance(&self, address: Address) -> ChainResult<U256>;

    /// Executes a read-only contract call against the latest state.
    async fn call(&self, to: Address, data: Bytes) -> ChainResult<Bytes>;

    /// Broadcasts a signed raw transaction, returning its hash.
    async fn send_raw(&self, tx: Bytes) -> ChainResult<H256>;

    /// Polls for the receipt of `tx_hash` until it is terminal or
    /// `timeout` elapses.
    async fn tx_status(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> ChainResult<TxStatus>;
}

/// A [`ChainClient`] over an EVM JSON-RPC endpoint, built on the ethers
/// provider stack.
#[derive(Debug, Clone)]
pub struct EvmClient {
    provider: Provider<Http>,
    status_poll: Duration,
}

impl EvmClient {
    /// Connects to an EVM JSON-RPC endpoint.
    pub fn connect(endpoint: &url::Url) -> crate::Result<Self> {
        let provider = Provider::<Http>::try_from(endpoint.as_str())?
            .interval(Duration::from_millis(500));
        Ok(Self {
            provider,
            status_poll: Duration::from_millis(3_000),
        })
    }

    fn classify<E: std::fmt::Display>(err: E) -> ChainError {
        ChainError::classify(err.to_string())
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    async fn latest_block(&self) -> ChainResult<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(Self::classify)?;
        Ok(number.as_u64())
    }

    async fn header_by_number(&self, number: u64) -> ChainResult<Header> {
        let block = self
            .provider
            .get_block(number)
            .await
            .map_err(Self::classify)?
            .ok_or_else(|| {
                ChainError::Other(format!("block {number} not found"))
            })?;
        Ok(Header {
            number,
            hash: block.hash.unwrap_or_default(),
            receipts_root: block.receipts_root,
        })
    }

    async fn filter_logs(&self, filter: &Filter) -> ChainResult<Vec<Log>> {
        self.provider.get_logs(filter).await.map_err(Self::classify)
    }

    async fn receipts_for_block(
        &self,
        number: u64,
    ) -> ChainResult<Vec<TransactionReceipt>> {
        self.provider
            .get_block_receipts(BlockNumber::Number(number.into()))
            .await
            .map_err(Self::classify)
    }

    async fn current_nonce(&self, address: Address) -> ChainResult<U256> {
        self.provider
            .get_transaction_count(
                address,
                Some(BlockNumber::Pending.into()),
            )
            .await
            .map_err(Self::classify)
    }

    async fn gas_price(&self) -> ChainResult<U256> {
        self.provider.get_gas_price().await.map_err(Self::classify)
    }

    async fn balance(&self, address: Address) -> ChainResult<U256> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(Self::classify)
    }

    async fn call(&self, to: Address, data: Bytes) -> ChainResult<Bytes> {
        let tx = TransactionRequest::new().to(to).data(data);
        self.provider
            .call(&tx.into(), None)
            .await
            .map_err(Self::classify)
    }

    async fn send_raw(&self, tx: Bytes) -> ChainResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(tx)
            .await
            .map_err(Self::classify)?;
        Ok(*pending)
    }

    async fn tx_status(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> ChainResult<TxStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    let reverted = matches!(
                        receipt.status,
                        Some(status) if status.is_zero()
                    );
                    return if reverted {
                        Ok(TxStatus::Reverted)
                    } else {
                        Ok(TxStatus::Success)
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::trace!("receipt poll failed: {}", e);
                }
            }
            if tokio::time::Instant::now() + self.status_poll > deadline {
                return Ok(TxStatus::Unknown);
            }
            tokio::time::sleep(self.status_poll).await;
        }
    }
}
