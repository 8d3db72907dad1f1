//! Shared helpers for the engine tests: a scripted [`MockChain`] and
//! minimal configuration builders.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{
    Address, Bytes, Filter, FilterBlockOption, Log, TransactionReceipt,
    H256, U256,
};
use parking_lot::Mutex;

use crate::client::{ChainClient, ChainResult};
use crate::config::{ChainConfig, MetricsConfig, RelayerConfig};
use crate::context::RelayerContext;
use crate::retry::RetryPolicy;
use crate::types::{ChainId, Header, TxStatus};
use crate::ChainError;

/// A fully scripted chain for driving the listener and writer.
#[derive(Default)]
pub struct MockChain {
    /// Chain tip height.
    pub latest: Mutex<u64>,
    /// Logs per block.
    pub logs: Mutex<HashMap<u64, Vec<Log>>>,
    /// Headers per block.
    pub headers: Mutex<HashMap<u64, Header>>,
    /// Receipts per block.
    pub receipts: Mutex<HashMap<u64, Vec<TransactionReceipt>>>,
    nonces: Mutex<VecDeque<u64>>,
    nonce_calls: Mutex<u64>,
    last_nonce: Mutex<u64>,
    sends: Mutex<VecDeque<ChainResult<H256>>>,
    sent_raw: Mutex<Vec<Bytes>>,
    statuses: Mutex<VecDeque<TxStatus>>,
    call_response: Mutex<Option<Bytes>>,
}

impl MockChain {
    /// Queues the responses of `current_nonce`; the last one repeats.
    pub fn script_nonces<I: IntoIterator<Item = u64>>(&self, nonces: I) {
        *self.nonces.lock() = nonces.into_iter().collect();
    }

    /// Queues the outcomes of `send_raw`.
    pub fn script_sends<I: IntoIterator<Item = ChainResult<H256>>>(
        &self,
        outcomes: I,
    ) {
        *self.sends.lock() = outcomes.into_iter().collect();
    }

    /// Queues the outcomes of `tx_status`; defaults to `Success`.
    pub fn script_statuses<I: IntoIterator<Item = TxStatus>>(
        &self,
        statuses: I,
    ) {
        *self.statuses.lock() = statuses.into_iter().collect();
    }

    /// Sets the return of `call`.
    pub fn script_call_response(&self, response: Bytes) {
        *self.call_response.lock() = Some(response);
    }

    /// How many times `current_nonce` was asked.
    pub fn nonce_fetches(&self) -> u64 {
        *self.nonce_calls.lock()
    }

    /// The nonces of every raw transaction handed to `send_raw`, in
    /// order, including rejected attempts.
    pub fn sent_nonces(&self) -> Vec<u64> {
        self.sent_raw
            .lock()
            .iter()
            .map(|raw| {
                // a signed legacy tx is the RLP list
                // [nonce, gas_price, gas, to, value, data, v, r, s].
                let rlp = rlp::Rlp::new(raw);
                let nonce: U256 = rlp.val_at(0).expect("valid signed tx rlp");
                nonce.as_u64()
            })
            .collect()
    }

    /// Seeds one block: its header, receipts, and the logs the filter
    /// returns for it. The header commits to the receipts unless a root
    /// override is given.
    pub fn seed_block(
        &self,
        number: u64,
        receipts: Vec<TransactionReceipt>,
        logs: Vec<Log>,
        root_override: Option<H256>,
    ) {
        let root = root_override
            .unwrap_or_else(|| crate::proof::derive_receipts_root(&receipts));
        self.headers.lock().insert(
            number,
            Header {
                number,
                hash: H256::from_low_u64_be(number),
                receipts_root: root,
            },
        );
        self.receipts.lock().insert(number, receipts);
        self.logs.lock().insert(number, logs);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn latest_block(&self) -> ChainResult<u64> {
        Ok(*self.latest.lock())
    }

    async fn header_by_number(&self, number: u64) -> ChainResult<Header> {
        self.headers.lock().get(&number).cloned().ok_or_else(|| {
            ChainError::Other(format!("block {number} not found"))
        })
    }

    async fn filter_logs(&self, filter: &Filter) -> ChainResult<Vec<Log>> {
        let from = match filter.block_option {
            FilterBlockOption::Range {
                from_block: Some(from),
                ..
            } => from.as_number().map(|n| n.as_u64()).unwrap_or_default(),
            _ => 0,
        };
        Ok(self.logs.lock().get(&from).cloned().unwrap_or_default())
    }

    async fn receipts_for_block(
        &self,
        number: u64,
    ) -> ChainResult<Vec<TransactionReceipt>> {
        Ok(self.receipts.lock().get(&number).cloned().unwrap_or_default())
    }

    async fn current_nonce(&self, _address: Address) -> ChainResult<U256> {
        *self.nonce_calls.lock() += 1;
        let mut nonces = self.nonces.lock();
        let value = if nonces.len() > 1 {
            nonces.pop_front().unwrap_or_default()
        } else {
            nonces.front().copied().unwrap_or(*self.last_nonce.lock())
        };
        *self.last_nonce.lock() = value;
        Ok(U256::from(value))
    }

    async fn gas_price(&self) -> ChainResult<U256> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn balance(&self, _address: Address) -> ChainResult<U256> {
        Ok(U256::from(1_000_000_000_000_000_000u64))
    }

    async fn call(&self, _to: Address, _data: Bytes) -> ChainResult<Bytes> {
        self.call_response
            .lock()
            .clone()
            .ok_or_else(|| ChainError::Other("no call response".into()))
    }

    async fn send_raw(&self, tx: Bytes) -> ChainResult<H256> {
        self.sent_raw.lock().push(tx);
        self.sends
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(H256::random()))
    }

    async fn tx_status(
        &self,
        _tx_hash: H256,
        _timeout: Duration,
    ) -> ChainResult<TxStatus> {
        Ok(self.statuses.lock().pop_front().unwrap_or(TxStatus::Success))
    }
}

/// A chain config with resolvable targets and millisecond timers.
pub fn test_chain_config(id: u64, hub_id: u64) -> ChainConfig {
    let mut opts = HashMap::new();
    opts.insert(
        "oracle-node".to_string(),
        format!("{:?}", Address::repeat_byte(0x0A)),
    );
    opts.insert(
        "light-node".to_string(),
        format!("{:?}", Address::repeat_byte(0x0B)),
    );
    opts.insert(
        "mos".to_string(),
        format!("{:?}", Address::repeat_byte(0x0C)),
    );
    ChainConfig {
        name: format!("test-{id}"),
        id: ChainId(id),
        endpoint: "http://localhost:8545".parse().unwrap(),
        from: Address::repeat_byte(0x0D),
        keystore_ref: None,
        private_key: None,
        start_block: 0,
        fresh_start: false,
        latest_only: false,
        confirmations: 3,
        event_selectors: vec![H256::repeat_byte(0xAA)],
        sync_to_hub: true,
        sync_chain_ids: vec![],
        hub_chain_id: ChainId(hub_id),
        gas_limit: 4_000_000,
        gas_price: Some(1_000_000_000),
        retry: RetryPolicy::fast(),
        opts,
    }
}

/// A context over a minimal config, for tests that only need the shared
/// handles.
pub fn test_context() -> RelayerContext {
    let hub = test_chain_config(212, 212);
    let config = RelayerConfig {
        hub_chain: hub,
        chains: vec![test_chain_config(97, 212)],
        keystore_path: "/tmp/atlas-test-keys".into(),
        blockstore_path: "/tmp/atlas-test-blocks".into(),
        alert_hook: None,
        recompute_receipt_chains: vec![],
        metrics: MetricsConfig::default(),
    };
    RelayerContext::new(config).expect("test context")
}

/// A receipt whose single log carries `topic`, positioned at
/// `transaction_index` within its block.
pub fn receipt_with_log(index: u64, topic: H256) -> TransactionReceipt {
    TransactionReceipt {
        transaction_index: index.into(),
        status: Some(1u64.into()),
        cumulative_gas_used: U256::from(21_000 * (index + 1)),
        logs: vec![Log {
            address: Address::repeat_byte(0x0A),
            topics: vec![topic],
            data: vec![index as u8; 32].into(),
            transaction_index: Some(index.into()),
            log_index: Some(U256::from(index)),
            ..Default::default()
        }],
        transaction_type: Some(2u64.into()),
        ..Default::default()
    }
}
