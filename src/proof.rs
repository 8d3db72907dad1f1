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
//! # Receipt Proof Module
//!
//! Builds the Merkle-Patricia receipt-trie proof that lets a destination
//! chain verifier authenticate a log without trusting the relayer: the
//! trie is re-derived locally from the block's receipts, cross-checked
//! against the `receipts_root` the header committed to, and the node path
//! for the target receipt is extracted as the proof.
//!
//! Receipts are re-encoded to their consensus form before insertion: the
//! EIP-2718 type byte for typed receipts, then the RLP list of
//! status-or-root, cumulative gas, bloom and logs, keyed by the RLP of the
//! receipt index. This matches the `DeriveSha` derivation used by the
//! chains themselves.

use alloy_trie::proof::ProofRetainer;
use alloy_trie::{HashBuilder, Nibbles};
use ethers::types::{Bytes, Log, TransactionReceipt, H256};

use crate::types::Header;
use crate::{Error, Result};

/// A verifiable proof of one log's containing receipt within a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofArtifact {
    /// The block the receipt belongs to.
    pub header_number: u64,
    /// The receipts root the proof commits to.
    pub receipts_root: H256,
    /// Trie nodes from root to leaf.
    pub trie_proof: Vec<Bytes>,
    /// Index of the log within the block.
    pub log_index: u64,
    /// Index of the containing receipt, which keys the trie.
    pub receipt_index: u64,
    /// The consensus encoding of the containing receipt.
    pub encoded_receipt: Bytes,
}

/// Builds receipt proofs for one chain.
#[derive(Debug, Clone, Copy)]
pub struct ProofBuilder {
    /// Whether the chain's header `receipts_root` is known to differ from
    /// the canonical derivation, in which case the derived root replaces
    /// the header's field instead of being checked against it.
    recompute_root: bool,
}

impl ProofBuilder {
    /// Creates a builder. `recompute_root` comes from the chain-id
    /// allow-list in the configuration.
    pub fn new(recompute_root: bool) -> Self {
        Self { recompute_root }
    }

    /// The receipts root submissions for this block must commit to.
    ///
    /// For ordinary chains this is the header's own root, after checking
    /// that the fetched receipts actually derive it; a disagreement means
    /// the upstream is inconsistent and nothing may be submitted.
    pub fn effective_root(
        &self,
        header: &Header,
        receipts: &[TransactionReceipt],
    ) -> Result<H256> {
        let derived = derive_receipts_root(receipts);
        if self.recompute_root {
            return Ok(derived);
        }
        if derived != header.receipts_root {
            return Err(Error::ProofMismatch {
                block: header.number,
                expected: header.receipts_root,
                derived,
            });
        }
        Ok(derived)
    }

    /// Builds the proof for `log` within the block described by `header`,
    /// given the block's receipts in block order.
    pub fn build(
        &self,
        header: &Header,
        receipts: &[TransactionReceipt],
        log: &Log,
    ) -> Result<ProofArtifact> {
        let root = self.effective_root(header, receipts)?;
        let receipt_index = log
            .transaction_index
            .ok_or(Error::Generic("log carries no transaction index"))?
            .as_u64();
        let receipt = receipts
            .iter()
            .find(|r| r.transaction_index.as_u64() == receipt_index)
            .ok_or(Error::Generic("log's receipt missing from block"))?;
        let (derived, trie_proof) = receipt_proof(receipts, receipt_index);
        debug_assert_eq!(derived, root);
        Ok(ProofArtifact {
            header_number: header.number,
            receipts_root: root,
            trie_proof,
            log_index: log
                .log_index
                .ok_or(Error::Generic("log carries no log index"))?
                .as_u64(),
            receipt_index,
            encoded_receipt: encode_receipt(receipt),
        })
    }
}

/// The trie key of the receipt at `index`: its RLP encoding.
pub fn receipt_key(index: u64) -> Vec<u8> {
    rlp::encode(&index).to_vec()
}

/// Re-encodes a receipt to its consensus form.
///
/// Typed receipts get their EIP-2718 type byte prefix; the body is the RLP
/// list of status (or pre-Byzantium state root), cumulative gas, bloom and
/// logs.
pub fn encode_receipt(receipt: &TransactionReceipt) -> Bytes {
    let mut s = rlp::RlpStream::new_list(4);
    match (receipt.status, receipt.root) {
        (Some(status), _) => s.append(&status.as_u64()),
        (None, Some(root)) => s.append(&root),
        (None, None) => s.append(&0u64),
    };
    s.append(&receipt.cumulative_gas_used);
    s.append(&receipt.logs_bloom);
    s.begin_list(receipt.logs.len());
    for log in &receipt.logs {
        s.begin_list(3);
        s.append(&log.address);
        s.append_list(&log.topics);
        s.append(&log.data.to_vec());
    }
    let payload = s.out().to_vec();
    match receipt.transaction_type {
        Some(t) if !t.is_zero() => {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.push(t.as_u64() as u8);
            out.extend_from_slice(&payload);
            out.into()
        }
        _ => payload.into(),
    }
}

fn trie_pairs(
    receipts: &[TransactionReceipt],
) -> Vec<(Nibbles, Vec<u8>)> {
    let mut pairs: Vec<(Nibbles, Vec<u8>)> = receipts
        .iter()
        .enumerate()
        .map(|(i, receipt)| {
            let key = receipt_key(i as u64);
            (Nibbles::unpack(&key), encode_receipt(receipt).to_vec())
        })
        .collect();
    // the hash builder expects leaves in nibble order, not block order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

/// Derives the receipts-trie root for a block's receipts.
pub fn derive_receipts_root(receipts: &[TransactionReceipt]) -> H256 {
    let mut builder = HashBuilder::default();
    for (key, value) in trie_pairs(receipts) {
        builder.add_leaf(key, &value);
    }
    H256::from(builder.root().0)
}

/// Derives the root and the proof path for the receipt at `target_index`,
/// ordered root to leaf.
pub fn receipt_proof(
    receipts: &[TransactionReceipt],
    target_index: u64,
) -> (H256, Vec<Bytes>) {
    let target = Nibbles::unpack(&receipt_key(target_index));
    let retainer = ProofRetainer::new(vec![target]);
    let mut builder = HashBuilder::default().with_proof_retainer(retainer);
    for (key, value) in trie_pairs(receipts) {
        builder.add_leaf(key, &value);
    }
    let root = H256::from(builder.root().0);
    let proof = builder
        .take_proof_nodes()
        .into_nodes_sorted()
        .into_iter()
        .map(|(_, node)| Bytes::from(node.to_vec()))
        .collect();
    (root, proof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_trie::EMPTY_ROOT_HASH;
    use ethers::types::{Address, U256, U64};
    use ethers::utils::keccak256;

    fn receipt_at(index: u64, topic: H256) -> TransactionReceipt {
        TransactionReceipt {
            transaction_index: U64::from(index),
            status: Some(U64::one()),
            cumulative_gas_used: U256::from(21_000 * (index + 1)),
            logs: vec![Log {
                address: Address::repeat_byte(0x11),
                topics: vec![topic],
                data: vec![index as u8; 40].into(),
                transaction_index: Some(U64::from(index)),
                log_index: Some(U256::from(index)),
                ..Default::default()
            }],
            transaction_type: Some(U64::from(2)),
            ..Default::default()
        }
    }

    fn block_receipts(n: u64) -> Vec<TransactionReceipt> {
        (0..n).map(|i| receipt_at(i, H256::repeat_byte(0xAA))).collect()
    }

    #[test]
    fn receipt_keys_are_rlp_indices() {
        assert_eq!(receipt_key(0), vec![0x80]);
        assert_eq!(receipt_key(1), vec![0x01]);
        assert_eq!(receipt_key(127), vec![0x7f]);
        assert_eq!(receipt_key(128), vec![0x81, 0x80]);
    }

    #[test]
    fn empty_block_derives_the_empty_root() {
        assert_eq!(
            derive_receipts_root(&[]),
            H256::from(EMPTY_ROOT_HASH.0)
        );
    }

    #[test]
    fn typed_receipts_carry_their_type_byte() {
        let encoded = encode_receipt(&receipt_at(0, H256::zero()));
        assert_eq!(encoded[0], 2);
        let mut legacy = receipt_at(0, H256::zero());
        legacy.transaction_type = None;
        let encoded = encode_receipt(&legacy);
        // legacy receipts are a bare RLP list.
        assert!(encoded[0] >= 0xc0);
    }

    #[test]
    fn derivation_is_deterministic_and_order_sensitive() {
        let receipts = block_receipts(3);
        let root = derive_receipts_root(&receipts);
        assert_eq!(root, derive_receipts_root(&receipts));
        assert_ne!(root, derive_receipts_root(&receipts[..1]));
        assert_ne!(root, H256::from(EMPTY_ROOT_HASH.0));
    }

    #[test]
    fn proofs_verify_against_the_derived_root() {
        let receipts = block_receipts(5);
        let root = derive_receipts_root(&receipts);
        for index in 0..5u64 {
            let (proof_root, proof) = receipt_proof(&receipts, index);
            assert_eq!(proof_root, root);
            let proof: Vec<alloy_primitives::Bytes> = proof
                .iter()
                .map(|node| {
                    alloy_primitives::Bytes::copy_from_slice(node)
                })
                .collect();
            alloy_trie::proof::verify_proof(
                alloy_primitives::B256::from(root.0),
                Nibbles::unpack(&receipt_key(index)),
                Some(encode_receipt(&receipts[index as usize]).to_vec()),
                &proof,
            )
            .unwrap();
        }
    }

    #[test]
    fn first_proof_node_hashes_to_the_root() {
        let receipts = block_receipts(4);
        let (root, proof) = receipt_proof(&receipts, 2);
        assert!(!proof.is_empty());
        assert_eq!(H256::from(keccak256(&proof[0])), root);
    }

    #[test]
    fn artifact_commits_to_the_header_root() {
        let receipts = block_receipts(4);
        let header = Header {
            number: 100,
            hash: H256::repeat_byte(0x01),
            receipts_root: derive_receipts_root(&receipts),
        };
        let log = receipts[2].logs[0].clone();
        let artifact = ProofBuilder::new(false)
            .build(&header, &receipts, &log)
            .unwrap();
        assert_eq!(artifact.header_number, 100);
        assert_eq!(artifact.receipts_root, header.receipts_root);
        assert_eq!(artifact.receipt_index, 2);
        assert_eq!(artifact.log_index, 2);
        assert_eq!(artifact.encoded_receipt, encode_receipt(&receipts[2]));
    }

    #[test]
    fn mismatching_header_is_fatal() {
        let receipts = block_receipts(2);
        let header = Header {
            number: 77,
            hash: H256::zero(),
            receipts_root: H256::repeat_byte(0xDE),
        };
        let log = receipts[0].logs[0].clone();
        let err = ProofBuilder::new(false)
            .build(&header, &receipts, &log)
            .unwrap_err();
        assert!(matches!(err, Error::ProofMismatch { block: 77, .. }));
        // the allow-listed variant overwrites instead.
        let artifact = ProofBuilder::new(true)
            .build(&header, &receipts, &log)
            .unwrap();
        assert_eq!(artifact.receipts_root, derive_receipts_root(&receipts));
    }
}
