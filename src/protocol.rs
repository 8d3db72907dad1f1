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
//! # Protocol Module
//!
//! The ABI call shapes the hub and spoke contracts understand. Listeners
//! build full calldata here; writers submit it untouched, so the wire
//! format of the pipeline lives in exactly one place.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;
use serde::Deserialize;

use crate::proof::ProofArtifact;
use crate::types::ChainId;
use crate::{Error, Result};

fn call(signature: &str, tokens: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(tokens));
    data.into()
}

/// The selector-less header attestation blob: `(headerNumber,
/// receiptsRoot)`. This is what `updateBlockHeader` wraps when the hub
/// fans its headers out.
pub fn header_blob(number: u64, receipts_root: H256) -> Bytes {
    abi::encode(&[
        Token::Uint(U256::from(number)),
        Token::FixedBytes(receipts_root.as_bytes().to_vec()),
    ])
    .into()
}

/// `propose(uint256,bytes32)`: the plain oracle attestation.
pub fn pack_propose(number: u64, receipts_root: H256) -> Bytes {
    call(
        "propose(uint256,bytes32)",
        &[
            Token::Uint(U256::from(number)),
            Token::FixedBytes(receipts_root.as_bytes().to_vec()),
        ],
    )
}

/// `propose(address[],uint256,bytes32,bytes)`: the attestation shape used
/// when a zk-proof endpoint is configured for the chain.
pub fn pack_propose_with_zk(
    validators: &[Address],
    number: u64,
    receipts_root: H256,
    zk_proof: &Bytes,
) -> Bytes {
    call(
        "propose(address[],uint256,bytes32,bytes)",
        &[
            Token::Array(
                validators.iter().copied().map(Token::Address).collect(),
            ),
            Token::Uint(U256::from(number)),
            Token::FixedBytes(receipts_root.as_bytes().to_vec()),
            Token::Bytes(zk_proof.to_vec()),
        ],
    )
}

/// `updateBlockHeader(uint256,bytes)`: hub-to-spoke header sync.
pub fn pack_update_block_header(
    source: ChainId,
    header_blob: &Bytes,
) -> Bytes {
    call(
        "updateBlockHeader(uint256,bytes)",
        &[
            Token::Uint(U256::from(source.0)),
            Token::Bytes(header_blob.to_vec()),
        ],
    )
}

/// `proveReceipt(uint256,bytes)`: delivery of one receipt proof to the
/// hub. The inner blob is `(headerNumber, receiptsRoot, trieProof[],
/// receiptKey, logIndex, encodedReceipt)`.
pub fn pack_prove_receipt(
    source: ChainId,
    artifact: &ProofArtifact,
) -> Bytes {
    let blob = abi::encode(&[
        Token::Uint(U256::from(artifact.header_number)),
        Token::FixedBytes(artifact.receipts_root.as_bytes().to_vec()),
        Token::Array(
            artifact
                .trie_proof
                .iter()
                .map(|node| Token::Bytes(node.to_vec()))
                .collect(),
        ),
        Token::Bytes(crate::proof::receipt_key(artifact.receipt_index)),
        Token::Uint(U256::from(artifact.log_index)),
        Token::Bytes(artifact.encoded_receipt.to_vec()),
    ]);
    call(
        "proveReceipt(uint256,bytes)",
        &[Token::Uint(U256::from(source.0)), Token::Bytes(blob)],
    )
}

/// `headerHeight(uint256)`: asks a light-node contract how far a chain is
/// already synced.
pub fn synced_height_calldata(chain: ChainId) -> Bytes {
    call("headerHeight(uint256)", &[Token::Uint(U256::from(chain.0))])
}

/// Decodes the return of [`synced_height_calldata`].
pub fn decode_synced_height(ret: &Bytes) -> Result<u64> {
    let tokens = abi::decode(&[ParamType::Uint(256)], ret)?;
    match tokens.first() {
        Some(Token::Uint(height)) => Ok(height.as_u64()),
        _ => Err(Error::Generic("malformed headerHeight return")),
    }
}

/// `currentValidators()`: asks the oracle contract for the validator set
/// the zk attestation must name.
pub fn validators_calldata() -> Bytes {
    call("currentValidators()", &[])
}

/// Decodes the return of [`validators_calldata`].
pub fn decode_validators(ret: &Bytes) -> Result<Vec<Address>> {
    let tokens =
        abi::decode(&[ParamType::Array(Box::new(ParamType::Address))], ret)?;
    match tokens.into_iter().next() {
        Some(Token::Array(inner)) => inner
            .into_iter()
            .map(|t| match t {
                Token::Address(a) => Ok(a),
                _ => Err(Error::Generic("malformed validator entry")),
            })
            .collect(),
        _ => Err(Error::Generic("malformed currentValidators return")),
    }
}

#[derive(Debug, Deserialize)]
struct ZkProofResponse {
    proof: String,
}

/// Fetches the zk proof for `(chain, height)` from the configured
/// endpoint. The endpoint answers `{"proof": "0x..."}`.
pub async fn fetch_zk_proof(
    http: &reqwest::Client,
    api_url: &url::Url,
    chain: ChainId,
    height: u64,
) -> Result<Bytes> {
    let response: ZkProofResponse = http
        .post(api_url.clone())
        .json(&serde_json::json!({
            "chain_id": chain.0,
            "block_number": height,
        }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let raw = response.proof.trim_start_matches("0x");
    let bytes = hex::decode(raw)
        .map_err(|_| Error::Generic("zk endpoint returned malformed hex"))?;
    Ok(bytes.into())
}
