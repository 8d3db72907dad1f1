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
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! # Atlas Relayer Crate
//!
//! A crate for relaying events and block headers between a set of spoke
//! chains and a distinguished hub chain.
//!
//! ## Overview
//!
//! The relayer watches every configured chain for a set of oracle events.
//! For each finalized block that carries a matching event it assembles a
//! Merkle-Patricia receipt-trie proof together with the block header, and
//! submits the result to the hub chain. Symmetrically, header attestations
//! observed on the hub are propagated outward to the spoke chains that
//! subscribed to them.
//!
//! The engine is built out of four pieces, wired together by the
//! [`service`] supervisor:
//!
//! 1. A per-chain [`listener`] that scans confirmed blocks in strict
//!    ascending order and translates matching logs into typed messages.
//! 2. A [`router`] that demultiplexes messages to the writer of the
//!    destination chain.
//! 3. A per-chain [`writer`] that serializes submissions, leases nonces,
//!    classifies chain errors and retries until the chain either accepts
//!    the transaction or reports it as a duplicate.
//! 4. A durable [`blockstore`] cursor that anchors restarts: a chain is
//!    never re-scanned below its persisted height.
//!
//! Everything that talks to a concrete chain sits behind the
//! [`client::ChainClient`] capability, so new chains are added by
//! implementing that trait rather than by touching the engine.

/// A durable per-chain block cursor used to resume scanning after restart.
pub mod blockstore;
/// The chain capability trait and its EVM implementation.
pub mod client;
/// Configuration types and loading.
pub mod config;
/// A module for managing the context of the relayer.
pub mod context;
mod error;
/// Health and metrics HTTP exposure.
pub mod health;
/// Keystore management for the relayer accounts.
pub mod keystore;
/// A module that listens for events on a given chain.
pub mod listener;
/// Metrics functionality.
pub mod metric;
/// Account balance monitoring.
pub mod monitor;
/// Out-of-band operator alerts.
pub mod notifier;
/// A module used for debugging relayer lifecycle, sync state, or other relayer state.
pub mod probe;
/// Receipt-trie proof construction.
pub mod proof;
/// Calldata shapes understood by the hub and spoke contracts.
pub mod protocol;
/// Retry policies.
pub mod retry;
/// Message routing between listeners and writers.
pub mod router;
/// A module for starting and supervising the long-running chain tasks.
pub mod service;
/// Shared primitive types.
pub mod types;
/// A module that submits outbound transactions for a given chain.
pub mod writer;

#[cfg(test)]
mod test_utils;

pub use error::{ChainError, Error, Result};
