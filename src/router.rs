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
//! # Router Module
//!
//! Messages cross from listeners to writers here. The router holds only
//! weak addressing (chain id to writer inbox); it owns no writer and
//! buffers nothing beyond the handoff channel. Flow control is the
//! listener awaiting each message's `done` signal before emitting the
//! next, which serializes submissions per (source, destination) pair
//! without bounded-queue tuning.

use std::collections::HashMap;

use ethers::types::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::types::ChainId;
use crate::{Error, Result};

/// Capacity of a writer's inbox. Listeners wait for `done` before the
/// next send, so this never fills in practice.
pub const INBOX_CAPACITY: usize = 16;

/// What a message asks the destination writer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A spoke header attestation going to the hub.
    SyncToHub,
    /// A hub header update going out to a spoke.
    SyncFromHub,
    /// A receipt proof going to the hub.
    DeliverProof,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SyncToHub => write!(f, "sync_to_hub"),
            Self::SyncFromHub => write!(f, "sync_from_hub"),
            Self::DeliverProof => write!(f, "deliver_proof"),
        }
    }
}

/// The unit crossing the router.
#[derive(Debug)]
pub struct Message {
    /// Chain the event was observed on.
    pub source: ChainId,
    /// Chain the submission goes to.
    pub destination: ChainId,
    /// What the writer should do with the payload.
    pub kind: MessageKind,
    /// Ready-made calldata for the destination contract.
    pub payload: Vec<Bytes>,
    done: oneshot::Sender<()>,
}

impl Message {
    fn new(
        source: ChainId,
        destination: ChainId,
        kind: MessageKind,
        calldata: Bytes,
    ) -> (Self, oneshot::Receiver<()>) {
        let (done, done_rx) = oneshot::channel();
        (
            Self {
                source,
                destination,
                kind,
                payload: vec![calldata],
                done,
            },
            done_rx,
        )
    }

    /// A spoke header attestation for the hub.
    pub fn sync_to_hub(
        source: ChainId,
        hub: ChainId,
        calldata: Bytes,
    ) -> (Self, oneshot::Receiver<()>) {
        Self::new(source, hub, MessageKind::SyncToHub, calldata)
    }

    /// A hub header update for a spoke.
    pub fn sync_from_hub(
        hub: ChainId,
        destination: ChainId,
        calldata: Bytes,
    ) -> (Self, oneshot::Receiver<()>) {
        Self::new(hub, destination, MessageKind::SyncFromHub, calldata)
    }

    /// A receipt proof for the hub.
    pub fn deliver_proof(
        source: ChainId,
        hub: ChainId,
        calldata: Bytes,
    ) -> (Self, oneshot::Receiver<()>) {
        Self::new(source, hub, MessageKind::DeliverProof, calldata)
    }

    /// Signals `done` to the emitting listener. Consumes the message, so
    /// it can only happen once.
    pub fn ack(self) {
        // the listener may have given up (shutdown); nothing to do then.
        let _ = self.done.send(());
    }
}

/// Chain-id addressed delivery of messages to writer inboxes.
#[derive(Debug, Default)]
pub struct Router {
    routes: RwLock<HashMap<ChainId, mpsc::Sender<Message>>>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the inbox of the writer for `chain_id`.
    pub fn register(&self, chain_id: ChainId, inbox: mpsc::Sender<Message>) {
        self.routes.write().insert(chain_id, inbox);
    }

    /// Delivers `message` to the writer of its destination chain.
    pub async fn send(&self, message: Message) -> Result<()> {
        let destination = message.destination;
        let inbox = self
            .routes
            .read()
            .get(&destination)
            .cloned()
            .ok_or(Error::NoSuchDestination {
                chain_id: destination,
            })?;
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::TRACE,
            kind = %crate::probe::Kind::Relay,
            source = %message.source,
            destination = %destination,
            message_kind = %message.kind,
        );
        inbox
            .send(message)
            .await
            .map_err(|_| Error::NoSuchDestination {
                chain_id: destination,
            })
    }
}
