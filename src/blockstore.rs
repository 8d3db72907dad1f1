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
//! # Relayer Blockstore Module
//!
//! The blockstore is the durable per-chain "last processed block" cursor.
//! A restart resumes scanning at the persisted height, so a chain is never
//! re-scanned below it and never skips ahead of it.

use std::fmt::Debug;
use std::path::PathBuf;

use parking_lot::RwLock;

use crate::types::ChainId;
use crate::Result;

/// A durable per-chain block cursor.
pub trait BlockStore: Send + Sync {
    /// Returns the last persisted height for `chain_id`, or `None` when the
    /// chain has never been scanned.
    fn load(&self, chain_id: ChainId) -> Result<Option<u64>>;

    /// Persists `height` for `chain_id` atomically, so a crash never
    /// yields a partial cursor.
    fn store(&self, chain_id: ChainId, height: u64) -> Result<()>;

    /// Returns the last persisted height, or `default` when empty.
    fn load_or(&self, chain_id: ChainId, default: u64) -> Result<u64> {
        Ok(self.load(chain_id)?.unwrap_or(default))
    }
}

/// A [`BlockStore`] that keeps one file per chain under a directory.
///
/// The file holds the decimal height; writes go to a temp file first and
/// are moved into place with a rename.
#[derive(Clone)]
pub struct FileBlockStore {
    dir: PathBuf,
}

impl Debug for FileBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlockStore").field("dir", &self.dir).finish()
    }
}

impl FileBlockStore {
    /// Opens (and creates if necessary) the cursor directory.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, chain_id: ChainId) -> PathBuf {
        self.dir.join(format!("block-{chain_id}"))
    }
}

impl BlockStore for FileBlockStore {
    #[tracing::instrument(skip(self))]
    fn load(&self, chain_id: ChainId) -> Result<Option<u64>> {
        let path = self.path_for(chain_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let height = raw.trim().parse::<u64>()?;
        Ok(Some(height))
    }

    #[tracing::instrument(skip(self))]
    fn store(&self, chain_id: ChainId, height: u64) -> Result<()> {
        let path = self.path_for(chain_id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, height.to_string())?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// An in-memory [`BlockStore`], used in tests.
#[derive(Clone, Default)]
pub struct InMemoryBlockStore {
    cursors: std::sync::Arc<RwLock<std::collections::HashMap<ChainId, u64>>>,
}

impl Debug for InMemoryBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBlockStore").finish()
    }
}

impl BlockStore for InMemoryBlockStore {
    fn load(&self, chain_id: ChainId) -> Result<Option<u64>> {
        Ok(self.cursors.read().get(&chain_id).copied())
    }

    fn store(&self, chain_id: ChainId, height: u64) -> Result<()> {
        self.cursors.write().insert(chain_id, height);
        Ok(())
    }
}
