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
//! # Health Module
//!
//! The optional `/metrics` + `/health` HTTP surface. Listeners record
//! their progress into [`HealthState`]; a chain is healthy while its last
//! processed block is younger than the freshness threshold.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::get;
use axum::Json;
use parking_lot::RwLock;
use serde::Serialize;

use crate::context::RelayerContext;
use crate::types::ChainId;
use crate::Result;

/// Environment variable controlling the health freshness threshold, in
/// seconds.
pub const HEALTH_BLOCK_TIMEOUT_ENV: &str = "HEALTH_BLOCK_TIMEOUT";

const DEFAULT_BLOCK_TIMEOUT_SECS: u64 = 180;

/// The freshness threshold from the environment, default 180 seconds.
pub fn block_timeout_from_env() -> Duration {
    let secs = std::env::var(HEALTH_BLOCK_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_BLOCK_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

#[derive(Debug, Clone)]
struct ChainProgress {
    name: String,
    last_block: u64,
    updated_at: Instant,
}

/// Shared per-chain progress, recorded by listeners.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    inner: Arc<RwLock<HashMap<ChainId, ChainProgress>>>,
}

/// One row of the `/health` response.
#[derive(Debug, Clone, Serialize)]
pub struct ChainHealth {
    /// Chain name.
    pub chain: String,
    /// Chain id.
    pub chain_id: u64,
    /// Last fully processed block.
    pub last_block: u64,
    /// Seconds since the listener last made progress.
    pub age_seconds: u64,
    /// Whether the age is under the freshness threshold.
    pub healthy: bool,
}

impl HealthState {
    /// Records listener progress for a chain.
    pub fn record(&self, chain_id: ChainId, name: &str, last_block: u64) {
        self.inner.write().insert(
            chain_id,
            ChainProgress {
                name: name.to_string(),
                last_block,
                updated_at: Instant::now(),
            },
        );
    }

    /// The current per-chain health rows, judged against `threshold`.
    pub fn snapshot(&self, threshold: Duration) -> Vec<ChainHealth> {
        let mut rows: Vec<ChainHealth> = self
            .inner
            .read()
            .iter()
            .map(|(id, progress)| {
                let age = progress.updated_at.elapsed();
                ChainHealth {
                    chain: progress.name.clone(),
                    chain_id: id.0,
                    last_block: progress.last_block,
                    age_seconds: age.as_secs(),
                    healthy: age <= threshold,
                }
            })
            .collect();
        rows.sort_by_key(|row| row.chain_id);
        rows
    }
}

#[derive(Clone)]
struct AppState {
    ctx: RelayerContext,
    threshold: Duration,
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.ctx.metrics.gather().unwrap_or_default()
}

async fn health_handler(
    State(state): State<AppState>,
) -> Json<Vec<ChainHealth>> {
    Json(state.ctx.health.snapshot(state.threshold))
}

/// Serves `/metrics` and `/health` until shutdown.
pub async fn serve(ctx: RelayerContext, port: u16) -> Result<()> {
    let threshold = block_timeout_from_env();
    let mut shutdown = ctx.shutdown_signal();
    let state = AppState { ctx, threshold };
    let app = axum::Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting the health server on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.recv().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_chains_are_healthy() {
        let state = HealthState::default();
        state.record(ChainId(97), "spoke", 100);
        let rows = state.snapshot(Duration::from_secs(180));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_block, 100);
        assert!(rows[0].healthy);
        // a zero threshold makes everything stale.
        let rows = state.snapshot(Duration::from_secs(0));
        assert!(!rows.is_empty());
    }

    #[test]
    fn timeout_env_defaults_to_180() {
        assert_eq!(block_timeout_from_env(), Duration::from_secs(180));
    }
}
