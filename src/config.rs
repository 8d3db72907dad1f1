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
//! # Relayer Configuration Module
//!
//! Static configuration for the relayer: one hub chain, any number of spoke
//! chains, the keystore and blockstore directories, and the optional alert
//! and metrics surfaces. The whole tree is immutable after start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use config::{Config, File};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::types::ChainId;
use crate::{Error, Result};

const fn default_confirmations() -> u64 {
    10
}

const fn default_gas_limit() -> u64 {
    4_000_000
}

/// RelayerConfig is the top-level configuration for the relayer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayerConfig {
    /// The hub chain: the chain events are proved to and headers are
    /// propagated from.
    pub hub_chain: ChainConfig,
    /// The spoke chains.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    /// Directory that holds the encrypted keystore files.
    pub keystore_path: PathBuf,
    /// Directory that holds the per-chain block cursors.
    pub blockstore_path: PathBuf,
    /// Optional webhook that receives operator alerts as `{"text": ...}`.
    #[serde(default)]
    pub alert_hook: Option<url::Url>,
    /// Chains whose header `receipts-root` is known to differ from the
    /// canonical derivation; for these the root is recomputed from the
    /// fetched receipts and the header's field overwritten before encoding.
    #[serde(default)]
    pub recompute_receipt_chains: Vec<ChainId>,
    /// Metrics and health exposure.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Controls the optional `/metrics` + `/health` HTTP surface.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    /// Port to serve on. Absent means the server is not started.
    #[serde(default)]
    pub port: Option<u16>,
}

/// ChainConfig is the per-chain configuration, frozen for the run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// Human-readable chain name, used in logs and file names.
    pub name: String,
    /// The chain id.
    pub id: ChainId,
    /// Http(s) JSON-RPC endpoint.
    pub endpoint: url::Url,
    /// The address submissions are sent from on this chain.
    pub from: Address,
    /// Name of the keystore file (under `keystore-path`) holding the key
    /// for `from`.
    #[serde(default)]
    pub keystore_ref: Option<String>,
    /// Inline private key, as an alternative to `keystore-ref`. Supports a
    /// raw `0x`-prefixed hex value or a `$ENV_VAR` indirection.
    #[serde(default, skip_serializing)]
    pub private_key: Option<PrivateKey>,
    /// The block scanning starts from on first run.
    #[serde(default)]
    pub start_block: u64,
    /// Reset the cursor to `start-block`, ignoring the blockstore.
    #[serde(default)]
    pub fresh_start: bool,
    /// Jump the cursor to the chain tip at start.
    #[serde(default)]
    pub latest_only: bool,
    /// How many blocks the listener lags the tip to avoid reorgs.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Topic0 selectors of the events to relay. When empty, the listener
    /// falls back to the `events` key of `opts` (comma-separated event
    /// signatures).
    #[serde(default)]
    pub event_selectors: Vec<H256>,
    /// Whether this chain attests its headers to the hub.
    #[serde(default)]
    pub sync_to_hub: bool,
    /// For the hub chain: the spokes its header updates fan out to.
    #[serde(default)]
    pub sync_chain_ids: Vec<ChainId>,
    /// Filled in after loading; spokes never configure this themselves.
    #[serde(default)]
    pub hub_chain_id: ChainId,
    /// Gas limit for outbound transactions.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Fixed gas price in wei. When absent the writer asks the client.
    #[serde(default)]
    pub gas_price: Option<u64>,
    /// Every timer the chain's pipelines use.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Chain-specific options, read lazily. Recognized keys:
    /// `oracle-node`, `light-node`, `mos`, `events`, `api-url`,
    /// `water-line`, `change-interval`, `balance-interval`.
    #[serde(default)]
    pub opts: HashMap<String, String>,
}

impl ChainConfig {
    fn opt(&self, key: &'static str) -> Result<&str> {
        self.opts.get(key).map(String::as_str).ok_or(Error::InvalidOpt {
            key,
            value: "<missing>".into(),
        })
    }

    fn opt_address(&self, key: &'static str) -> Result<Address> {
        let raw = self.opt(key)?;
        Address::from_str(raw).map_err(|_| Error::InvalidOpt {
            key,
            value: raw.to_string(),
        })
    }

    /// The contract whose logs the listener filters for.
    pub fn oracle_node(&self) -> Result<Address> {
        self.opt_address("oracle-node")
    }

    /// The light-node contract submissions on this chain are sent to.
    pub fn light_node(&self) -> Result<Address> {
        self.opt_address("light-node")
    }

    /// The contract receipt proofs are delivered to. Falls back to the
    /// light node when not configured separately.
    pub fn mos(&self) -> Result<Address> {
        self.opt_address("mos").or_else(|_| self.light_node())
    }

    /// Optional endpoint serving zk proofs for header attestations.
    pub fn api_url(&self) -> Option<url::Url> {
        self.opts.get("api-url").and_then(|v| v.parse().ok())
    }

    /// The topic0 selectors this chain's listener filters for.
    ///
    /// Explicit `event-selectors` win; otherwise the `events` opt is a
    /// comma-separated list of event signatures hashed here.
    pub fn event_topics(&self) -> Vec<H256> {
        if !self.event_selectors.is_empty() {
            return self.event_selectors.clone();
        }
        self.opts
            .get("events")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|sig| H256::from(keccak256(sig.as_bytes())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Minimum balance (in wei) the monitor alerts below, when set.
    pub fn water_line(&self) -> Option<U256> {
        self.opts
            .get("water-line")
            .and_then(|v| U256::from_dec_str(v).ok())
    }

    /// Alert when the balance has not changed for this long.
    pub fn change_interval(&self) -> Option<Duration> {
        self.opts
            .get("change-interval")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
    }

    /// How often the balance monitor polls, default 10 minutes.
    pub fn balance_interval(&self) -> Duration {
        self.opts
            .get("balance-interval")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(600))
    }

    /// Whether this chain is the hub.
    pub fn is_hub(&self) -> bool {
        self.id == self.hub_chain_id
    }
}

/// An inline private key. The format is dynamic:
///
/// 1. if it starts with `0x` then it is a raw (32 byte) hex encoded
///    private key.
/// 2. if it starts with `$` then it is an environment variable holding a
///    hex encoded private key.
#[derive(Clone)]
pub struct PrivateKey(H256);

impl PrivateKey {
    /// Wraps an already-loaded raw secret.
    pub fn from_raw(secret: H256) -> Self {
        Self(secret)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").finish()
    }
}

impl std::ops::Deref for PrivateKey {
    type Target = H256;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PrivateKeyVisitor;
        impl<'de> serde::de::Visitor<'de> for PrivateKeyVisitor {
            type Value = H256;

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                formatter.write_str(
                    "hex string or an env var containing a hex string in it",
                )
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if let Some(hex_value) = value.strip_prefix("0x") {
                    H256::from_str(hex_value).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "{e}: expected a 66 chars string (including the 0x prefix)"
                        ))
                    })
                } else if let Some(var) = value.strip_prefix('$') {
                    tracing::trace!("Reading {} from env", var);
                    let val = std::env::var(var).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "error while loading this env {var}: {e}",
                        ))
                    })?;
                    let stripped = val.strip_prefix("0x").unwrap_or(&val);
                    H256::from_str(stripped).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "{e}: expected a hex string in ${var}"
                        ))
                    })
                } else {
                    Err(serde::de::Error::custom(
                        "expected a 0x-prefixed hex key or a $ENV_VAR",
                    ))
                }
            }
        }

        let secret = deserializer.deserialize_str(PrivateKeyVisitor)?;
        Ok(Self(secret))
    }
}

impl Serialize for PrivateKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("<redacted>")
    }
}

/// Loads the relayer configuration from a TOML or JSON file, merging in an
/// `ATLAS`-prefixed environment overlay, then validates it.
pub fn load<P: AsRef<Path>>(path: P) -> Result<RelayerConfig> {
    let path = path.as_ref();
    let ext = path.extension().map(|e| e.to_str().unwrap_or("")).unwrap_or("");
    let format = match ext {
        "json" => config::FileFormat::Json,
        _ => config::FileFormat::Toml,
    };
    tracing::trace!("Loading config file: {}", path.display());
    let cfg = Config::builder()
        .add_source(File::from(path).format(format))
        .add_source(config::Environment::with_prefix("ATLAS").separator("_"))
        .build()?;
    let config: std::result::Result<
        RelayerConfig,
        serde_path_to_error::Error<config::ConfigError>,
    > = serde_path_to_error::deserialize(cfg);
    match config {
        Ok(c) => postloading_process(c),
        Err(e) => {
            tracing::error!("{}", e);
            Err(e.into())
        }
    }
}

/// The postloading_process exists to validate configuration and standardize
/// the format of the configuration.
pub fn postloading_process(
    mut config: RelayerConfig,
) -> Result<RelayerConfig> {
    tracing::trace!("Checking configuration sanity ...");
    let hub_id = config.hub_chain.id;
    config.hub_chain.hub_chain_id = hub_id;
    // the hub always attests for itself.
    config.hub_chain.sync_to_hub = true;
    for chain in &mut config.chains {
        chain.hub_chain_id = hub_id;
        if chain.id == hub_id {
            return Err(Error::Generic(
                "a spoke chain reuses the hub chain id",
            ));
        }
    }
    let mut seen = std::collections::HashSet::new();
    for chain in std::iter::once(&config.hub_chain).chain(&config.chains) {
        if !seen.insert(chain.id) {
            return Err(Error::Generic("duplicate chain id in config"));
        }
        if chain.keystore_ref.is_none() && chain.private_key.is_none() {
            return Err(Error::MissingSecrets);
        }
    }
    // fanning out to an unknown chain cannot work; catch it at startup.
    for cid in &config.hub_chain.sync_chain_ids {
        let known = config.chains.iter().any(|c| c.id == *cid);
        if !known {
            tracing::warn!(
                "!!WARNING!!: chain {} is listed in the hub's sync-chain-ids \
                 but is not defined in the config. Header updates for it \
                 will fail to route.",
                cid
            );
        }
    }
    Ok(config)
}
