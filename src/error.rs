use ethers::types::H256;

use crate::types::ChainId;

/// An enum of all possible errors that could be encountered during the
/// execution of the relayer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Error in Http Provider (ethers client).
    #[error(transparent)]
    EthersProvider(#[from] ethers::providers::ProviderError),
    /// Ether wallet errors.
    #[error(transparent)]
    EtherWallet(#[from] ethers::signers::WalletError),
    /// ABI encoding or decoding error.
    #[error(transparent)]
    Abi(#[from] ethers::abi::Error),
    /// Reqwest error.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// Prometheus error.
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
    /// HTTP server error.
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    /// Failed to parse an integer out of a persisted cursor or an option.
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
    /// A tagged error reported by a chain client.
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// Chain not found in the configuration.
    #[error("Chain Not Found: {}", chain_id)]
    ChainNotFound {
        /// The chain id of the chain.
        chain_id: ChainId,
    },
    /// No writer is registered for the destination chain.
    #[error("No writer registered for destination chain {}", chain_id)]
    NoSuchDestination {
        /// The destination chain id of the message.
        chain_id: ChainId,
    },
    /// Missing secrets in the config, either private key or keystore ref.
    #[error("Missing required private-key or keystore-ref in the config")]
    MissingSecrets,
    /// A chain option is missing or malformed.
    #[error("Invalid chain option `{}`: {}", key, value)]
    InvalidOpt {
        /// The `opts` key being read.
        key: &'static str,
        /// The raw value found (or "<missing>").
        value: String,
    },
    /// The receipts trie derived from the fetched receipts disagrees with
    /// the header committed on chain. No submission is attempted.
    #[error(
        "Receipts root mismatch at block {}: header {:?}, derived {:?}",
        block,
        expected,
        derived
    )]
    ProofMismatch {
        /// Block the receipts were fetched for.
        block: u64,
        /// The root the header committed to.
        expected: H256,
        /// The root derived from the fetched receipts.
        derived: H256,
    },
    /// A background task failed and stopped abnormally.
    #[error("Task Stopped Abnormally")]
    TaskStoppedAbnormally,
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
}

/// A chain-observable error, classified once at the client boundary.
///
/// The writer and listener match on this taxonomy, never on strings: the
/// adapter for each chain family does the string matching exactly once when
/// it converts the underlying client error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// The chain says the submission already happened. Treated as success.
    #[error("duplicate submission: {}", _0)]
    Duplicate(String),
    /// The nonce was too low or the replacement was underpriced. Retried
    /// with a nonce refreshed from the chain.
    #[error("nonce invalid: {}", _0)]
    NonceInvalid(String),
    /// The submitting account cannot cover gas. Retried and alerted.
    #[error("insufficient gas: {}", _0)]
    InsufficientGas(String),
    /// Network-level failure (EOF, timeout). Retried with the same nonce.
    #[error("transient network error: {}", _0)]
    Transient(String),
    /// Anything the adapter could not classify. Retried with a fresh nonce.
    #[error("{}", _0)]
    Other(String),
}

impl ChainError {
    /// Classifies a raw error message from a chain endpoint.
    ///
    /// This is the single place strings are inspected; above this boundary
    /// only the enum is matched.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if has(&["order exist", "already exist", "header is have", "already synced"]) {
            Self::Duplicate(message)
        } else if has(&["nonce too low", "underpriced"]) {
            Self::NonceInvalid(message)
        } else if has(&["insufficient funds", "not enough gas", "insufficient balance"]) {
            Self::InsufficientGas(message)
        } else if has(&[
            "eof",
            "timeout",
            "timed out",
            "connection reset",
            "connection refused",
            "broken pipe",
            "deadline exceeded",
        ]) {
            Self::Transient(message)
        } else {
            Self::Other(message)
        }
    }

    /// Whether this error means the submission already landed on chain.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    /// Whether the writer should refresh its nonce before retrying.
    pub fn needs_fresh_nonce(&self) -> bool {
        !matches!(self, Self::Transient(_))
    }
}

/// A type alias for the result used across the relayer.
pub type Result<T> = std::result::Result<T, Error>;
