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
//! # Keystore Module
//!
//! Management of the encrypted key files the relayer signs with, and the
//! resolution of a chain's configured signer into a wallet.

use std::path::Path;

use ethers::signers::{LocalWallet, Signer};

use crate::config::ChainConfig;
use crate::{Error, Result};

/// Environment variable holding the password for keystore files named by
/// `keystore-ref`.
pub const KEYSTORE_PASSWORD_ENV: &str = "ATLAS_KEYSTORE_PASSWORD";

/// Generates a new key and writes it as an encrypted keystore file under
/// `dir`. Returns the new address and the file name.
pub fn generate(
    dir: &Path,
    password: &str,
) -> Result<(ethers::types::Address, String)> {
    std::fs::create_dir_all(dir)?;
    let (wallet, file) =
        LocalWallet::new_keystore(dir, &mut rand::thread_rng(), password, None)?;
    Ok((wallet.address(), file))
}

/// Imports a raw hex private key as an encrypted keystore file under
/// `dir`. Returns the imported address and the file name.
pub fn import(
    dir: &Path,
    private_key: &str,
    password: &str,
) -> Result<(ethers::types::Address, String)> {
    std::fs::create_dir_all(dir)?;
    let raw = private_key.trim().trim_start_matches("0x");
    let sk = hex::decode(raw)
        .map_err(|_| Error::Generic("private key is not valid hex"))?;
    let (wallet, file) = LocalWallet::encrypt_keystore(
        dir,
        &mut rand::thread_rng(),
        &sk,
        password,
        None,
    )?;
    Ok((wallet.address(), file))
}

/// Lists the keystore file names under `dir`.
pub fn list(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names)
}

/// Resolves the wallet a chain signs with: the inline `private-key` when
/// present, otherwise the keystore file named by `keystore-ref` decrypted
/// with the password from [`KEYSTORE_PASSWORD_ENV`].
///
/// The resolved address must match the configured `from` address; a
/// mismatch is a startup error, not something to discover on the first
/// submission.
pub fn wallet_for_chain(
    config: &ChainConfig,
    keystore_path: &Path,
) -> Result<LocalWallet> {
    let wallet = if let Some(key) = &config.private_key {
        LocalWallet::from_bytes(key.as_bytes())?
    } else if let Some(reference) = &config.keystore_ref {
        let password = std::env::var(KEYSTORE_PASSWORD_ENV)
            .map_err(|_| Error::MissingSecrets)?;
        LocalWallet::decrypt_keystore(keystore_path.join(reference), password)?
    } else {
        return Err(Error::MissingSecrets);
    };
    if wallet.address() != config.from {
        return Err(Error::Generic(
            "resolved signer does not match the configured from address",
        ));
    }
    Ok(wallet.with_chain_id(config.id.0))
}
