//! Master-key wrapping and per-key encryption.
//!
//! A random 32-byte master key encrypts every private key with AES-256-GCM.
//! The master key itself is wrapped under a key stretched from the
//! passphrase with Argon2id. The Argon2 time cost is calibrated at
//! encryption time so one derivation takes roughly the configured target.
//!
//! # Layouts
//! ```text
//! wrapped master key: nonce (12 bytes) || ciphertext + tag
//! encrypted secret:   ciphertext + tag   (nonce = BLAKE3(pubkey)[..12])
//! ```

use std::time::Instant;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::WalletError;

pub const WALLET_CRYPTO_KEY_SIZE: usize = 32;
pub const WALLET_CRYPTO_SALT_SIZE: usize = 16;
const NONCE_LEN: usize = 12;

/// Derivation method tag stored with each master key.
pub const METHOD_ARGON2ID: u32 = 1;

/// Ceiling on calibrated time cost.
const MAX_ITERATIONS: u32 = 256;

/// Session master key.
pub type KeyingMaterial = Zeroizing<[u8; WALLET_CRYPTO_KEY_SIZE]>;

/// Passphrase stretching parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub target_ms: u64,
    pub memory_kib: u32,
    pub min_iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            target_ms: 100,
            memory_kib: 19_456,
            min_iterations: 2,
        }
    }
}

/// Wrapped master key as persisted.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MasterKeyRecord {
    pub salt: Vec<u8>,
    pub crypted_key: Vec<u8>,
    pub derive_iterations: u32,
    pub memory_kib: u32,
    pub method: u32,
}

fn stretch(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    memory_kib: u32,
) -> Result<KeyingMaterial, WalletError> {
    let params = Params::new(memory_kib, iterations, 1, Some(WALLET_CRYPTO_KEY_SIZE))
        .map_err(|e| WalletError::Encryption(format!("invalid kdf parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new([0u8; WALLET_CRYPTO_KEY_SIZE]);
    argon2
        .hash_password_into(passphrase, salt, &mut out[..])
        .map_err(|e| WalletError::Encryption(format!("key derivation failed: {e}")))?;
    Ok(out)
}

fn timed_stretch(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
    memory_kib: u32,
) -> Result<u64, WalletError> {
    let start = Instant::now();
    stretch(passphrase, salt, iterations, memory_kib)?;
    Ok((start.elapsed().as_millis() as u64).max(1))
}

/// Pick a time cost so one derivation takes about `params.target_ms`.
///
/// Trial at the minimum, scale to the target, re-time and average the two
/// estimates, then clamp to `[min_iterations, MAX_ITERATIONS]`.
pub fn calibrate_iterations(
    passphrase: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<u32, WalletError> {
    let min = params.min_iterations.max(1);
    let target = params.target_ms.max(1);

    let elapsed = timed_stretch(passphrase, salt, min, params.memory_kib)?;
    let mut iterations = (u64::from(min) * target / elapsed).clamp(1, u64::from(MAX_ITERATIONS));

    let elapsed = timed_stretch(passphrase, salt, iterations as u32, params.memory_kib)?;
    iterations = (iterations + iterations * target / elapsed) / 2;

    let iterations = (iterations as u32).clamp(min, MAX_ITERATIONS.max(min));
    debug!(iterations, memory_kib = params.memory_kib, "calibrated passphrase stretching");
    Ok(iterations)
}

fn cipher(key: &[u8; WALLET_CRYPTO_KEY_SIZE]) -> Result<Aes256Gcm, WalletError> {
    Aes256Gcm::new_from_slice(key).map_err(|e| WalletError::Encryption(e.to_string()))
}

impl MasterKeyRecord {
    /// Wrap `master` under `passphrase` with a fresh salt and calibrated cost.
    pub fn create(
        passphrase: &[u8],
        master: &[u8; WALLET_CRYPTO_KEY_SIZE],
        params: &KdfParams,
    ) -> Result<Self, WalletError> {
        let mut salt = vec![0u8; WALLET_CRYPTO_SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let iterations = calibrate_iterations(passphrase, &salt, params)?;
        Self::with_cost(passphrase, master, salt, iterations, params.memory_kib)
    }

    /// Wrap with explicit parameters. No calibration.
    pub fn with_cost(
        passphrase: &[u8],
        master: &[u8; WALLET_CRYPTO_KEY_SIZE],
        salt: Vec<u8>,
        derive_iterations: u32,
        memory_kib: u32,
    ) -> Result<Self, WalletError> {
        let wrap_key = stretch(passphrase, &salt, derive_iterations, memory_kib)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher(&wrap_key)?
            .encrypt(Nonce::from_slice(&nonce_bytes), master.as_slice())
            .map_err(|e| WalletError::Encryption(e.to_string()))?;

        let mut crypted_key = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        crypted_key.extend_from_slice(&nonce_bytes);
        crypted_key.extend_from_slice(&ciphertext);
        Ok(Self {
            salt,
            crypted_key,
            derive_iterations,
            memory_kib,
            method: METHOD_ARGON2ID,
        })
    }

    /// Unwrap the master key. `Ok(None)` means the passphrase is wrong.
    pub fn unwrap_key(&self, passphrase: &[u8]) -> Result<Option<KeyingMaterial>, WalletError> {
        if self.method != METHOD_ARGON2ID {
            return Err(WalletError::Decryption(format!(
                "unknown derivation method {}",
                self.method
            )));
        }
        if self.crypted_key.len() < NONCE_LEN + 16 {
            return Err(WalletError::Decryption("wrapped master key too short".into()));
        }
        let wrap_key = stretch(passphrase, &self.salt, self.derive_iterations, self.memory_kib)?;
        let (nonce, ciphertext) = self.crypted_key.split_at(NONCE_LEN);
        let Ok(plain) = cipher(&wrap_key)?.decrypt(Nonce::from_slice(nonce), ciphertext) else {
            return Ok(None);
        };
        let plain = Zeroizing::new(plain);
        if plain.len() != WALLET_CRYPTO_KEY_SIZE {
            return Ok(None);
        }
        let mut key = Zeroizing::new([0u8; WALLET_CRYPTO_KEY_SIZE]);
        key.copy_from_slice(&plain);
        Ok(Some(key))
    }
}

fn secret_nonce(public_key: &[u8; 32]) -> [u8; NONCE_LEN] {
    let digest = blake3::hash(public_key);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest.as_bytes()[..NONCE_LEN]);
    nonce
}

/// Encrypt a private key under the master key.
pub fn encrypt_secret(
    master: &[u8; WALLET_CRYPTO_KEY_SIZE],
    public_key: &[u8; 32],
    secret: &[u8; 32],
) -> Result<Vec<u8>, WalletError> {
    cipher(master)?
        .encrypt(Nonce::from_slice(&secret_nonce(public_key)), secret.as_slice())
        .map_err(|e| WalletError::Encryption(e.to_string()))
}

/// Decrypt a private key. Fails with [`WalletError::Decryption`] on a wrong master key.
pub fn decrypt_secret(
    master: &[u8; WALLET_CRYPTO_KEY_SIZE],
    public_key: &[u8; 32],
    crypted: &[u8],
) -> Result<Zeroizing<[u8; 32]>, WalletError> {
    let plain = cipher(master)?
        .decrypt(Nonce::from_slice(&secret_nonce(public_key)), crypted)
        .map_err(|_| WalletError::Decryption("private key authentication failed".into()))?;
    let plain = Zeroizing::new(plain);
    if plain.len() != 32 {
        return Err(WalletError::Decryption(format!(
            "private key has {} bytes",
            plain.len()
        )));
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&plain);
    Ok(out)
}
