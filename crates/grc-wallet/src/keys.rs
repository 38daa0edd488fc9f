//! Seed management and hierarchical key derivation.
//!
//! Ed25519 has no public derivation, so every step is hardened. An extended
//! key is a 32-byte secret plus a 32-byte chain code; a child is the 64-byte
//! BLAKE3 XOF output of `0x00 || secret || index` keyed by the parent chain
//! code. External keys live at `m/0'/0'/k'`.
//!
//! The HD seed itself is stored as an ordinary vault key; its key id is the
//! chain's master key id.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use grc_core::crypto::KeyPair;
use grc_core::types::Hash256;

/// BLAKE3 derive-key context for the master extended key.
const MASTER_CONTEXT: &str = "grc-wallet 2024 hd master key";

/// Child indices at or above this value are hardened.
pub const HARDENED: u32 = 0x8000_0000;

/// A 32-byte HD seed. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: [u8; 32],
}

impl Seed {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Raw seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// The vault key that stores this seed; its id names the HD chain.
    pub fn as_keypair(&self) -> KeyPair {
        KeyPair::from_secret_bytes(self.bytes)
    }
}

impl Clone for Seed {
    fn clone(&self) -> Self {
        Self { bytes: self.bytes }
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed").field("bytes", &"[REDACTED]").finish()
    }
}

/// Secret plus chain code.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ExtendedKey {
    secret: [u8; 32],
    chain_code: [u8; 32],
}

impl ExtendedKey {
    pub fn master(seed: &Seed) -> Self {
        let mut out = [0u8; 64];
        let mut hasher = blake3::Hasher::new_derive_key(MASTER_CONTEXT);
        hasher.update(seed.as_bytes());
        hasher.finalize_xof().fill(&mut out);
        let key = Self::split(&out);
        out.zeroize();
        key
    }

    /// Hardened child at `index` (the hardened bit is set here).
    pub fn derive_hardened(&self, index: u32) -> Self {
        let mut out = [0u8; 64];
        let mut hasher = blake3::Hasher::new_keyed(&self.chain_code);
        hasher.update(&[0u8]);
        hasher.update(&self.secret);
        hasher.update(&(index | HARDENED).to_be_bytes());
        hasher.finalize_xof().fill(&mut out);
        let key = Self::split(&out);
        out.zeroize();
        key
    }

    fn split(out: &[u8; 64]) -> Self {
        let mut secret = [0u8; 32];
        let mut chain_code = [0u8; 32];
        secret.copy_from_slice(&out[..32]);
        chain_code.copy_from_slice(&out[32..]);
        Self { secret, chain_code }
    }

    pub fn keypair(&self) -> KeyPair {
        KeyPair::from_secret_bytes(self.secret)
    }
}

/// Key at `m/0'/0'/index'` together with its path string.
pub fn derive_external_key(seed: &Seed, index: u32) -> (KeyPair, String) {
    let child = ExtendedKey::master(seed)
        .derive_hardened(0)
        .derive_hardened(0)
        .derive_hardened(index);
    (child.keypair(), format!("m/0'/0'/{index}'"))
}

/// Per-key metadata.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct KeyMetadata {
    /// Unix time the key was created. Zero if unknown.
    pub create_time: u64,
    pub hd_keypath: Option<String>,
    pub hd_master_key_id: Option<Hash256>,
}

impl KeyMetadata {
    pub fn new(create_time: u64) -> Self {
        Self {
            create_time,
            ..Self::default()
        }
    }
}

/// HD chain state.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct HdChain {
    pub master_key_id: Hash256,
    /// Next external child index to try.
    pub external_counter: u32,
}

/// A pre-generated key waiting in the key pool.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct KeyPoolEntry {
    pub time: u64,
    pub public_key: [u8; 32],
}
