//! BIP-39 backup phrases for the HD seed.

use bip39::{Language, Mnemonic};
use zeroize::Zeroize;

use crate::error::WalletError;
use crate::keys::Seed;

/// Encode a seed as a 24-word English phrase.
pub fn seed_to_mnemonic(seed: &Seed) -> Result<String, WalletError> {
    let m = Mnemonic::from_entropy_in(Language::English, seed.as_bytes())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    Ok(m.to_string())
}

/// Recover a seed from a phrase. Whitespace and case are normalized first.
pub fn mnemonic_to_seed(phrase: &str) -> Result<Seed, WalletError> {
    let mut normalized = phrase.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let parsed = Mnemonic::parse_in(Language::English, &normalized);
    normalized.zeroize();
    let m = parsed.map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;

    let mut entropy = m.to_entropy();
    if entropy.len() != 32 {
        let len = entropy.len();
        entropy.zeroize();
        return Err(WalletError::InvalidMnemonic(format!("expected 24 words, got {} bytes of entropy", len)));
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&entropy);
    entropy.zeroize();
    let seed = Seed::from_bytes(bytes);
    bytes.zeroize();
    Ok(seed)
}
