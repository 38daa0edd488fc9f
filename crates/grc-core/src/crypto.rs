//! Ed25519 key handling and transaction input signing.
//!
//! A key is identified by its key id, the BLAKE3 hash of the raw 32-byte
//! public key. Pay-to-key-hash scripts commit to that id.
//!
//! # Signing scheme
//!
//! Each input is signed over a **sighash** that commits to:
//! - Transaction version, time and lock_time
//! - All input outpoints and sequences
//! - All outputs (value + script bytes)
//! - A BLAKE3 digest of the payload
//! - The index of the input being signed and the script it is spending
//!
//! Signatures, public keys and redeem scripts are excluded so that inputs
//! can be signed independently and in any order.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::CryptoError;
use crate::script::Script;
use crate::types::{Hash256, Transaction};

/// Ed25519 keypair.
///
/// Wraps [`ed25519_dalek::SigningKey`], which zeroizes its secret on drop.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    pub fn key_id(&self) -> Hash256 {
        self.public_key().key_id()
    }

    /// Raw secret key bytes. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.secret_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key.
#[derive(Clone)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key: vk })
    }

    /// Parse from a slice that must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&arr)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn key_id(&self) -> Hash256 {
        key_id(&self.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// BLAKE3 key id of raw public key bytes.
pub fn key_id(pubkey_bytes: &[u8; 32]) -> Hash256 {
    Hash256(blake3::hash(pubkey_bytes).into())
}

/// Compute the sighash for input `input_index` spending an output locked by `script_code`.
pub fn signing_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
) -> Result<Hash256, CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let mut data = Vec::new();
    data.extend_from_slice(&tx.version.to_le_bytes());
    data.extend_from_slice(&tx.time.to_le_bytes());

    data.extend_from_slice(&(tx.inputs.len() as u64).to_le_bytes());
    for input in &tx.inputs {
        data.extend_from_slice(input.previous_output.txid.as_bytes());
        data.extend_from_slice(&input.previous_output.index.to_le_bytes());
        data.extend_from_slice(&input.sequence.to_le_bytes());
    }

    data.extend_from_slice(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        data.extend_from_slice(&output.value.to_le_bytes());
        let script = output.script_pubkey.to_bytes();
        data.extend_from_slice(&(script.len() as u64).to_le_bytes());
        data.extend_from_slice(&script);
    }

    data.extend_from_slice(&tx.lock_time.to_le_bytes());
    data.extend_from_slice(blake3::hash(&tx.payload).as_bytes());

    data.extend_from_slice(&(input_index as u64).to_le_bytes());
    data.extend_from_slice(&script_code.to_bytes());

    Ok(Hash256(blake3::hash(&data).into()))
}

/// Resolve the pay-to-key-hash script that actually guards an output.
///
/// For pay-to-script-hash the redeem script must hash to the committed id
/// and must itself be a pay-to-key-hash script.
pub fn signing_script<'a>(
    script_pubkey: &'a Script,
    redeem_script: Option<&'a Script>,
) -> Result<&'a Script, CryptoError> {
    match script_pubkey {
        Script::PayToKeyHash(_) => Ok(script_pubkey),
        Script::PayToScriptHash(hash) => {
            let redeem = redeem_script.ok_or(CryptoError::RedeemScriptMismatch)?;
            if redeem.script_hash() != *hash {
                return Err(CryptoError::RedeemScriptMismatch);
            }
            match redeem {
                Script::PayToKeyHash(_) => Ok(redeem),
                _ => Err(CryptoError::UnsupportedScript),
            }
        }
        _ => Err(CryptoError::UnsupportedScript),
    }
}

/// Sign input `input_index` in place.
///
/// `script_pubkey` is the script of the output being spent. For
/// pay-to-script-hash outputs `redeem_script` is written into the input.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    keypair: &KeyPair,
    script_pubkey: &Script,
    redeem_script: Option<&Script>,
) -> Result<(), CryptoError> {
    let inner = signing_script(script_pubkey, redeem_script)?;
    if matches!(inner, Script::PayToKeyHash(expected) if keypair.key_id() != *expected) {
        return Err(CryptoError::KeyIdMismatch);
    }
    let sighash = signing_hash(tx, input_index, script_pubkey)?;
    let signature = keypair.sign(sighash.as_bytes());

    let input = &mut tx.inputs[input_index];
    input.signature = signature.to_vec();
    input.public_key = keypair.public_key().to_bytes().to_vec();
    input.redeem_script = match script_pubkey {
        Script::PayToScriptHash(_) => Some(inner.clone()),
        _ => None,
    };
    Ok(())
}

/// Verify input `input_index` against the script of the output it spends.
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &Script,
) -> Result<(), CryptoError> {
    let input = tx.inputs.get(input_index).ok_or(CryptoError::InputIndexOutOfBounds {
        index: input_index,
        len: tx.inputs.len(),
    })?;

    let inner = signing_script(script_pubkey, input.redeem_script.as_ref())?;
    let pk = PublicKey::from_slice(&input.public_key)?;
    if matches!(inner, Script::PayToKeyHash(expected) if pk.key_id() != *expected) {
        return Err(CryptoError::KeyIdMismatch);
    }

    let sig_bytes: [u8; 64] = input
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;

    let sighash = signing_hash(tx, input_index, script_pubkey)?;
    pk.verify(sighash.as_bytes(), &sig_bytes)
}
