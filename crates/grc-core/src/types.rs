//! Core protocol types: transactions, blocks, outpoints.
//!
//! All monetary values are signed base-unit [`Amount`]s (1 GRC = 10^8 units).
//! Transactions carry their own timestamp, which proof-of-stake uses for coin age.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::LOCKTIME_THRESHOLD;
use crate::error::TransactionError;
use crate::money::{Amount, checked_add};
use crate::script::Script;

/// Input sequence value that opts out of lock-time enforcement.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3), block header hashes (double SHA-256),
/// key ids and script hashes (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Ed25519 signature (64 bytes). Empty until signed.
    pub signature: Vec<u8>,
    /// Ed25519 public key (32 bytes). Empty until signed.
    pub public_key: Vec<u8>,
    /// Redeem script revealed when spending a pay-to-script-hash output.
    pub redeem_script: Option<Script>,
    pub sequence: u32,
}

impl TxInput {
    /// An unsigned input spending `previous_output`.
    pub fn unsigned(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            signature: Vec::new(),
            public_key: Vec::new(),
            redeem_script: None,
            sequence: SEQUENCE_FINAL,
        }
    }
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    pub value: Amount,
    pub script_pubkey: Script,
}

impl TxOutput {
    pub fn new(value: Amount, script_pubkey: Script) -> Self {
        Self { value, script_pubkey }
    }

    /// The zero-value, empty-script marker output that opens a coinstake.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Script::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

/// A transaction transferring value between scripts.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u32,
    /// Unix time the transaction was created. Used for stake age.
    pub time: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is not final.
    pub lock_time: u64,
    /// Opaque application payload (messages, contracts). Empty for plain transfers.
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Compute the transaction ID (BLAKE3 hash of the canonical encoding).
    pub fn txid(&self) -> Result<Hash256, TransactionError> {
        let encoded = self.encode()?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Canonical bincode encoding.
    pub fn encode(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    pub fn serialized_size(&self) -> Result<usize, TransactionError> {
        Ok(self.encode()?.len())
    }

    /// Single input with a null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Non-null first input, at least two outputs, and an empty first output.
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].previous_output.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    /// Sum of all output values, range-checked against the money supply.
    pub fn total_output_value(&self) -> Result<Amount, TransactionError> {
        self.outputs
            .iter()
            .try_fold(0, |acc, out| checked_add(acc, out.value))
            .ok_or(TransactionError::ValueOutOfRange)
    }

    /// Whether the transaction may be included at `height` / `block_time`.
    ///
    /// A zero lock time is always final. Otherwise the lock time is compared
    /// against the height or the time depending on [`LOCKTIME_THRESHOLD`], and
    /// a not-yet-reached lock time is still final if every input opted out.
    pub fn is_final(&self, height: u64, block_time: u64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let bound = if self.lock_time < LOCKTIME_THRESHOLD {
            height
        } else {
            block_time
        };
        if self.lock_time < bound {
            return true;
        }
        self.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
    }

    pub fn output(&self, index: u32) -> Result<&TxOutput, TransactionError> {
        self.outputs
            .get(index as usize)
            .ok_or(TransactionError::OutputIndexOutOfBounds {
                index,
                len: self.outputs.len(),
            })
    }
}

/// Block header.
///
/// Hash is computed as double SHA-256 over a fixed byte layout.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub time: u64,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// version(4) + prev(32) + merkle(32) + time(8) + bits(4) + nonce(4).
    const HASH_SIZE: usize = 4 + 32 + 32 + 8 + 4 + 4;

    /// Compute the block header hash (double SHA-256, little-endian fields).
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.time.to_le_bytes());
        data.extend_from_slice(&self.bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// First transaction is the coinbase; in proof-of-stake blocks the second is the coinstake.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.get(1).is_some_and(Transaction::is_coinstake)
    }

    /// Transaction ids in block order.
    pub fn txids(&self) -> Result<Vec<Hash256>, TransactionError> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{COIN, MAX_MONEY};

    fn sample_script() -> Script {
        Script::PayToKeyHash(Hash256([0xAA; 32]))
    }

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            time: 1_700_000_000,
            inputs: vec![TxInput::unsigned(OutPoint::new(Hash256([0x11; 32]), 0))],
            outputs: vec![TxOutput::new(50 * COIN, sample_script())],
            lock_time: 0,
            payload: Vec::new(),
        }
    }

    fn sample_coinbase() -> Transaction {
        Transaction {
            inputs: vec![TxInput::unsigned(OutPoint::null())],
            ..sample_tx()
        }
    }

    fn sample_coinstake() -> Transaction {
        Transaction {
            outputs: vec![TxOutput::empty(), TxOutput::new(51 * COIN, sample_script())],
            ..sample_tx()
        }
    }

    #[test]
    fn hash256_display_hex() {
        let h = Hash256([0xAB; 32]);
        let s = format!("{h}");
        assert_eq!(s.len(), 64);
        assert_eq!(&s[0..2], "ab");
        assert_eq!(Hash256::from_hex(&s), Some(h));
    }

    #[test]
    fn hash256_from_hex_rejects_wrong_length() {
        assert_eq!(Hash256::from_hex("abcd"), None);
        assert_eq!(Hash256::from_hex("zz"), None);
    }

    #[test]
    fn outpoint_null_detection() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new(Hash256([1; 32]), 0).is_null());
    }

    #[test]
    fn outpoint_display() {
        let op = OutPoint::new(Hash256([0xFF; 32]), 3);
        assert!(format!("{op}").ends_with(":3"));
    }

    #[test]
    fn coinbase_detection() {
        assert!(sample_coinbase().is_coinbase());
        assert!(!sample_tx().is_coinbase());
        assert!(!sample_coinstake().is_coinbase());
    }

    #[test]
    fn coinstake_detection() {
        assert!(sample_coinstake().is_coinstake());
        assert!(!sample_tx().is_coinstake());
        let mut cb = sample_coinbase();
        cb.outputs = sample_coinstake().outputs;
        assert!(!cb.is_coinstake(), "null first input is never a coinstake");
    }

    #[test]
    fn txid_changes_with_time() {
        let a = sample_tx();
        let mut b = sample_tx();
        b.time += 1;
        assert_ne!(a.txid().unwrap(), b.txid().unwrap());
        assert_eq!(a.txid().unwrap(), sample_tx().txid().unwrap());
    }

    #[test]
    fn total_output_value_checks_range() {
        let mut tx = sample_tx();
        tx.outputs.push(TxOutput::new(25 * COIN, sample_script()));
        assert_eq!(tx.total_output_value(), Ok(75 * COIN));
        tx.outputs.push(TxOutput::new(MAX_MONEY, sample_script()));
        assert_eq!(tx.total_output_value(), Err(TransactionError::ValueOutOfRange));
    }

    #[test]
    fn negative_output_is_out_of_range() {
        let mut tx = sample_tx();
        tx.outputs[0].value = -1;
        assert!(tx.total_output_value().is_err());
    }

    #[test]
    fn finality_by_height_and_time() {
        let mut tx = sample_tx();
        assert!(tx.is_final(0, 0));

        tx.lock_time = 100;
        tx.inputs[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));

        tx.lock_time = LOCKTIME_THRESHOLD + 10;
        assert!(!tx.is_final(1_000_000, LOCKTIME_THRESHOLD));
        assert!(tx.is_final(0, LOCKTIME_THRESHOLD + 11));
    }

    #[test]
    fn final_sequences_override_lock_time() {
        let mut tx = sample_tx();
        tx.lock_time = 1_000;
        assert!(tx.is_final(5, 0));
    }

    #[test]
    fn output_index_bounds() {
        let tx = sample_tx();
        assert!(tx.output(0).is_ok());
        assert_eq!(
            tx.output(4),
            Err(TransactionError::OutputIndexOutOfBounds { index: 4, len: 1 })
        );
    }

    #[test]
    fn block_hash_is_deterministic_and_sensitive() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 1_700_000_000,
            bits: 0x1d00_ffff,
            nonce: 0,
        };
        let mut other = header.clone();
        other.nonce = 1;
        assert_eq!(header.hash(), header.clone().hash());
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn proof_of_stake_block_detection() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 0,
            bits: 0,
            nonce: 0,
        };
        let pow = Block { header: header.clone(), transactions: vec![sample_coinbase()] };
        let pos = Block {
            header,
            transactions: vec![sample_coinbase(), sample_coinstake()],
        };
        assert!(!pow.is_proof_of_stake());
        assert!(pos.is_proof_of_stake());
        assert_eq!(pos.txids().unwrap().len(), 2);
    }

    #[test]
    fn transaction_serde_json_preserves_payload() {
        let mut tx = sample_tx();
        tx.payload = b"hello".to_vec();
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, b"hello");
    }
}
