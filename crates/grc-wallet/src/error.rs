//! Wallet error types.

use grc_core::error::{AddressError, CoreError, CryptoError, TransactionError};
use grc_core::money::Amount;
use grc_core::types::Hash256;
use thiserror::Error;

/// Errors surfaced by wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// A private key is needed but the vault is locked.
    #[error("wallet is locked")]
    VaultLocked,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Coin selection cannot reach the target at all.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: Amount, need: Amount },

    /// Caller-supplied inputs cannot cover outputs plus the required fee.
    #[error("fixed inputs insufficient: have {have}, need {need}")]
    InsufficientFixedInputs { have: Amount, need: Amount },

    #[error("transaction too large: {size} >= {max}")]
    OversizeTransaction { size: usize, max: usize },

    #[error("signing failed: {0}")]
    Signature(String),

    /// Ledger spent state disagrees with the canonical transaction index.
    #[error("ledger inconsistent with chain: {mismatches} mismatched outputs worth {value}")]
    ReorgInconsistency { mismatches: usize, value: Amount },

    #[error("wallet is already encrypted")]
    AlreadyEncrypted,

    #[error("wallet is not encrypted")]
    NotEncrypted,

    #[error("invalid password")]
    InvalidPassword,

    #[error("key pool exhausted")]
    KeypoolExhausted,

    #[error("fee did not converge after {iterations} iterations")]
    FeeNotConverged { iterations: usize },

    /// Transaction was recorded in the ledger but refused by the mempool.
    #[error("mempool rejected transaction {0}")]
    MempoolRejected(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("build error: {0}")]
    BuildError(String),

    #[error("encryption: {0}")]
    Encryption(String),

    #[error("decryption: {0}")]
    Decryption(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("serialization: {0}")]
    Serialization(String),

    /// A loaded setting is out of its allowed range.
    #[error("config: {0}")]
    Config(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("chain: {0}")]
    Chain(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Address(#[from] AddressError),
}

impl From<CoreError> for WalletError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Transaction(e) => WalletError::Transaction(e),
            CoreError::Crypto(e) => WalletError::Crypto(e),
            CoreError::Address(e) => WalletError::Address(e),
            CoreError::Chain(e) => WalletError::Chain(e.to_string()),
            CoreError::Storage(e) => WalletError::Storage(e),
        }
    }
}

/// A ledger record that could not be loaded. Logged and skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCorruption {
    pub txid: Option<Hash256>,
    pub reason: String,
}
