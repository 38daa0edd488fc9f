//! Error types shared by the core primitives.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
    #[error("value out of range")] ValueOutOfRange,
    #[error("oversized: {size} > {max}")] OversizedTransaction { size: usize, max: usize },
    #[error("output index {index} out of bounds for {len} outputs")] OutputIndexOutOfBounds { index: u32, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("key id does not match expected")] KeyIdMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
    #[error("unsupported script for signing")] UnsupportedScript,
    #[error("redeem script does not match script hash")] RedeemScriptMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58 encoding")] InvalidBase58,
    #[error("invalid length: {0}")] InvalidLength(usize),
    #[error("invalid checksum")] InvalidChecksum,
    #[error("unknown version byte: {0}")] UnknownVersion(u8),
    #[error("address is for another network")] WrongNetwork,
    #[error("script has no address form")] NoDestination,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("transaction not found: {0}")] TransactionNotFound(String),
    #[error("chain unavailable: {0}")] Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error("storage: {0}")] Storage(String),
}
