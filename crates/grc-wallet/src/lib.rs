//! # grc-wallet — staking wallet transaction engine.
//!
//! Holds the wallet's keys, tracks every transaction that touches them,
//! derives balances, picks coins and builds signed, fee-correct spends.
//!
//! # Modules
//!
//! - [`error`] — `WalletError` and `LedgerCorruption`
//! - [`config`] — `WalletConfig`, file and environment layering
//! - [`keys`] — Seed, HD derivation, key metadata and pool entries
//! - [`crypter`] — Argon2id master-key wrap and AES-256-GCM key encryption
//! - [`vault`] — `KeyVault`: custody, encryption state, key pool, signing
//! - [`mnemonic`] — BIP-39 seed backup
//! - [`store`] — `WalletStore` persistence trait and in-memory store
//! - [`wallet_tx`] — `WalletTx` ledger record
//! - [`ledger`] — `TransactionLedger`: merge, spent tracking, rescan
//! - [`balance`] — `BalanceAccountant`: balance views and groupings
//! - [`coin_selection`] — `CoinSelector`: spend and staking selection
//! - [`builder`] — `TransactionBuilder`: fee loop, change, signing, commit
//! - [`auditor`] — `ConsistencyAuditor`: spent-state reconciliation
//! - [`engine`] — `WalletEngine`: the handle tying it all together

pub mod auditor;
pub mod balance;
pub mod builder;
pub mod coin_selection;
pub mod config;
pub mod crypter;
pub mod engine;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod mnemonic;
pub mod store;
pub mod vault;
pub mod wallet_tx;

#[cfg(test)]
mod test_support;

pub use auditor::{ConsistencyAuditor, ReconcileReport};
pub use balance::{BalanceAccountant, Balances};
pub use builder::{BuiltTransaction, Payload, Recipient, TransactionBuilder};
pub use coin_selection::{CandidateOutput, CoinControl, CoinSelector, NotStakingReason, Selection, StakingCoins};
pub use config::WalletConfig;
pub use engine::{ResendReport, WalletEngine};
pub use error::{LedgerCorruption, WalletError};
pub use keys::Seed;
pub use ledger::{ChainSnapshot, LoadReport, TransactionLedger};
pub use store::{MemoryWalletStore, RecordKey, RecordKind, StoredRecord, WalletRecord, WalletStore};
pub use vault::{IsMine, KeyVault, VaultOptions, VaultState};
pub use wallet_tx::WalletTx;
