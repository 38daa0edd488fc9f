//! Wallet configuration.
//!
//! [`WalletConfig::default`] gives working values. [`WalletConfig::load`]
//! layers an optional config file (TOML or JSON, by extension) and
//! `GRC_WALLET_*` environment variables over them.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use grc_core::address::Network;
use grc_core::constants::{CENT, DEFAULT_KEYPOOL_SIZE, MIN_TX_FEE, STAKE_MIN_AGE};
use grc_core::money::{Amount, money_range};

use crate::builder::{DEFAULT_MAX_FEE_ITERATIONS, TransactionBuilder};
use crate::coin_selection::{CoinSelector, DEFAULT_SELECTION_ITERATIONS};
use crate::crypter::KdfParams;
use crate::error::WalletError;
use crate::vault::VaultOptions;

/// Environment variable prefix, e.g. `GRC_WALLET_KEYPOOL_SIZE=200`.
pub const ENV_PREFIX: &str = "GRC_WALLET";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Root directory for the wallet database.
    pub data_dir: PathBuf,
    /// Address encoding for displayed addresses.
    pub network: Network,
    pub keypool_size: usize,
    /// Derive keys from an HD seed.
    pub use_hd: bool,
    /// Fee per started kilobyte.
    pub transaction_fee: Amount,
    /// Outputs below this value are never spent.
    pub min_input_value: Amount,
    /// Balance kept out of staking.
    pub reserve_balance: Amount,
    pub stake_min_age_secs: u64,
    pub cent: Amount,
    pub selection_iterations: usize,
    pub max_fee_iterations: usize,
    pub kdf_target_ms: u64,
    pub kdf_memory_kib: u32,
    pub kdf_min_iterations: u32,
    /// Unconfirmed transactions older than this are relayed again.
    pub resend_after_secs: u64,
    /// Log filter string (e.g. "info", "grc_wallet=debug").
    pub log_level: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("grc-wallet");
        let kdf = KdfParams::default();

        Self {
            data_dir,
            network: Network::Mainnet,
            keypool_size: DEFAULT_KEYPOOL_SIZE,
            use_hd: true,
            transaction_fee: MIN_TX_FEE,
            min_input_value: 0,
            reserve_balance: 0,
            stake_min_age_secs: STAKE_MIN_AGE,
            cent: CENT,
            selection_iterations: DEFAULT_SELECTION_ITERATIONS,
            max_fee_iterations: DEFAULT_MAX_FEE_ITERATIONS,
            kdf_target_ms: kdf.target_ms,
            kdf_memory_kib: kdf.memory_kib,
            kdf_min_iterations: kdf.min_iterations,
            resend_after_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

impl WalletConfig {
    /// Defaults, then `path` if given and present, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, WalletError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let cfg: Self = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(::config::Config::try_deserialize)
            .map_err(|e| WalletError::Serialization(format!("config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject money settings outside `0..=MAX_MONEY` and zero where a
    /// positive value is required.
    pub fn validate(&self) -> Result<(), WalletError> {
        let money = [
            ("transaction_fee", self.transaction_fee),
            ("min_input_value", self.min_input_value),
            ("reserve_balance", self.reserve_balance),
            ("cent", self.cent),
        ];
        for (name, value) in money {
            if !money_range(value) {
                return Err(WalletError::Config(format!("{name} {value} out of range")));
            }
        }
        if self.cent == 0 {
            return Err(WalletError::Config("cent must be positive".into()));
        }
        let counts = [
            ("keypool_size", self.keypool_size),
            ("selection_iterations", self.selection_iterations),
            ("max_fee_iterations", self.max_fee_iterations),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(WalletError::Config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }

    /// Path to the RocksDB wallet database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("walletdb")
    }

    pub fn kdf(&self) -> KdfParams {
        KdfParams {
            target_ms: self.kdf_target_ms,
            memory_kib: self.kdf_memory_kib,
            min_iterations: self.kdf_min_iterations,
        }
    }

    pub fn vault_options(&self) -> VaultOptions {
        VaultOptions {
            use_hd: self.use_hd,
            keypool_size: self.keypool_size,
            kdf: self.kdf(),
        }
    }

    pub fn coin_selector(&self) -> CoinSelector {
        CoinSelector {
            cent: self.cent,
            iterations: self.selection_iterations,
            min_input_value: self.min_input_value,
            stake_min_age: self.stake_min_age_secs,
            reserve_balance: self.reserve_balance,
        }
    }

    /// An empty builder carrying the configured fee settings.
    pub fn transaction_builder(&self) -> TransactionBuilder {
        let mut builder = TransactionBuilder::new();
        builder
            .set_transaction_fee(self.transaction_fee)
            .set_max_fee_iterations(self.max_fee_iterations);
        builder
    }
}
