//! grc-wallet-cli: offline maintenance for a grc wallet database.
//!
//! Opens the RocksDB wallet under the configured data directory without a
//! node attached. Key management, labels, backups, history and the
//! consistency check work offline; anything that needs the network does not.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use tracing::{error, info};

use grc_core::address::{Address, Network};
use grc_core::error::CoreError;
use grc_core::money::format_money;
use grc_core::traits::{BlockIndexEntry, Broadcaster, ChainView, TxIndexEntry};
use grc_core::types::{Block, Hash256, Transaction};
use grc_wallet::config::WalletConfig;
use grc_wallet::engine::WalletEngine;
use grc_wallet::vault::VaultState;
use grc_walletdb::RocksWalletStore;

/// Chain view with no blocks. Every ledger record reads as unconfirmed.
struct OfflineChain;

impl ChainView for OfflineChain {
    fn best_height(&self) -> Result<u64, CoreError> {
        Ok(0)
    }

    fn best_block_hash(&self) -> Result<Hash256, CoreError> {
        Ok(Hash256::ZERO)
    }

    fn block_index(&self, _hash: &Hash256) -> Result<Option<BlockIndexEntry>, CoreError> {
        Ok(None)
    }

    fn block_at_height(&self, _height: u64) -> Result<Option<Block>, CoreError> {
        Ok(None)
    }

    fn read_transaction(&self, _txid: &Hash256) -> Result<Option<Transaction>, CoreError> {
        Ok(None)
    }

    fn transaction_index(&self, _txid: &Hash256) -> Result<Option<TxIndexEntry>, CoreError> {
        Ok(None)
    }

    fn adjusted_time(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

/// Refuses everything: there is no mempool offline.
struct NoRelay;

impl Broadcaster for NoRelay {
    fn accept_to_mempool(&self, _tx: &Transaction) -> bool {
        false
    }

    fn relay(&self, _tx: &Transaction) {}
}

type Wallet = WalletEngine<OfflineChain, NoRelay>;

#[derive(Parser, Debug)]
#[command(name = "grc-wallet-cli", version, about = "Offline grc wallet maintenance")]
struct Cli {
    /// Config file (TOML or JSON). Environment variables GRC_WALLET_* apply on top.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the wallet database.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Show testnet addresses.
    #[arg(long, global = true)]
    testnet: bool,

    /// Log output format ("text" or "json").
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new wallet and print its backup phrase.
    Create {
        /// Encrypt the new wallet right away.
        #[arg(long)]
        encrypt: bool,
    },
    /// Create a wallet from a 24-word backup phrase.
    Restore,
    /// Show key, ledger and balance summary.
    Info {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Take a fresh receiving address from the key pool.
    NewAddress {
        #[arg(long)]
        label: Option<String>,
    },
    /// Set the label of an address.
    Label { address: String, label: String },
    /// List labelled addresses.
    Labels,
    /// Encrypt the wallet with a passphrase.
    Encrypt,
    /// Change the wallet passphrase.
    ChangePassphrase,
    /// Print every private key as hex with its creation time.
    DumpKeys,
    /// Add a hex-encoded private key.
    ImportKey {
        secret: String,
        /// Creation time of the key, Unix seconds. Unknown keys use zero.
        #[arg(long, default_value_t = 0)]
        birth: u64,
    },
    /// Print the HD seed backup phrase.
    Mnemonic,
    /// List wallet transactions, oldest first.
    History,
    /// Top up the key pool, or replace it with `--renew`.
    Keypool {
        #[arg(long)]
        renew: bool,
        #[arg(long)]
        size: Option<usize>,
    },
    /// Report corrupt records and spent-state mismatches.
    Check {
        /// Correct mismatches instead of only reporting them.
        #[arg(long)]
        repair: bool,
    },
    /// Compact the wallet database.
    Compact,
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(2);
        }
    };
    init_logging(&config.log_level, &cli.log_format);

    if let Err(e) = run(cli.command, config) {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<WalletConfig> {
    let mut config = WalletConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if cli.testnet {
        config.network = Network::Testnet;
    }
    Ok(config)
}

fn open_wallet(config: &WalletConfig) -> Result<Wallet> {
    let path = config.db_path();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create directory: {}", config.data_dir.display()))?;
    let store = RocksWalletStore::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let wallet = Wallet::open(
        Arc::new(RwLock::new(OfflineChain)),
        Arc::new(NoRelay),
        Arc::new(store),
        config.clone(),
    )
    .context("Failed to load wallet")?;
    Ok(wallet)
}

fn open_existing(config: &WalletConfig) -> Result<Wallet> {
    if !config.db_path().exists() {
        bail!("No wallet at {} (run `create` first)", config.db_path().display());
    }
    open_wallet(config)
}

fn run(command: Command, config: WalletConfig) -> Result<()> {
    match command {
        Command::Create { encrypt } => create(&config, encrypt),
        Command::Restore => restore(&config),
        Command::Info { json } => show_info(&open_existing(&config)?, json),
        Command::NewAddress { label } => {
            let wallet = open_existing(&config)?;
            unlock_if_needed(&wallet)?;
            let address = wallet.new_address(label.as_deref())?;
            println!("{address}");
            Ok(())
        }
        Command::Label { address, label } => {
            let wallet = open_existing(&config)?;
            let address = Address::decode_for(&address, config.network).context("Invalid address")?;
            wallet.set_label(address.destination(), &label)?;
            Ok(())
        }
        Command::Labels => {
            let wallet = open_existing(&config)?;
            for (destination, label) in wallet.address_book() {
                println!("{}  {}", Address::new(destination, config.network), label);
            }
            Ok(())
        }
        Command::Encrypt => encrypt(&open_existing(&config)?),
        Command::ChangePassphrase => {
            let wallet = open_existing(&config)?;
            let old = prompt_password("Current passphrase")?;
            let new = prompt_new_passphrase()?;
            if !wallet.change_passphrase(old.as_bytes(), new.as_bytes())? {
                bail!("Incorrect passphrase");
            }
            println!("Passphrase changed.");
            Ok(())
        }
        Command::DumpKeys => dump_keys(&open_existing(&config)?),
        Command::ImportKey { secret, birth } => {
            let wallet = open_existing(&config)?;
            unlock_if_needed(&wallet)?;
            let bytes = hex::decode(secret.trim()).context("Invalid hex key")?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("Key must be exactly 32 bytes (64 hex characters)"))?;
            let id = wallet.import_key(secret, birth)?;
            println!("{}", Address::new(grc_core::script::Destination::KeyHash(id), config.network));
            Ok(())
        }
        Command::Mnemonic => {
            let wallet = open_existing(&config)?;
            unlock_if_needed(&wallet)?;
            println!("{}", wallet.mnemonic()?);
            Ok(())
        }
        Command::History => history(&open_existing(&config)?),
        Command::Keypool { renew, size } => {
            let wallet = open_existing(&config)?;
            unlock_if_needed(&wallet)?;
            if renew {
                wallet.new_key_pool()?;
            } else {
                wallet.top_up_key_pool(size.unwrap_or(0))?;
            }
            println!("Key pool size: {}", wallet.key_pool_size());
            Ok(())
        }
        Command::Check { repair } => check(&open_existing(&config)?, repair),
        Command::Compact => {
            open_existing(&config)?.rewrite()?;
            println!("Compacted.");
            Ok(())
        }
    }
}

fn create(config: &WalletConfig, encrypt_now: bool) -> Result<()> {
    if config.db_path().exists() {
        bail!("Wallet already exists: {}", config.db_path().display());
    }
    let wallet = open_wallet(config)?;
    let phrase = wallet.mnemonic().context("Failed to export backup phrase")?;
    let address = wallet.new_address(None)?;

    println!("\n=== WALLET CREATED ===");
    println!("Database: {}", config.db_path().display());
    println!("First address: {address}");
    println!("\nBACKUP PHRASE (24 WORDS):");
    println!("  {phrase}");
    println!("\nWrite it down. It will not be shown again unless you ask for it.");

    if encrypt_now {
        encrypt(&wallet)?;
    }
    Ok(())
}

fn restore(config: &WalletConfig) -> Result<()> {
    if config.db_path().exists() {
        bail!("Wallet already exists: {}", config.db_path().display());
    }
    let phrase = prompt_password("Backup phrase (24 words)")?;
    let wallet = open_wallet(config)?;
    let id = wallet.restore_mnemonic(&phrase).context("Failed to restore seed")?;
    info!(seed_id = %id, "seed restored");
    println!("Wallet restored. First address: {}", wallet.new_address(None)?);
    Ok(())
}

fn encrypt(wallet: &Wallet) -> Result<()> {
    if wallet.vault_state() != VaultState::Unencrypted {
        bail!("Wallet is already encrypted");
    }
    let passphrase = prompt_new_passphrase()?;
    wallet.encrypt(passphrase.as_bytes())?;
    println!("Wallet encrypted. A new HD seed and key pool were generated; back up the new phrase.");
    Ok(())
}

fn dump_keys(wallet: &Wallet) -> Result<()> {
    unlock_if_needed(wallet)?;
    let network = wallet.config().network;
    for key in wallet.dump_keys()? {
        let created = chrono::DateTime::from_timestamp(key.metadata.create_time as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".into());
        let address = Address::new(grc_core::script::Destination::KeyHash(key.key_id), network);
        let path = key.metadata.hd_keypath.as_deref().unwrap_or("-");
        println!("{} {} {} {}", hex::encode(key.secret()), created, path, address);
    }
    Ok(())
}

fn show_info(wallet: &Wallet, json: bool) -> Result<()> {
    let balances = wallet.balances()?;
    let state = match wallet.vault_state() {
        VaultState::Unencrypted => "unencrypted",
        VaultState::Locked => "locked",
        VaultState::Unlocked => "unlocked",
    };
    if json {
        let value = serde_json::json!({
            "state": state,
            "keys": wallet.key_count(),
            "keypool": wallet.key_pool_size(),
            "transactions": wallet.transaction_count(),
            "labels": wallet.address_book().len(),
            "balance": {
                "confirmed": balances.confirmed,
                "unconfirmed": balances.unconfirmed,
                "immature": balances.immature,
                "stake": balances.stake,
            },
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("State:        {state}");
    println!("Keys:         {}", wallet.key_count());
    println!("Key pool:     {}", wallet.key_pool_size());
    println!("Transactions: {}", wallet.transaction_count());
    println!("Confirmed:    {}", format_money(balances.confirmed));
    println!("Unconfirmed:  {}", format_money(balances.unconfirmed));
    println!("Immature:     {}", format_money(balances.immature));
    println!("Stake:        {}", format_money(balances.stake));
    Ok(())
}

fn history(wallet: &Wallet) -> Result<()> {
    for wtx in wallet.history() {
        let when = chrono::DateTime::from_timestamp(wtx.time() as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let value = wtx.tx.total_output_value().map(format_money).unwrap_or_else(|_| "?".into());
        let kind = if wtx.is_coinbase_like() {
            "generated"
        } else if wtx.from_me {
            "sent"
        } else {
            "received"
        };
        println!("{when}  {:<9}  {:>20}  {}", kind, value, wtx.txid);
    }
    Ok(())
}

fn check(wallet: &Wallet, repair: bool) -> Result<()> {
    let load = wallet.load_report();
    println!("Ledger records loaded: {}", load.loaded);
    for corrupt in &load.corrupt {
        println!("Corrupt record skipped: {:?} ({})", corrupt.txid, corrupt.reason);
    }
    let report = wallet.reconcile(!repair)?;
    if report.is_consistent() {
        println!("Spent state consistent with the chain index.");
    } else {
        println!(
            "{} mismatched outputs worth {}{}",
            report.mismatch_count(),
            format_money(report.value),
            if report.repaired { " (repaired)" } else { "" }
        );
    }
    Ok(())
}

fn unlock_if_needed(wallet: &Wallet) -> Result<()> {
    if wallet.vault_state() != VaultState::Locked {
        return Ok(());
    }
    let passphrase = prompt_password("Wallet passphrase")?;
    if !wallet.unlock(passphrase.as_bytes())? {
        bail!("Incorrect passphrase");
    }
    Ok(())
}

fn prompt_new_passphrase() -> Result<String> {
    let passphrase = prompt_password("New passphrase")?;
    let confirm = prompt_password("Confirm passphrase")?;
    if passphrase != confirm {
        bail!("Passphrases do not match");
    }
    if passphrase.is_empty() {
        bail!("Passphrase must not be empty");
    }
    Ok(passphrase)
}

/// Prompt without echo.
fn prompt_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(format!("{prompt}: ")).context("Failed to read passphrase")
}
