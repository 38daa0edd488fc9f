//! Wallet engine: the single handle every wallet operation goes through.
//!
//! The engine owns the key vault, the transaction ledger and the address
//! book behind one mutex, and shares the chain view behind a read-write
//! lock. Operations that consult the chain take the chain lock first and
//! the wallet lock second, so the two are always acquired in that order.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info, warn};

use grc_core::address::Address;
use grc_core::crypto::PublicKey;
use grc_core::money::Amount;
use grc_core::script::{Destination, Script};
use grc_core::traits::{Broadcaster, ChainView};
use grc_core::types::{Block, Hash256, Transaction};

use crate::auditor::{ConsistencyAuditor, ReconcileReport};
use crate::balance::{BalanceAccountant, Balances};
use crate::builder::{BuiltTransaction, Payload, Recipient, TransactionBuilder};
use crate::coin_selection::{CandidateOutput, CoinControl, CoinSelector, StakingCoins};
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::ledger::{ChainSnapshot, LoadReport, TransactionLedger, relay_wallet_tx};
use crate::mnemonic::{mnemonic_to_seed, seed_to_mnemonic};
use crate::store::{RecordKey, RecordKind, WalletRecord, WalletStore};
use crate::vault::{DumpedKey, KeyVault, VaultState};
use crate::wallet_tx::WalletTx;

/// Upper bound of the random delay between automatic resends.
const RESEND_JITTER_SECS: u64 = 30 * 60;

/// Outcome of a resend pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResendReport {
    pub relayed: Vec<Hash256>,
    /// Transactions that failed revalidation and were erased.
    pub erased: Vec<Hash256>,
}

struct WalletInner {
    vault: KeyVault,
    ledger: TransactionLedger,
    address_book: BTreeMap<Destination, String>,
    /// Earliest time the next automatic resend may run. Zero before the first.
    next_resend: u64,
}

/// Wallet transaction engine.
pub struct WalletEngine<C, B> {
    chain: Arc<RwLock<C>>,
    broadcaster: Arc<B>,
    store: Arc<dyn WalletStore>,
    config: WalletConfig,
    selector: CoinSelector,
    load_report: LoadReport,
    inner: Mutex<WalletInner>,
}

impl<C: ChainView, B: Broadcaster> WalletEngine<C, B> {
    /// Load the wallet from `store`, creating keys if it is empty.
    ///
    /// Undecodable key records are fatal. Undecodable ledger records are
    /// skipped and listed in [`Self::load_report`].
    pub fn open(
        chain: Arc<RwLock<C>>,
        broadcaster: Arc<B>,
        store: Arc<dyn WalletStore>,
        config: WalletConfig,
    ) -> Result<Self, WalletError> {
        let records = store.load_all()?;
        let mut vault = KeyVault::new(config.vault_options());
        let mut address_book = BTreeMap::new();

        for raw in &records {
            if matches!(raw.kind, RecordKind::Tx | RecordKind::OrderPosNext) {
                continue;
            }
            let record = match WalletRecord::decode(&raw.value) {
                Ok(record) => record,
                Err(e) if raw.kind == RecordKind::Name => {
                    warn!(error = %e, "skipping unreadable address book entry");
                    continue;
                }
                Err(e) => {
                    return Err(WalletError::Storage(format!("corrupt {} record: {e}", raw.kind.name())));
                }
            };
            match record {
                WalletRecord::Name { destination, label } => {
                    address_book.insert(destination, label);
                }
                other => vault.load_record(other)?,
            }
        }

        let mut ledger = TransactionLedger::new();
        let load_report = ledger.load(&records, store.as_ref())?;
        for corrupt in &load_report.corrupt {
            warn!(txid = ?corrupt.txid, reason = %corrupt.reason, "skipped corrupt ledger record");
        }

        let now = chain.read().adjusted_time();
        if vault.key_count() == 0 && !vault.is_encrypted() {
            if config.use_hd {
                vault.new_hd_seed(store.as_ref(), now)?;
            }
            vault.top_up_key_pool(store.as_ref(), 0, now)?;
            info!(hd = config.use_hd, pool = vault.key_pool_size(), "created new wallet");
        } else if !vault.is_locked() {
            vault.top_up_key_pool(store.as_ref(), 0, now)?;
        }
        info!(
            keys = vault.key_count(),
            transactions = ledger.len(),
            reordered = load_report.reordered,
            corrupt = load_report.corrupt.len(),
            "wallet loaded"
        );

        let selector = config.coin_selector();
        Ok(Self {
            chain,
            broadcaster,
            store,
            config,
            selector,
            load_report,
            inner: Mutex::new(WalletInner {
                vault,
                ledger,
                address_book,
                next_resend: 0,
            }),
        })
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<RwLock<C>> {
        &self.chain
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    fn store(&self) -> &dyn WalletStore {
        self.store.as_ref()
    }

    /// Fully recompact the backing store.
    pub fn rewrite(&self) -> Result<(), WalletError> {
        self.store.rewrite()
    }

    // --- keys -----------------------------------------------------------

    pub fn vault_state(&self) -> VaultState {
        self.inner.lock().vault.state()
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().vault.key_count()
    }

    pub fn key_pool_size(&self) -> usize {
        self.inner.lock().vault.key_pool_size()
    }

    pub fn top_up_key_pool(&self, size: usize) -> Result<(), WalletError> {
        let now = self.chain.read().adjusted_time();
        self.inner.lock().vault.top_up_key_pool(self.store(), size, now)
    }

    /// Discard the pool and generate a fresh one.
    pub fn new_key_pool(&self) -> Result<(), WalletError> {
        let now = self.chain.read().adjusted_time();
        self.inner.lock().vault.new_key_pool(self.store(), now)
    }

    /// A fresh receiving key from the pool.
    pub fn new_key(&self) -> Result<PublicKey, WalletError> {
        let now = self.chain.read().adjusted_time();
        self.inner.lock().vault.key_from_pool(self.store(), now)
    }

    /// A fresh receiving address, optionally labelled.
    pub fn new_address(&self, label: Option<&str>) -> Result<Address, WalletError> {
        let key = self.new_key()?;
        let destination = Destination::KeyHash(key.key_id());
        if let Some(label) = label {
            self.set_label(destination, label)?;
        }
        Ok(Address::new(destination, self.config.network))
    }

    /// Encrypt the vault. It ends locked.
    pub fn encrypt(&self, passphrase: &[u8]) -> Result<(), WalletError> {
        let now = self.chain.read().adjusted_time();
        self.inner.lock().vault.encrypt(self.store(), passphrase, now)
    }

    /// Unlock and top up the key pool. False on a wrong passphrase.
    pub fn unlock(&self, passphrase: &[u8]) -> Result<bool, WalletError> {
        let now = self.chain.read().adjusted_time();
        let mut inner = self.inner.lock();
        if !inner.vault.unlock(passphrase)? {
            return Ok(false);
        }
        inner.vault.top_up_key_pool(self.store(), 0, now)?;
        Ok(true)
    }

    pub fn lock(&self) {
        self.inner.lock().vault.lock();
    }

    pub fn change_passphrase(&self, old: &[u8], new: &[u8]) -> Result<bool, WalletError> {
        self.inner.lock().vault.change_passphrase(self.store(), old, new)
    }

    /// Import a private key and rescan the chain for its history.
    pub fn import_key(&self, secret: [u8; 32], birth_time: u64) -> Result<Hash256, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        let id = vault.import_key(self.store(), secret, birth_time)?;
        let found = ledger.scan_chain(0, true, vault, &snapshot, self.store())?;
        info!(key_id = %id, found, "rescanned for imported key");
        Ok(id)
    }

    pub fn dump_keys(&self) -> Result<Vec<DumpedKey>, WalletError> {
        self.inner.lock().vault.dump_keys()
    }

    pub fn key_birth_times(&self) -> BTreeMap<Hash256, u64> {
        self.inner.lock().vault.key_birth_times()
    }

    pub fn add_redeem_script(&self, script: Script) -> Result<Hash256, WalletError> {
        self.inner.lock().vault.add_redeem_script(self.store(), script)
    }

    pub fn add_watch_only(&self, script: Script) -> Result<(), WalletError> {
        self.inner.lock().vault.add_watch_only(self.store(), script)
    }

    /// The HD seed as a 24-word backup phrase.
    pub fn mnemonic(&self) -> Result<String, WalletError> {
        let seed = self.inner.lock().vault.hd_seed()?;
        seed_to_mnemonic(&seed)
    }

    /// Replace the HD seed with one recovered from `phrase`.
    pub fn restore_mnemonic(&self, phrase: &str) -> Result<Hash256, WalletError> {
        let seed = mnemonic_to_seed(phrase)?;
        let now = self.chain.read().adjusted_time();
        let mut inner = self.inner.lock();
        let id = inner.vault.set_hd_seed(self.store(), &seed, now)?;
        inner.vault.new_key_pool(self.store(), now)?;
        Ok(id)
    }

    // --- address book ---------------------------------------------------

    pub fn set_label(&self, destination: Destination, label: &str) -> Result<(), WalletError> {
        let mut inner = self.inner.lock();
        self.store.write(&WalletRecord::Name {
            destination,
            label: label.to_string(),
        })?;
        inner.address_book.insert(destination, label.to_string());
        Ok(())
    }

    pub fn remove_label(&self, destination: &Destination) -> Result<bool, WalletError> {
        let mut inner = self.inner.lock();
        if !inner.address_book.contains_key(destination) {
            return Ok(false);
        }
        self.store.erase(&RecordKey::Name(*destination))?;
        inner.address_book.remove(destination);
        Ok(true)
    }

    pub fn label(&self, destination: &Destination) -> Option<String> {
        self.inner.lock().address_book.get(destination).cloned()
    }

    pub fn address_book(&self) -> BTreeMap<Destination, String> {
        self.inner.lock().address_book.clone()
    }

    // --- ledger ---------------------------------------------------------

    /// Offer a transaction seen on the network or in a block.
    pub fn sync_transaction(&self, tx: Transaction, block: Option<&Block>, update: bool) -> Result<bool, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        ledger.add_if_involving_me(tx, block, update, vault, &snapshot, self.store())
    }

    /// Offer every transaction of a newly connected block.
    pub fn block_connected(&self, block: &Block) -> Result<usize, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        let mut taken = 0;
        for tx in &block.transactions {
            if ledger.add_if_involving_me(tx.clone(), Some(block), true, vault, &snapshot, self.store())? {
                taken += 1;
            }
        }
        debug!(block = %block.hash(), taken, "block connected");
        Ok(taken)
    }

    /// Release the inputs of our coinstakes in a disconnected block.
    pub fn block_disconnected(&self, block: &Block) -> Result<(), WalletError> {
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        for tx in &block.transactions {
            ledger.disable_transaction(tx, vault, self.store())?;
        }
        Ok(())
    }

    /// Replay main-chain blocks from `from_height`.
    pub fn scan_chain(&self, from_height: u64, update: bool) -> Result<usize, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        ledger.scan_chain(from_height, update, vault, &snapshot, self.store())
    }

    pub fn erase_transaction(&self, txid: &Hash256) -> Result<bool, WalletError> {
        self.inner.lock().ledger.erase(txid, self.store())
    }

    pub fn transaction(&self, txid: &Hash256) -> Option<WalletTx> {
        self.inner.lock().ledger.get(txid).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.lock().ledger.len()
    }

    /// Every ledger record, oldest first.
    pub fn history(&self) -> Vec<WalletTx> {
        self.inner.lock().ledger.ordered_items().cloned().collect()
    }

    // --- balances -------------------------------------------------------

    pub fn balances(&self) -> Result<Balances, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let inner = self.inner.lock();
        BalanceAccountant::new(&inner.ledger, &inner.vault, &snapshot).balances()
    }

    pub fn address_balances(&self) -> Result<BTreeMap<Destination, Amount>, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let inner = self.inner.lock();
        BalanceAccountant::new(&inner.ledger, &inner.vault, &snapshot).address_balances()
    }

    /// Sets of addresses known to share an owner.
    pub fn address_groupings(&self) -> Result<Vec<Vec<Destination>>, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let inner = self.inner.lock();
        let groups =
            BalanceAccountant::new(&inner.ledger, &inner.vault, &snapshot).address_groupings(&inner.address_book);
        Ok(groups.into_iter().map(|g| g.into_iter().collect()).collect())
    }

    // --- spending -------------------------------------------------------

    pub fn available_coins(&self, coin_control: Option<&CoinControl>) -> Result<Vec<CandidateOutput>, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let inner = self.inner.lock();
        self.selector.available_coins(&inner.ledger, &inner.vault, &snapshot, coin_control)
    }

    /// A builder carrying the configured fee settings.
    pub fn transaction_builder(&self) -> TransactionBuilder {
        self.config.transaction_builder()
    }

    /// Build and sign without recording anything.
    pub fn create_transaction<R: Rng + ?Sized>(
        &self,
        builder: &TransactionBuilder,
        rng: &mut R,
    ) -> Result<BuiltTransaction, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        builder.build(&self.selector, ledger, vault, &snapshot, self.store(), rng)
    }

    /// Record and broadcast a transaction from [`Self::create_transaction`].
    pub fn commit_transaction(&self, built: BuiltTransaction) -> Result<Hash256, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        TransactionBuilder::commit(built, ledger, vault, &snapshot, self.store(), self.broadcaster.as_ref())
    }

    pub fn discard_transaction(&self, built: BuiltTransaction) {
        TransactionBuilder::discard(built, &mut self.inner.lock().vault);
    }

    /// Build, sign, record and broadcast in one step.
    pub fn send<R: Rng + ?Sized>(
        &self,
        recipients: &[Recipient],
        payload: Payload,
        rng: &mut R,
    ) -> Result<Hash256, WalletError> {
        let mut builder = self.transaction_builder();
        for r in recipients {
            builder.add_recipient(r.script_pubkey.clone(), r.amount);
        }
        builder.set_payload(payload);

        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        let built = builder.build(&self.selector, ledger, vault, &snapshot, self.store(), rng)?;
        TransactionBuilder::commit(built, ledger, vault, &snapshot, self.store(), self.broadcaster.as_ref())
    }

    /// Outputs the staker may offer to the kernel search.
    pub fn staking_coins<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<StakingCoins, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let inner = self.inner.lock();
        let spend_time = snapshot.adjusted_time();
        self.selector
            .select_coins_for_staking(&inner.ledger, &inner.vault, &snapshot, spend_time, rng)
    }

    // --- maintenance ----------------------------------------------------

    /// Compare spent flags with the chain index, repairing unless `check_only`.
    pub fn reconcile(&self, check_only: bool) -> Result<ReconcileReport, WalletError> {
        let chain = self.chain.read();
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        ConsistencyAuditor::new(&*chain).reconcile(ledger, vault, self.store(), check_only)
    }

    /// Error with the mismatch totals if the ledger disagrees with the chain.
    pub fn verify_consistency(&self) -> Result<(), WalletError> {
        let chain = self.chain.read();
        let mut guard = self.inner.lock();
        let WalletInner { vault, ledger, .. } = &mut *guard;
        ConsistencyAuditor::new(&*chain).verify(ledger, vault, self.store())
    }

    /// Relay unconfirmed wallet transactions again.
    ///
    /// Without `force` this runs at most once per random interval of up to
    /// thirty minutes and skips the very first call. Only transactions
    /// older than `resend_after_secs` are considered unless forced. Those
    /// whose inputs can no longer be found, or whose contracts no longer
    /// validate, are erased instead.
    pub fn resend_wallet_transactions<R: Rng + ?Sized>(
        &self,
        force: bool,
        rng: &mut R,
    ) -> Result<ResendReport, WalletError> {
        let chain = self.chain.read();
        let snapshot = ChainSnapshot::new(&*chain)?;
        let now = snapshot.adjusted_time();
        let mut guard = self.inner.lock();
        let mut report = ResendReport::default();

        if !force {
            let first = guard.next_resend == 0;
            if now < guard.next_resend {
                return Ok(report);
            }
            guard.next_resend = now + rng.gen_range(0..RESEND_JITTER_SECS);
            if first {
                return Ok(report);
            }
        }

        let inner = &mut *guard;
        let mut due: Vec<(u64, Hash256)> = Vec::new();
        for wtx in inner.ledger.records() {
            if wtx.is_coinbase_like() || snapshot.depth(wtx)? > 0 {
                continue;
            }
            if force || now.saturating_sub(wtx.time_received) > self.config.resend_after_secs {
                due.push((wtx.time_received, wtx.txid));
            }
        }
        due.sort();

        for (_, txid) in due {
            let Some(wtx) = inner.ledger.get(&txid) else {
                continue;
            };
            if self.revalidate(wtx, &inner.ledger, &*chain)? {
                relay_wallet_tx(wtx, &*chain, self.broadcaster.as_ref())?;
                report.relayed.push(txid);
            } else {
                warn!(%txid, "wallet transaction no longer valid, erasing");
                if inner.ledger.erase(&txid, self.store())? {
                    report.erased.push(txid);
                }
            }
        }
        if !report.relayed.is_empty() || !report.erased.is_empty() {
            info!(relayed = report.relayed.len(), erased = report.erased.len(), "resent wallet transactions");
        }
        Ok(report)
    }

    /// Inputs resolvable (chain storage or ledger) and contracts valid.
    fn revalidate(&self, wtx: &WalletTx, ledger: &TransactionLedger, chain: &C) -> Result<bool, WalletError> {
        for input in &wtx.tx.inputs {
            let op = &input.previous_output;
            let known = match ledger.get(&op.txid) {
                Some(parent) => parent.tx.outputs.len() > op.index as usize,
                None => chain
                    .read_transaction(&op.txid)?
                    .is_some_and(|parent| parent.outputs.len() > op.index as usize),
            };
            if !known {
                debug!(txid = %wtx.txid, input = %op, "input not found");
                return Ok(false);
            }
        }
        Ok(chain.validate_contracts(&wtx.tx)?)
    }
}
