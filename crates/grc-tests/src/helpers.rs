//! Shared fixtures: an in-memory chain, a recording broadcaster and
//! wallet constructors over both store backends.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use grc_core::error::CoreError;
use grc_core::merkle::merkle_root;
use grc_core::money::Amount;
use grc_core::script::Script;
use grc_core::traits::{BlockIndexEntry, Broadcaster, ChainView, TxIndexEntry};
use grc_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use grc_wallet::coin_selection::CandidateOutput;
use grc_wallet::config::WalletConfig;
use grc_wallet::engine::WalletEngine;
use grc_wallet::store::{MemoryWalletStore, WalletStore};
use grc_walletdb::RocksWalletStore;

pub const START_TIME: u64 = 1_650_000_000;
pub const SPACING: u64 = 64;

pub type TestWallet = WalletEngine<TestChain, TestBroadcaster>;

/// A single-branch chain. Disconnected blocks are kept as side-branch
/// entries so the wallet can still look them up.
pub struct TestChain {
    pub now: u64,
    main: Vec<Hash256>,
    blocks: HashMap<Hash256, (BlockIndexEntry, Block)>,
    stored: HashMap<Hash256, Transaction>,
    index: HashMap<Hash256, TxIndexEntry>,
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

impl TestChain {
    pub fn new() -> Self {
        let mut chain = Self {
            now: START_TIME,
            main: Vec::new(),
            blocks: HashMap::new(),
            stored: HashMap::new(),
            index: HashMap::new(),
        };
        chain.connect(Vec::new());
        chain
    }

    pub fn tip_height(&self) -> u64 {
        self.main.len().saturating_sub(1) as u64
    }

    /// Append a block carrying `txs`.
    pub fn connect(&mut self, txs: Vec<Transaction>) -> Block {
        let height = self.main.len() as u64;
        let time = START_TIME + height * SPACING;
        let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid().unwrap()).collect();
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: self.main.last().copied().unwrap_or(Hash256::ZERO),
                merkle_root: merkle_root(&txids),
                time,
                bits: 0,
                nonce: height as u32,
            },
            transactions: txs,
        };
        let hash = block.hash();

        for (tx, txid) in block.transactions.iter().zip(&txids) {
            for input in &tx.inputs {
                let prev = &input.previous_output;
                if let Some(slot) = self
                    .index
                    .get_mut(&prev.txid)
                    .and_then(|e| e.spent_by.get_mut(prev.index as usize))
                {
                    *slot = Some(*txid);
                }
            }
            self.stored.insert(*txid, tx.clone());
            self.index.insert(*txid, TxIndexEntry {
                block_hash: Some(hash),
                spent_by: vec![None; tx.outputs.len()],
            });
        }

        let entry = BlockIndexEntry {
            hash,
            height,
            time,
            in_main_chain: true,
        };
        self.blocks.insert(hash, (entry, block.clone()));
        self.main.push(hash);
        self.now = self.now.max(time + SPACING);
        block
    }

    pub fn connect_empty(&mut self, count: u64) {
        for _ in 0..count {
            self.connect(Vec::new());
        }
    }

    /// Detach the tip, undoing its index changes. Returns the block.
    pub fn disconnect_tip(&mut self) -> Option<Block> {
        if self.main.len() <= 1 {
            return None;
        }
        let hash = self.main.pop()?;
        let (entry, block) = self.blocks.get_mut(&hash)?;
        entry.in_main_chain = false;
        for tx in &block.transactions {
            let Ok(txid) = tx.txid() else {
                continue;
            };
            self.index.remove(&txid);
            for input in &tx.inputs {
                let prev = &input.previous_output;
                if let Some(slot) = self
                    .index
                    .get_mut(&prev.txid)
                    .and_then(|e| e.spent_by.get_mut(prev.index as usize))
                {
                    *slot = None;
                }
            }
        }
        Some(block.clone())
    }

    /// Overwrite the index's spender for one output.
    pub fn set_index_spender(&mut self, outpoint: &OutPoint, spender: Option<Hash256>) {
        if let Some(slot) = self
            .index
            .get_mut(&outpoint.txid)
            .and_then(|e| e.spent_by.get_mut(outpoint.index as usize))
        {
            *slot = spender;
        }
    }
}

impl ChainView for TestChain {
    fn best_height(&self) -> Result<u64, CoreError> {
        Ok(self.tip_height())
    }

    fn best_block_hash(&self) -> Result<Hash256, CoreError> {
        Ok(self.main.last().copied().unwrap_or(Hash256::ZERO))
    }

    fn block_index(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, CoreError> {
        Ok(self.blocks.get(hash).map(|(entry, _)| entry.clone()))
    }

    fn block_at_height(&self, height: u64) -> Result<Option<Block>, CoreError> {
        Ok(self
            .main
            .get(height as usize)
            .and_then(|hash| self.blocks.get(hash))
            .map(|(_, block)| block.clone()))
    }

    fn read_transaction(&self, txid: &Hash256) -> Result<Option<Transaction>, CoreError> {
        Ok(self.stored.get(txid).cloned())
    }

    fn transaction_index(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, CoreError> {
        Ok(self.index.get(txid).cloned())
    }

    fn adjusted_time(&self) -> u64 {
        self.now
    }
}

/// Accepts everything unless told to reject, and remembers what it saw.
#[derive(Default)]
pub struct TestBroadcaster {
    pub reject: Mutex<bool>,
    pub mempool: Mutex<Vec<Transaction>>,
    pub relayed: Mutex<Vec<Hash256>>,
}

impl Broadcaster for TestBroadcaster {
    fn accept_to_mempool(&self, tx: &Transaction) -> bool {
        if *self.reject.lock() {
            return false;
        }
        self.mempool.lock().push(tx.clone());
        true
    }

    fn relay(&self, tx: &Transaction) {
        if let Ok(txid) = tx.txid() {
            self.relayed.lock().push(txid);
        }
    }
}

/// Small key pool, cheap key derivation and a short stake age.
pub fn test_config(data_dir: &Path) -> WalletConfig {
    WalletConfig {
        data_dir: data_dir.to_path_buf(),
        keypool_size: 4,
        kdf_target_ms: 1,
        kdf_memory_kib: 64,
        kdf_min_iterations: 1,
        stake_min_age_secs: 20 * SPACING,
        ..WalletConfig::default()
    }
}

/// Everything a test needs to drive one wallet.
pub struct Fixture {
    pub chain: Arc<RwLock<TestChain>>,
    pub broadcaster: Arc<TestBroadcaster>,
    pub store: Arc<dyn WalletStore>,
    pub config: WalletConfig,
    pub wallet: TestWallet,
}

impl Fixture {
    pub fn with_store(store: Arc<dyn WalletStore>, config: WalletConfig) -> Self {
        let chain = Arc::new(RwLock::new(TestChain::new()));
        let broadcaster = Arc::new(TestBroadcaster::default());
        let wallet = TestWallet::open(chain.clone(), broadcaster.clone(), store.clone(), config.clone()).unwrap();
        Self {
            chain,
            broadcaster,
            store,
            config,
            wallet,
        }
    }

    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(MemoryWalletStore::new()), test_config(Path::new(".")))
    }

    pub fn on_disk(dir: &Path) -> Self {
        let config = test_config(dir);
        let store = RocksWalletStore::open(config.db_path()).unwrap();
        Self::with_store(Arc::new(store), config)
    }

    /// Load a second engine over the same chain and store.
    pub fn reopen(&self) -> TestWallet {
        TestWallet::open(
            self.chain.clone(),
            self.broadcaster.clone(),
            self.store.clone(),
            self.config.clone(),
        )
        .unwrap()
    }

    pub fn fresh_script(&self) -> Script {
        Script::PayToKeyHash(self.wallet.new_key().unwrap().key_id())
    }

    /// Confirm an external payment of `values` to fresh wallet keys.
    pub fn receive(&self, values: &[Amount], nonce: u32) -> Hash256 {
        let tx = Transaction {
            version: 1,
            time: self.chain.read().now,
            inputs: vec![TxInput::unsigned(OutPoint::new(Hash256([0xAB; 32]), nonce))],
            outputs: values.iter().map(|v| TxOutput::new(*v, self.fresh_script())).collect(),
            lock_time: 0,
            payload: Vec::new(),
        };
        self.mine(vec![tx.clone()]);
        tx.txid().unwrap()
    }

    /// Connect a block and hand it to the wallet.
    pub fn mine(&self, txs: Vec<Transaction>) -> Block {
        let block = self.chain.write().connect(txs);
        self.wallet.block_connected(&block).unwrap();
        block
    }

    /// Confirm everything the broadcaster accepted so far.
    pub fn mine_mempool(&self) -> Block {
        let txs = std::mem::take(&mut *self.broadcaster.mempool.lock());
        self.mine(txs)
    }

    pub fn bury(&self, blocks: u64) {
        self.chain.write().connect_empty(blocks);
    }
}

pub fn stranger(tag: u8) -> Script {
    Script::PayToKeyHash(Hash256([tag; 32]))
}

/// A confirmed, spendable candidate for selection tests.
pub fn candidate(n: u32, value: Amount) -> CandidateOutput {
    CandidateOutput {
        outpoint: OutPoint::new(Hash256([0x11; 32]), n),
        value,
        script_pubkey: stranger(1),
        depth: 6,
        from_me: false,
        tx_time: START_TIME,
    }
}

/// Every output the wallet could spend right now.
pub fn unspent_outputs(wallet: &TestWallet) -> BTreeMap<OutPoint, Amount> {
    wallet
        .available_coins(None)
        .unwrap()
        .into_iter()
        .map(|c| (c.outpoint, c.value))
        .collect()
}
