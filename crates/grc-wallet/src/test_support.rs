//! Fixtures shared by the unit tests in this crate.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use grc_core::error::CoreError;
use grc_core::merkle::merkle_root;
use grc_core::money::Amount;
use grc_core::script::Script;
use grc_core::traits::{BlockIndexEntry, Broadcaster, ChainView, TxIndexEntry};
use grc_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

use crate::crypter::KdfParams;
use crate::store::MemoryWalletStore;
use crate::vault::{KeyVault, VaultOptions};

pub const GENESIS_TIME: u64 = 1_700_000_000;
pub const BLOCK_SPACING: u64 = 60;

/// In-memory chain with a single main branch plus orphaned blocks.
pub struct MockChain {
    pub time: u64,
    heights: BTreeMap<u64, Hash256>,
    blocks: HashMap<Hash256, (BlockIndexEntry, Block)>,
    txs: HashMap<Hash256, Transaction>,
    index: HashMap<Hash256, TxIndexEntry>,
    pub invalid_contracts: HashSet<Hash256>,
}

impl MockChain {
    pub fn new() -> Self {
        let mut chain = Self {
            time: GENESIS_TIME,
            heights: BTreeMap::new(),
            blocks: HashMap::new(),
            txs: HashMap::new(),
            index: HashMap::new(),
            invalid_contracts: HashSet::new(),
        };
        chain.mine(Vec::new());
        chain
    }

    pub fn height(&self) -> u64 {
        self.heights.keys().next_back().copied().unwrap_or(0)
    }

    /// Append a block with `txs` to the main chain.
    pub fn mine(&mut self, txs: Vec<Transaction>) -> Block {
        let height = if self.heights.is_empty() { 0 } else { self.height() + 1 };
        let prev_hash = self.heights.get(&height.wrapping_sub(1)).copied().unwrap_or(Hash256::ZERO);
        let txids: Vec<Hash256> = txs.iter().map(|t| t.txid().unwrap()).collect();
        let time = GENESIS_TIME + height * BLOCK_SPACING;
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash,
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
                if let Some(entry) = self.index.get_mut(&input.previous_output.txid) {
                    if let Some(slot) = entry.spent_by.get_mut(input.previous_output.index as usize) {
                        *slot = Some(*txid);
                    }
                }
            }
            self.txs.insert(*txid, tx.clone());
            self.index.insert(*txid, TxIndexEntry {
                block_hash: Some(hash),
                spent_by: vec![None; tx.outputs.len()],
            });
        }
        self.blocks.insert(hash, (
            BlockIndexEntry {
                hash,
                height,
                time,
                in_main_chain: true,
            },
            block.clone(),
        ));
        self.heights.insert(height, hash);
        self.time = self.time.max(time + BLOCK_SPACING);
        block
    }

    /// Mine `n` empty blocks.
    pub fn advance(&mut self, n: u64) {
        for _ in 0..n {
            self.mine(Vec::new());
        }
    }

    /// Move `block` to a side branch. Its transactions leave the index.
    pub fn orphan(&mut self, hash: &Hash256) {
        if let Some((entry, block)) = self.blocks.get_mut(hash) {
            entry.in_main_chain = false;
            for tx in &block.transactions {
                if let Ok(txid) = tx.txid() {
                    self.index.remove(&txid);
                }
            }
        }
    }

    /// Record a transaction as known on disk without confirming it.
    pub fn store_tx(&mut self, tx: &Transaction) {
        self.txs.insert(tx.txid().unwrap(), tx.clone());
    }

    pub fn index_entry_mut(&mut self, txid: &Hash256) -> Option<&mut TxIndexEntry> {
        self.index.get_mut(txid)
    }
}

impl ChainView for MockChain {
    fn best_height(&self) -> Result<u64, CoreError> {
        Ok(self.height())
    }

    fn best_block_hash(&self) -> Result<Hash256, CoreError> {
        Ok(self.heights.get(&self.height()).copied().unwrap_or(Hash256::ZERO))
    }

    fn block_index(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, CoreError> {
        Ok(self.blocks.get(hash).map(|(entry, _)| entry.clone()))
    }

    fn block_at_height(&self, height: u64) -> Result<Option<Block>, CoreError> {
        Ok(self
            .heights
            .get(&height)
            .and_then(|h| self.blocks.get(h))
            .map(|(_, block)| block.clone()))
    }

    fn read_transaction(&self, txid: &Hash256) -> Result<Option<Transaction>, CoreError> {
        Ok(self.txs.get(txid).cloned())
    }

    fn transaction_index(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, CoreError> {
        Ok(self.index.get(txid).cloned())
    }

    fn validate_contracts(&self, tx: &Transaction) -> Result<bool, CoreError> {
        Ok(!self.invalid_contracts.contains(&tx.txid()?))
    }

    fn adjusted_time(&self) -> u64 {
        self.time
    }
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    pub accepted: Mutex<Vec<Hash256>>,
    pub relayed: Mutex<Vec<Hash256>>,
    pub reject: Mutex<bool>,
}

impl Broadcaster for RecordingBroadcaster {
    fn accept_to_mempool(&self, tx: &Transaction) -> bool {
        if *self.reject.lock() {
            return false;
        }
        self.accepted.lock().push(tx.txid().unwrap());
        true
    }

    fn relay(&self, tx: &Transaction) {
        self.relayed.lock().push(tx.txid().unwrap());
    }
}

pub fn fast_options(use_hd: bool, keypool_size: usize) -> VaultOptions {
    VaultOptions {
        use_hd,
        keypool_size,
        kdf: KdfParams {
            target_ms: 1,
            memory_kib: 64,
            min_iterations: 1,
        },
    }
}

/// Unencrypted, non-HD vault with one key. Returns the key's script.
pub fn vault_with_key(store: &MemoryWalletStore) -> (KeyVault, Script) {
    let mut vault = KeyVault::new(fast_options(false, 2));
    let id = vault.generate_key(store, GENESIS_TIME).unwrap().key_id();
    (vault, Script::PayToKeyHash(id))
}

pub fn foreign_script(tag: u8) -> Script {
    Script::PayToKeyHash(Hash256([tag; 32]))
}

/// A transaction from an unknown outpoint paying `values` to `script`.
pub fn receive(script: &Script, values: &[Amount], nonce: u64) -> Transaction {
    Transaction {
        version: 1,
        time: GENESIS_TIME,
        inputs: vec![TxInput::unsigned(OutPoint::new(Hash256([0xEE; 32]), nonce as u32))],
        outputs: values.iter().map(|v| TxOutput::new(*v, script.clone())).collect(),
        lock_time: 0,
        payload: Vec::new(),
    }
}

pub fn spend(inputs: &[OutPoint], outputs: Vec<TxOutput>) -> Transaction {
    Transaction {
        version: 1,
        time: GENESIS_TIME,
        inputs: inputs.iter().map(|op| TxInput::unsigned(*op)).collect(),
        outputs,
        lock_time: 0,
        payload: Vec::new(),
    }
}

pub fn coinbase(script: &Script, value: Amount, nonce: u64) -> Transaction {
    Transaction {
        version: 1,
        time: GENESIS_TIME + nonce,
        inputs: vec![TxInput::unsigned(OutPoint::null())],
        outputs: vec![TxOutput::new(value, script.clone())],
        lock_time: 0,
        payload: Vec::new(),
    }
}

pub fn coinstake(prev: OutPoint, script: &Script, value: Amount) -> Transaction {
    Transaction {
        version: 1,
        time: GENESIS_TIME,
        inputs: vec![TxInput::unsigned(prev)],
        outputs: vec![TxOutput::empty(), TxOutput::new(value, script.clone())],
        lock_time: 0,
        payload: Vec::new(),
    }
}
