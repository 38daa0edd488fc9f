//! Collaborator interfaces the wallet engine depends on.
//!
//! - [`ChainView`]: read-only view of the best chain, block index and
//!   transaction index, implemented by the node.
//! - [`Broadcaster`]: mempool admission and relay.

use crate::error::CoreError;
use crate::types::{Block, Hash256, Transaction, TxOutput};

/// Position of a block in the block index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub height: u64,
    pub time: u64,
    /// False for blocks on a side branch.
    pub in_main_chain: bool,
}

/// Canonical transaction index entry.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TxIndexEntry {
    /// Containing block, `None` if the transaction is not in a block.
    pub block_hash: Option<Hash256>,
    /// Per output: the txid of the transaction spending it, if any.
    pub spent_by: Vec<Option<Hash256>>,
}

impl TxIndexEntry {
    pub fn is_spent(&self, index: usize) -> bool {
        self.spent_by.get(index).is_some_and(Option::is_some)
    }
}

/// Read-only view of the blockchain.
pub trait ChainView: Send + Sync {
    fn best_height(&self) -> Result<u64, CoreError>;

    fn best_block_hash(&self) -> Result<Hash256, CoreError>;

    fn block_index(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, CoreError>;

    /// Block on the main chain at `height`.
    fn block_at_height(&self, height: u64) -> Result<Option<Block>, CoreError>;

    /// Read a transaction from block storage.
    fn read_transaction(&self, txid: &Hash256) -> Result<Option<Transaction>, CoreError>;

    fn transaction_index(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, CoreError>;

    /// Whether the canonical transaction index knows `txid`.
    fn contains_transaction(&self, txid: &Hash256) -> Result<bool, CoreError> {
        Ok(self.transaction_index(txid)?.is_some())
    }

    /// Outputs consumed by `tx`, in input order. `None` if any is missing.
    fn fetch_inputs(&self, tx: &Transaction) -> Result<Option<Vec<TxOutput>>, CoreError> {
        let mut prev = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let op = &input.previous_output;
            let Some(parent) = self.read_transaction(&op.txid)? else {
                return Ok(None);
            };
            match parent.outputs.get(op.index as usize) {
                Some(out) => prev.push(out.clone()),
                None => return Ok(None),
            }
        }
        Ok(Some(prev))
    }

    /// Validate application payload contracts carried by `tx`.
    fn validate_contracts(&self, _tx: &Transaction) -> Result<bool, CoreError> {
        Ok(true)
    }

    /// Network-adjusted Unix time in seconds.
    fn adjusted_time(&self) -> u64;
}

/// Mempool admission and peer relay.
pub trait Broadcaster: Send + Sync {
    /// Try to add `tx` to the local mempool. Returns false if rejected.
    fn accept_to_mempool(&self, tx: &Transaction) -> bool;

    fn relay(&self, tx: &Transaction);
}
