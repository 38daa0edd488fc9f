//! Wallet transaction record: a transaction plus wallet-local annotations.

use serde::{Deserialize, Serialize};

use grc_core::constants::STAKE_MATURITY;
use grc_core::merkle::merkle_branch;
use grc_core::types::{Block, Hash256, Transaction};

use crate::error::WalletError;

/// A transaction the wallet tracks.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct WalletTx {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Containing block, if any has been seen.
    pub block_hash: Option<Hash256>,
    /// Position within the containing block. `None` until located.
    pub merkle_index: Option<u32>,
    pub merkle_branch: Vec<Hash256>,
    /// One flag per output.
    pub spent: Vec<bool>,
    /// Created by this wallet.
    pub from_me: bool,
    /// Unix time the wallet first saw the transaction.
    pub time_received: u64,
    /// Containing block time when known at insertion, else `time_received`.
    pub time_smart: u64,
    /// Chronological position among all ledger records.
    pub order_pos: i64,
    /// Ancestors copied in so the record can be relayed on its own.
    pub supporting: Vec<Transaction>,
}

impl WalletTx {
    pub fn new(tx: Transaction) -> Result<Self, WalletError> {
        let txid = tx.txid()?;
        let spent = vec![false; tx.outputs.len()];
        Ok(Self {
            tx,
            txid,
            block_hash: None,
            merkle_index: None,
            merkle_branch: Vec::new(),
            spent,
            from_me: false,
            time_received: 0,
            time_smart: 0,
            order_pos: -1,
            supporting: Vec::new(),
        })
    }

    pub fn is_spent(&self, index: usize) -> bool {
        self.spent.get(index).copied().unwrap_or(false)
    }

    /// Returns true if the flag changed.
    pub fn mark_spent(&mut self, index: usize) -> bool {
        match self.spent.get_mut(index) {
            Some(flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    /// Returns true if the flag changed.
    pub fn mark_unspent(&mut self, index: usize) -> bool {
        match self.spent.get_mut(index) {
            Some(flag) if *flag => {
                *flag = false;
                true
            }
            _ => false,
        }
    }

    /// Union `other` into the spent flags. Entries past our own output count
    /// are ignored. Returns true if anything changed.
    pub fn update_spent(&mut self, other: &[bool]) -> bool {
        let mut changed = false;
        for (flag, &theirs) in self.spent.iter_mut().zip(other) {
            if theirs && !*flag {
                *flag = true;
                changed = true;
            }
        }
        changed
    }

    pub fn has_valid_spent_len(&self) -> bool {
        self.spent.len() == self.tx.outputs.len()
    }

    pub fn is_coinbase_like(&self) -> bool {
        self.tx.is_coinbase() || self.tx.is_coinstake()
    }

    /// Locate this transaction in `block` and record its merkle position.
    ///
    /// If the block does not contain it the block hash is still recorded but
    /// the index stays `None`.
    pub fn set_merkle_branch(&mut self, block: &Block) -> Result<(), WalletError> {
        self.block_hash = Some(block.hash());
        let txids = block.txids()?;
        match txids.iter().position(|id| *id == self.txid) {
            Some(pos) => {
                self.merkle_branch = merkle_branch(&txids, pos).unwrap_or_default();
                self.merkle_index = Some(pos as u32);
            }
            None => {
                self.merkle_branch.clear();
                self.merkle_index = None;
            }
        }
        Ok(())
    }

    /// Blocks left before a coinbase or coinstake at `depth` matures.
    /// Always zero for ordinary transactions.
    pub fn blocks_to_maturity(&self, depth: u64) -> u64 {
        if self.is_coinbase_like() {
            STAKE_MATURITY.saturating_sub(depth)
        } else {
            0
        }
    }

    /// Display time: smart time when set, else receipt time.
    pub fn time(&self) -> u64 {
        if self.time_smart != 0 {
            self.time_smart
        } else {
            self.time_received
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grc_core::merkle::verify_branch;
    use grc_core::script::Script;
    use grc_core::types::{BlockHeader, OutPoint, TxInput, TxOutput};

    fn tx(outputs: usize, nonce: u64) -> Transaction {
        Transaction {
            version: 1,
            time: nonce,
            inputs: vec![TxInput::unsigned(OutPoint::new(Hash256([9; 32]), 0))],
            outputs: (0..outputs)
                .map(|i| TxOutput::new(10 + i as i64, Script::PayToKeyHash(Hash256([1; 32]))))
                .collect(),
            lock_time: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn new_record_has_one_flag_per_output() {
        let wtx = WalletTx::new(tx(3, 0)).unwrap();
        assert_eq!(wtx.spent, vec![false; 3]);
        assert!(wtx.has_valid_spent_len());
        assert_eq!(wtx.order_pos, -1);
    }

    #[test]
    fn mark_spent_reports_change_and_ignores_bad_index() {
        let mut wtx = WalletTx::new(tx(2, 0)).unwrap();
        assert!(wtx.mark_spent(1));
        assert!(!wtx.mark_spent(1));
        assert!(!wtx.mark_spent(7));
        assert!(wtx.is_spent(1));
        assert!(wtx.mark_unspent(1));
        assert!(!wtx.mark_unspent(1));
    }

    #[test]
    fn update_spent_is_a_bounded_union() {
        let mut wtx = WalletTx::new(tx(2, 0)).unwrap();
        wtx.mark_spent(0);
        assert!(wtx.update_spent(&[false, true, true, true]));
        assert_eq!(wtx.spent, vec![true, true]);
        assert!(!wtx.update_spent(&[false, false]));
    }

    #[test]
    fn merkle_branch_located_in_block() {
        let txs: Vec<Transaction> = (0..5).map(|n| tx(1, n)).collect();
        let txids: Vec<Hash256> = txs.iter().map(|t| t.txid().unwrap()).collect();
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: grc_core::merkle::merkle_root(&txids),
                time: 100,
                bits: 0,
                nonce: 0,
            },
            transactions: txs.clone(),
        };
        let mut wtx = WalletTx::new(txs[3].clone()).unwrap();
        wtx.set_merkle_branch(&block).unwrap();
        assert_eq!(wtx.merkle_index, Some(3));
        assert_eq!(wtx.block_hash, Some(block.hash()));
        assert!(verify_branch(&wtx.txid, &wtx.merkle_branch, 3, &block.header.merkle_root));

        let mut stranger = WalletTx::new(tx(1, 99)).unwrap();
        stranger.set_merkle_branch(&block).unwrap();
        assert_eq!(stranger.merkle_index, None);
        assert!(stranger.merkle_branch.is_empty());
    }

    #[test]
    fn maturity_only_applies_to_coinbase_like() {
        let plain = WalletTx::new(tx(1, 0)).unwrap();
        assert_eq!(plain.blocks_to_maturity(0), 0);

        let mut coinbase = tx(1, 0);
        coinbase.inputs = vec![TxInput::unsigned(OutPoint::null())];
        let wtx = WalletTx::new(coinbase).unwrap();
        assert_eq!(wtx.blocks_to_maturity(10), STAKE_MATURITY - 10);
        assert_eq!(wtx.blocks_to_maturity(500), 0);
    }
}
