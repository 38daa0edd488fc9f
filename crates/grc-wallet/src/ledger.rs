//! Transaction ledger: every wallet-relevant transaction and its spent state.
//!
//! Records are keyed by txid. A separate order index replays them in the
//! order the wallet first saw them. Spends are tracked by outpoint so that
//! an output's spent flag can always be traced to the ledger transaction
//! consuming it:
//!
//! - adding a transaction marks the owned outputs its inputs consume;
//! - adding a transaction also re-derives its own owned outputs' flags from
//!   the known consumers, ignoring consumers that sit in orphaned blocks.
//!
//! All writes go to the store before memory is updated.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info, warn};

use grc_core::constants::{RESCAN_TIME_WINDOW, SUPPORTING_COPY_DEPTH};
use grc_core::money::{Amount, checked_add};
use grc_core::traits::{BlockIndexEntry, Broadcaster, ChainView};
use grc_core::types::{Block, Hash256, OutPoint, Transaction};

use crate::error::{LedgerCorruption, WalletError};
use crate::store::{RecordKind, StoredRecord, WalletRecord, WalletStore};
use crate::vault::{IsMine, KeyVault};
use crate::wallet_tx::WalletTx;

/// Chain state captured once per operation.
///
/// Block index lookups are cached, so repeated depth queries within one
/// pass cost one chain call per block.
pub struct ChainSnapshot<'a> {
    chain: &'a dyn ChainView,
    best_height: u64,
    adjusted_time: u64,
    blocks: RefCell<HashMap<Hash256, Option<BlockIndexEntry>>>,
}

impl<'a> ChainSnapshot<'a> {
    pub fn new(chain: &'a dyn ChainView) -> Result<Self, WalletError> {
        Ok(Self {
            chain,
            best_height: chain.best_height()?,
            adjusted_time: chain.adjusted_time(),
            blocks: RefCell::new(HashMap::new()),
        })
    }

    pub fn chain(&self) -> &'a dyn ChainView {
        self.chain
    }

    pub fn best_height(&self) -> u64 {
        self.best_height
    }

    pub fn adjusted_time(&self) -> u64 {
        self.adjusted_time
    }

    pub fn block_entry(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, WalletError> {
        if let Some(entry) = self.blocks.borrow().get(hash) {
            return Ok(entry.clone());
        }
        let entry = self.chain.block_index(hash)?;
        self.blocks.borrow_mut().insert(*hash, entry.clone());
        Ok(entry)
    }

    /// Confirmations of a block: 0 unless it is on the main chain.
    pub fn block_depth(&self, hash: &Hash256) -> Result<u64, WalletError> {
        Ok(match self.block_entry(hash)? {
            Some(entry) if entry.in_main_chain && entry.height <= self.best_height => {
                self.best_height - entry.height + 1
            }
            _ => 0,
        })
    }

    /// Confirmations of a wallet record. Records never located inside their
    /// block have depth 0.
    pub fn depth(&self, wtx: &WalletTx) -> Result<u64, WalletError> {
        match (wtx.block_hash, wtx.merkle_index) {
            (Some(hash), Some(_)) => self.block_depth(&hash),
            _ => Ok(0),
        }
    }

    /// Confirmations of an arbitrary transaction per the chain's index.
    pub fn tx_depth(&self, txid: &Hash256) -> Result<u64, WalletError> {
        match self.chain.transaction_index(txid)?.and_then(|e| e.block_hash) {
            Some(hash) => self.block_depth(&hash),
            None => Ok(0),
        }
    }

    /// Whether `tx` could be included in the next block.
    pub fn is_final(&self, tx: &Transaction) -> bool {
        tx.is_final(self.best_height + 1, self.adjusted_time)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Result of loading ledger records from the store.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// Records assigned a fresh order position.
    pub reordered: usize,
    pub corrupt: Vec<LedgerCorruption>,
}

#[derive(Default)]
pub struct TransactionLedger {
    records: HashMap<Hash256, WalletTx>,
    ordered: BTreeMap<i64, Hash256>,
    order_pos_next: i64,
    /// Outpoint -> ledger transaction consuming it.
    spenders: HashMap<OutPoint, Hash256>,
}

impl TransactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, txid: &Hash256) -> Option<&WalletTx> {
        self.records.get(txid)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.records.contains_key(txid)
    }

    pub fn records(&self) -> impl Iterator<Item = &WalletTx> {
        self.records.values()
    }

    /// Records in the order the wallet first saw them.
    pub fn ordered_items(&self) -> impl Iterator<Item = &WalletTx> {
        self.ordered.values().filter_map(|id| self.records.get(id))
    }

    /// Ledger transaction consuming `outpoint`, if one is known.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<&Hash256> {
        self.spenders.get(outpoint)
    }

    pub fn order_pos_next(&self) -> i64 {
        self.order_pos_next
    }

    fn next_order_pos(&mut self, store: &dyn WalletStore) -> Result<i64, WalletError> {
        let pos = self.order_pos_next;
        store.write(&WalletRecord::OrderPosNext(pos + 1))?;
        self.order_pos_next = pos + 1;
        Ok(pos)
    }

    // --- ownership ------------------------------------------------------

    /// Ownership of output `index` of a ledger record.
    pub fn classify_output(&self, vault: &KeyVault, outpoint: &OutPoint) -> IsMine {
        self.records
            .get(&outpoint.txid)
            .and_then(|rec| rec.tx.outputs.get(outpoint.index as usize))
            .map_or(IsMine::No, |out| vault.classify_script(&out.script_pubkey))
    }

    /// Pays to a script the vault knows.
    pub fn is_mine(tx: &Transaction, vault: &KeyVault) -> bool {
        tx.outputs
            .iter()
            .any(|out| vault.classify_script(&out.script_pubkey) != IsMine::No)
    }

    /// Spends at least one output the vault owns.
    pub fn is_from_me(&self, tx: &Transaction, vault: &KeyVault) -> bool {
        tx.inputs
            .iter()
            .any(|input| self.classify_output(vault, &input.previous_output) != IsMine::No)
    }

    /// Value of owned outputs consumed by `tx`.
    pub fn debit(&self, tx: &Transaction, vault: &KeyVault) -> Result<Amount, WalletError> {
        let mut total: Amount = 0;
        for input in &tx.inputs {
            let op = &input.previous_output;
            let Some(out) = self
                .records
                .get(&op.txid)
                .and_then(|rec| rec.tx.outputs.get(op.index as usize))
            else {
                continue;
            };
            if vault.classify_script(&out.script_pubkey) != IsMine::No {
                total = checked_add(total, out.value)
                    .ok_or_else(|| WalletError::InvalidAmount("debit out of range".into()))?;
            }
        }
        Ok(total)
    }

    fn is_orphaned(&self, txid: &Hash256, snapshot: &ChainSnapshot<'_>) -> Result<bool, WalletError> {
        let Some(rec) = self.records.get(txid) else {
            return Ok(true);
        };
        match rec.block_hash {
            Some(hash) => Ok(!snapshot.block_entry(&hash)?.is_some_and(|e| e.in_main_chain)),
            None => Ok(false),
        }
    }

    // --- mutation -------------------------------------------------------

    /// Insert a new record or merge new information into an existing one.
    ///
    /// New records get the next order position, the current adjusted time as
    /// receipt time, and the containing block's time as smart time when the
    /// block is known. Merges take a concrete block hash or merkle index
    /// over an absent one, a set `from_me`, and the union of spent flags.
    /// The spent cross-check on the inputs always runs. Owned outputs get
    /// their flags re-derived from known consumers only on first insert or
    /// when the observation carries a block, so a bare relay of a known
    /// record keeps flags the auditor set from the chain index.
    pub fn add_or_update(
        &mut self,
        incoming: WalletTx,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
        store: &dyn WalletStore,
    ) -> Result<AddOutcome, WalletError> {
        let txid = incoming.txid;
        let in_block = incoming.block_hash.is_some();
        let outcome = if let Some(existing) = self.records.get(&txid) {
            let mut merged = existing.clone();
            let mut updated = false;
            if incoming.block_hash.is_some() && incoming.block_hash != merged.block_hash {
                merged.block_hash = incoming.block_hash;
                updated = true;
            }
            if incoming.merkle_index.is_some() && incoming.merkle_index != merged.merkle_index {
                merged.merkle_index = incoming.merkle_index;
                merged.merkle_branch = incoming.merkle_branch;
                updated = true;
            }
            if incoming.from_me && !merged.from_me {
                merged.from_me = true;
                updated = true;
            }
            if !incoming.supporting.is_empty() && incoming.supporting != merged.supporting {
                merged.supporting = incoming.supporting;
                updated = true;
            }
            updated |= merged.update_spent(&incoming.spent);
            if updated {
                store.write(&WalletRecord::Tx(merged.clone()))?;
                self.records.insert(txid, merged);
                AddOutcome::Updated
            } else {
                AddOutcome::Unchanged
            }
        } else {
            let mut wtx = incoming;
            wtx.time_received = snapshot.adjusted_time();
            wtx.time_smart = match wtx.block_hash {
                Some(hash) => snapshot
                    .block_entry(&hash)?
                    .map_or(wtx.time_received, |entry| entry.time),
                None => wtx.time_received,
            };
            wtx.order_pos = self.next_order_pos(store)?;
            store.write(&WalletRecord::Tx(wtx.clone()))?;
            for input in &wtx.tx.inputs {
                if !input.previous_output.is_null() {
                    self.spenders.insert(input.previous_output, txid);
                }
            }
            self.ordered.insert(wtx.order_pos, txid);
            self.records.insert(txid, wtx);
            AddOutcome::Inserted
        };

        if outcome != AddOutcome::Unchanged {
            debug!(%txid, ?outcome, "ledger record written");
        }

        if let Some(tx) = self.records.get(&txid).map(|rec| rec.tx.clone()) {
            self.mark_spent_by_consumption(&tx, vault, store)?;
        }
        if in_block || outcome == AddOutcome::Inserted {
            self.refresh_spent(&txid, vault, snapshot, store)?;
        }
        Ok(outcome)
    }

    /// Mark every owned output consumed by `tx` as spent.
    ///
    /// Runs for every observed transaction, including ones the ledger does
    /// not keep, so that external spends of wallet outputs are noticed.
    pub fn mark_spent_by_consumption(
        &mut self,
        tx: &Transaction,
        vault: &KeyVault,
        store: &dyn WalletStore,
    ) -> Result<(), WalletError> {
        for input in &tx.inputs {
            let op = input.previous_output;
            let Some(prev) = self.records.get(&op.txid) else {
                continue;
            };
            let Some(out) = prev.tx.outputs.get(op.index as usize) else {
                warn!(txid = %op.txid, index = op.index, "input spends a missing output of a wallet transaction");
                continue;
            };
            if prev.is_spent(op.index as usize) || vault.classify_script(&out.script_pubkey) == IsMine::No {
                continue;
            }
            let mut updated = prev.clone();
            updated.mark_spent(op.index as usize);
            store.write(&WalletRecord::Tx(updated.clone()))?;
            self.records.insert(op.txid, updated);
            debug!(outpoint = %op, "marked spent");
        }
        Ok(())
    }

    /// Re-derive the spent flags of `txid`'s owned outputs from the known
    /// consumers. A consumer counts only if it is in the ledger and not in
    /// an orphaned block.
    fn refresh_spent(
        &mut self,
        txid: &Hash256,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
        store: &dyn WalletStore,
    ) -> Result<(), WalletError> {
        let Some(rec) = self.records.get(txid) else {
            return Ok(());
        };
        let mut updated = rec.clone();
        let mut changed = false;
        for (index, out) in rec.tx.outputs.iter().enumerate() {
            if vault.classify_script(&out.script_pubkey) == IsMine::No {
                continue;
            }
            let outpoint = OutPoint::new(*txid, index as u32);
            let consumed = match self.spenders.get(&outpoint) {
                Some(spender) if spender != txid => !self.is_orphaned(spender, snapshot)?,
                _ => false,
            };
            changed |= if consumed {
                updated.mark_spent(index)
            } else {
                updated.mark_unspent(index)
            };
        }
        if changed {
            store.write(&WalletRecord::Tx(updated.clone()))?;
            self.records.insert(*txid, updated);
            debug!(%txid, "spent flags re-derived from consumers");
        }
        Ok(())
    }

    /// Add `tx` if it is already known (and `update` is set), pays the
    /// wallet, or spends wallet outputs. Otherwise only the spent
    /// cross-check runs. Returns true if the ledger took the transaction.
    pub fn add_if_involving_me(
        &mut self,
        tx: Transaction,
        block: Option<&Block>,
        update: bool,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
        store: &dyn WalletStore,
    ) -> Result<bool, WalletError> {
        let txid = tx.txid()?;
        let exists = self.records.contains_key(&txid);
        if exists && !update {
            return Ok(false);
        }
        if exists || Self::is_mine(&tx, vault) || self.is_from_me(&tx, vault) {
            let mut wtx = WalletTx::new(tx)?;
            if let Some(block) = block {
                wtx.set_merkle_branch(block)?;
            }
            self.add_or_update(wtx, vault, snapshot, store)?;
            return Ok(true);
        }
        self.mark_spent_by_consumption(&tx, vault, store)?;
        Ok(false)
    }

    /// Remove a record. Returns false if it is absent or the store is not
    /// file-backed. Outputs this transaction had consumed become unspent.
    pub fn erase(&mut self, txid: &Hash256, store: &dyn WalletStore) -> Result<bool, WalletError> {
        if !store.is_persistent() {
            return Ok(false);
        }
        let Some(rec) = self.records.get(txid) else {
            return Ok(false);
        };
        store.erase(&crate::store::RecordKey::Tx(*txid))?;
        let rec = rec.clone();
        self.records.remove(txid);
        self.ordered.remove(&rec.order_pos);

        for input in &rec.tx.inputs {
            let op = input.previous_output;
            if self.spenders.get(&op) != Some(txid) {
                continue;
            }
            self.spenders.remove(&op);
            if let Some(prev) = self.records.get(&op.txid) {
                let mut updated = prev.clone();
                if updated.mark_unspent(op.index as usize) {
                    store.write(&WalletRecord::Tx(updated.clone()))?;
                    self.records.insert(op.txid, updated);
                }
            }
        }
        info!(%txid, "erased wallet transaction");
        Ok(true)
    }

    /// A wallet coinstake left the main chain: its inputs are spendable again.
    pub fn disable_transaction(
        &mut self,
        tx: &Transaction,
        vault: &KeyVault,
        store: &dyn WalletStore,
    ) -> Result<(), WalletError> {
        if !tx.is_coinstake() || !self.is_from_me(tx, vault) {
            return Ok(());
        }
        let txid = tx.txid()?;
        for input in &tx.inputs {
            let op = input.previous_output;
            let Some(prev) = self.records.get(&op.txid) else {
                continue;
            };
            if self.classify_output(vault, &op) == IsMine::No || !prev.is_spent(op.index as usize) {
                continue;
            }
            let mut updated = prev.clone();
            updated.mark_unspent(op.index as usize);
            store.write(&WalletRecord::Tx(updated.clone()))?;
            self.records.insert(op.txid, updated);
            if self.spenders.get(&op) == Some(&txid) {
                self.spenders.remove(&op);
            }
            debug!(outpoint = %op, "coinstake input released");
        }
        Ok(())
    }

    /// Overwrite the spent flag of one output, as the auditor does.
    pub fn set_spent(
        &mut self,
        outpoint: &OutPoint,
        spent: bool,
        store: &dyn WalletStore,
    ) -> Result<bool, WalletError> {
        let Some(rec) = self.records.get(&outpoint.txid) else {
            return Ok(false);
        };
        let mut updated = rec.clone();
        let changed = if spent {
            updated.mark_spent(outpoint.index as usize)
        } else {
            updated.mark_unspent(outpoint.index as usize)
        };
        if changed {
            store.write(&WalletRecord::Tx(updated.clone()))?;
            self.records.insert(outpoint.txid, updated);
        }
        Ok(changed)
    }

    // --- chain replay ---------------------------------------------------

    /// Replay main-chain blocks from `from_height` through the involvement
    /// filter. Blocks older than the first key minus a two hour window are
    /// skipped. Returns how many transactions the ledger took.
    pub fn scan_chain(
        &mut self,
        from_height: u64,
        update: bool,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
        store: &dyn WalletStore,
    ) -> Result<usize, WalletError> {
        let cutoff = vault
            .first_key_time()
            .map_or(0, |t| t.saturating_sub(RESCAN_TIME_WINDOW));
        let mut added = 0;
        for height in from_height..=snapshot.best_height() {
            let Some(block) = snapshot.chain().block_at_height(height)? else {
                break;
            };
            if block.header.time < cutoff {
                continue;
            }
            for tx in &block.transactions {
                if self.add_if_involving_me(tx.clone(), Some(&block), update, vault, snapshot, store)? {
                    added += 1;
                }
            }
        }
        info!(from_height, to_height = snapshot.best_height(), added, "chain scan complete");
        Ok(added)
    }

    // --- trust and ancestry ---------------------------------------------

    fn find_tx<'s>(&'s self, txid: &Hash256, supporting: &'s HashMap<Hash256, &'s Transaction>) -> Option<&'s Transaction> {
        self.records
            .get(txid)
            .map(|rec| &rec.tx)
            .or_else(|| supporting.get(txid).copied())
    }

    fn ancestor_depth(&self, txid: &Hash256, snapshot: &ChainSnapshot<'_>) -> Result<u64, WalletError> {
        match self.records.get(txid) {
            Some(rec) => snapshot.depth(rec),
            None => snapshot.tx_depth(txid),
        }
    }

    /// Every transaction `wtx` spends from has at least one confirmation.
    pub fn dependencies_confirmed(&self, wtx: &WalletTx, snapshot: &ChainSnapshot<'_>) -> Result<bool, WalletError> {
        for input in &wtx.tx.inputs {
            if input.previous_output.is_null() {
                continue;
            }
            if self.ancestor_depth(&input.previous_output.txid, snapshot)? < 1 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether `wtx`'s credit can be counted before it confirms.
    ///
    /// `depth` is the record's own depth, computed by the caller. A final
    /// confirmed record is trusted. An unconfirmed one is trusted only if it
    /// is ours and every unconfirmed ancestor is final, ours, and has all of
    /// its inputs resolvable.
    pub fn is_trusted(
        &self,
        wtx: &WalletTx,
        depth: u64,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
    ) -> Result<bool, WalletError> {
        if !snapshot.is_final(&wtx.tx) {
            return Ok(false);
        }
        if depth >= 1 {
            return Ok(true);
        }
        if !wtx.from_me {
            return Ok(false);
        }

        let mut supporting: HashMap<Hash256, &Transaction> = HashMap::new();
        for tx in &wtx.supporting {
            supporting.insert(tx.txid()?, tx);
        }

        let mut queue: Vec<&Transaction> = vec![&wtx.tx];
        let mut seen: HashSet<Hash256> = HashSet::new();
        let mut first = true;
        while let Some(tx) = queue.pop() {
            if !first {
                if !snapshot.is_final(tx) {
                    return Ok(false);
                }
                if self.ancestor_depth(&tx.txid()?, snapshot)? >= 1 {
                    continue;
                }
                if !self.is_from_me(tx, vault) {
                    return Ok(false);
                }
            }
            first = false;
            for input in &tx.inputs {
                let prev_id = input.previous_output.txid;
                if !seen.insert(prev_id) {
                    continue;
                }
                match self.find_tx(&prev_id, &supporting) {
                    Some(prev) => queue.push(prev),
                    None => return Ok(false),
                }
            }
        }
        Ok(true)
    }

    /// Copy unconfirmed-enough ancestors of `wtx` into its supporting list.
    ///
    /// Nothing is copied once `wtx` itself has [`SUPPORTING_COPY_DEPTH`]
    /// confirmations. Ancestors come from the ledger, then from the
    /// previously copied list, then from the chain; missing ones are logged
    /// and skipped. Recursion stops at ancestors with enough confirmations.
    pub fn add_supporting(&self, wtx: &mut WalletTx, snapshot: &ChainSnapshot<'_>) -> Result<(), WalletError> {
        let mut previous: HashMap<Hash256, Transaction> = HashMap::new();
        for tx in wtx.supporting.drain(..) {
            previous.insert(tx.txid()?, tx);
        }
        if snapshot.depth(wtx)? >= SUPPORTING_COPY_DEPTH {
            return Ok(());
        }

        let mut queue: Vec<Hash256> = wtx
            .tx
            .inputs
            .iter()
            .filter(|i| !i.previous_output.is_null())
            .map(|i| i.previous_output.txid)
            .collect();
        let mut done: HashSet<Hash256> = HashSet::new();
        let mut collected = Vec::new();
        let mut next = 0;
        while next < queue.len() {
            let txid = queue[next];
            next += 1;
            if !done.insert(txid) {
                continue;
            }
            let (tx, depth) = if let Some(rec) = self.records.get(&txid) {
                for ancestor in &rec.supporting {
                    previous.entry(ancestor.txid()?).or_insert_with(|| ancestor.clone());
                }
                (rec.tx.clone(), snapshot.depth(rec)?)
            } else if let Some(tx) = previous.get(&txid) {
                (tx.clone(), snapshot.tx_depth(&txid)?)
            } else if let Some(tx) = snapshot.chain().read_transaction(&txid)? {
                (tx, snapshot.tx_depth(&txid)?)
            } else {
                warn!(%txid, "supporting transaction not found");
                continue;
            };
            if depth < SUPPORTING_COPY_DEPTH {
                queue.extend(
                    tx.inputs
                        .iter()
                        .filter(|i| !i.previous_output.is_null())
                        .map(|i| i.previous_output.txid),
                );
            }
            collected.push(tx);
        }
        collected.reverse();
        wtx.supporting = collected;
        Ok(())
    }

    // --- loading --------------------------------------------------------

    /// Rebuild the ledger from stored records. Undecodable records and
    /// records whose spent flags do not match their output count are
    /// reported and skipped.
    pub fn load(&mut self, records: &[StoredRecord], store: &dyn WalletStore) -> Result<LoadReport, WalletError> {
        let mut report = LoadReport::default();
        for raw in records {
            match raw.kind {
                RecordKind::OrderPosNext => match WalletRecord::decode(&raw.value) {
                    Ok(WalletRecord::OrderPosNext(next)) => {
                        self.order_pos_next = self.order_pos_next.max(next);
                    }
                    _ => warn!("ignoring unreadable order position counter"),
                },
                RecordKind::Tx => match self.load_tx(raw) {
                    Ok(()) => report.loaded += 1,
                    Err(corruption) => {
                        warn!(txid = ?corruption.txid, reason = %corruption.reason, "skipping corrupt ledger record");
                        report.corrupt.push(corruption);
                    }
                },
                _ => {}
            }
        }

        let max_pos = self.ordered.keys().next_back().copied().unwrap_or(-1);
        self.order_pos_next = self.order_pos_next.max(max_pos + 1);

        let mut unordered: Vec<(u64, Hash256)> = self
            .records
            .values()
            .filter(|rec| rec.order_pos < 0 || self.ordered.get(&rec.order_pos) != Some(&rec.txid))
            .map(|rec| (rec.time_received, rec.txid))
            .collect();
        unordered.sort();
        for (_, txid) in unordered {
            let pos = self.next_order_pos(store)?;
            if let Some(rec) = self.records.get_mut(&txid) {
                rec.order_pos = pos;
                store.write(&WalletRecord::Tx(rec.clone()))?;
            }
            self.ordered.insert(pos, txid);
            report.reordered += 1;
        }

        self.spenders.clear();
        for rec in self.records.values() {
            for input in &rec.tx.inputs {
                if !input.previous_output.is_null() {
                    self.spenders.insert(input.previous_output, rec.txid);
                }
            }
        }
        info!(loaded = report.loaded, corrupt = report.corrupt.len(), reordered = report.reordered, "ledger loaded");
        Ok(report)
    }

    fn load_tx(&mut self, raw: &StoredRecord) -> Result<(), LedgerCorruption> {
        let key_txid = <[u8; 32]>::try_from(raw.key.as_slice()).ok().map(Hash256);
        let corrupt = |reason: String| LedgerCorruption {
            txid: key_txid,
            reason,
        };
        let wtx = match WalletRecord::decode(&raw.value) {
            Ok(WalletRecord::Tx(wtx)) => wtx,
            Ok(_) => return Err(corrupt("record of another kind in transaction column".into())),
            Err(e) => return Err(corrupt(e.to_string())),
        };
        if !wtx.has_valid_spent_len() {
            return Err(corrupt(format!(
                "spent flags cover {} of {} outputs",
                wtx.spent.len(),
                wtx.tx.outputs.len()
            )));
        }
        let txid = wtx.tx.txid().map_err(|e| corrupt(e.to_string()))?;
        if txid != wtx.txid || Some(txid) != key_txid {
            return Err(corrupt("stored txid does not match transaction".into()));
        }
        if wtx.order_pos >= 0 && !self.ordered.contains_key(&wtx.order_pos) {
            self.ordered.insert(wtx.order_pos, txid);
        }
        self.records.insert(txid, wtx);
        Ok(())
    }
}

/// Relay `wtx` and the supporting ancestors the chain does not yet index.
///
/// Coinbase and coinstake records are never relayed. Returns the number of
/// transactions handed to the broadcaster.
pub fn relay_wallet_tx(
    wtx: &WalletTx,
    chain: &dyn ChainView,
    broadcaster: &dyn Broadcaster,
) -> Result<usize, WalletError> {
    let mut relayed = 0;
    for ancestor in &wtx.supporting {
        if ancestor.is_coinbase() || ancestor.is_coinstake() {
            continue;
        }
        if !chain.contains_transaction(&ancestor.txid()?)? {
            broadcaster.relay(ancestor);
            relayed += 1;
        }
    }
    if !wtx.is_coinbase_like() && !chain.contains_transaction(&wtx.txid)? {
        debug!(txid = %wtx.txid, "relaying wallet transaction");
        broadcaster.relay(&wtx.tx);
        relayed += 1;
    }
    Ok(relayed)
}
