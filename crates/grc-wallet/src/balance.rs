//! Read-side balance accounting over the ledger.
//!
//! Every query is one pass over the ledger. Depth is the expensive lookup,
//! so each pass computes it once per record and hands it to the trust and
//! maturity checks.

use std::collections::{BTreeMap, BTreeSet};

use grc_core::money::{Amount, checked_add, money_range};
use grc_core::script::Destination;

use crate::error::WalletError;
use crate::ledger::{ChainSnapshot, TransactionLedger};
use crate::vault::{IsMine, KeyVault};
use crate::wallet_tx::WalletTx;

/// The four wallet balance totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balances {
    /// Spendable now: trusted, and confirmed or self-originated.
    pub confirmed: Amount,
    /// Not final, or unconfirmed and received from someone else.
    pub unconfirmed: Amount,
    /// Coinbase rewards below maturity.
    pub immature: Amount,
    /// Coinstake rewards below maturity.
    pub stake: Amount,
}

fn add(total: Amount, value: Amount) -> Result<Amount, WalletError> {
    checked_add(total, value).ok_or_else(|| WalletError::InvalidAmount("balance out of range".into()))
}

pub struct BalanceAccountant<'a> {
    ledger: &'a TransactionLedger,
    vault: &'a KeyVault,
    snapshot: &'a ChainSnapshot<'a>,
}

impl<'a> BalanceAccountant<'a> {
    pub fn new(ledger: &'a TransactionLedger, vault: &'a KeyVault, snapshot: &'a ChainSnapshot<'a>) -> Self {
        Self {
            ledger,
            vault,
            snapshot,
        }
    }

    /// Value of every spendable output, spent or not.
    pub fn credit(&self, wtx: &WalletTx) -> Result<Amount, WalletError> {
        let mut total = 0;
        for out in &wtx.tx.outputs {
            if self.vault.classify_script(&out.script_pubkey) != IsMine::Spendable {
                continue;
            }
            if !money_range(out.value) {
                return Err(WalletError::InvalidAmount(format!("output value {} out of range", out.value)));
            }
            total = add(total, out.value)?;
        }
        Ok(total)
    }

    /// Value of unspent spendable outputs. Zero for immature rewards.
    pub fn available_credit(&self, wtx: &WalletTx, depth: u64) -> Result<Amount, WalletError> {
        if wtx.blocks_to_maturity(depth) > 0 {
            return Ok(0);
        }
        let mut total = 0;
        for (index, out) in wtx.tx.outputs.iter().enumerate() {
            if wtx.is_spent(index) || self.vault.classify_script(&out.script_pubkey) != IsMine::Spendable {
                continue;
            }
            if !money_range(out.value) {
                return Err(WalletError::InvalidAmount(format!("output value {} out of range", out.value)));
            }
            total = add(total, out.value)?;
        }
        Ok(total)
    }

    /// All four totals in a single pass.
    pub fn balances(&self) -> Result<Balances, WalletError> {
        let mut balances = Balances::default();
        for wtx in self.ledger.records() {
            let depth = self.snapshot.depth(wtx)?;
            let is_final = self.snapshot.is_final(&wtx.tx);

            if is_final
                && (depth >= 1 || wtx.from_me)
                && self.ledger.is_trusted(wtx, depth, self.vault, self.snapshot)?
            {
                balances.confirmed = add(balances.confirmed, self.available_credit(wtx, depth)?)?;
            }
            if !is_final || (depth == 0 && !wtx.from_me) {
                balances.unconfirmed = add(balances.unconfirmed, self.available_credit(wtx, depth)?)?;
            }
            if wtx.blocks_to_maturity(depth) > 0 && depth > 0 {
                if wtx.tx.is_coinbase() {
                    balances.immature = add(balances.immature, self.credit(wtx)?)?;
                } else if wtx.tx.is_coinstake() {
                    balances.stake = add(balances.stake, self.credit(wtx)?)?;
                }
            }
        }
        Ok(balances)
    }

    pub fn confirmed(&self) -> Result<Amount, WalletError> {
        Ok(self.balances()?.confirmed)
    }

    pub fn unconfirmed(&self) -> Result<Amount, WalletError> {
        Ok(self.balances()?.unconfirmed)
    }

    pub fn immature(&self) -> Result<Amount, WalletError> {
        Ok(self.balances()?.immature)
    }

    pub fn stake(&self) -> Result<Amount, WalletError> {
        Ok(self.balances()?.stake)
    }

    /// Unspent value per owned destination.
    ///
    /// Only final, trusted, mature records count; records received from
    /// others need one confirmation. Spent outputs still list their
    /// destination with zero value.
    pub fn address_balances(&self) -> Result<BTreeMap<Destination, Amount>, WalletError> {
        let mut balances = BTreeMap::new();
        for wtx in self.ledger.records() {
            if !self.snapshot.is_final(&wtx.tx) {
                continue;
            }
            let depth = self.snapshot.depth(wtx)?;
            if !self.ledger.is_trusted(wtx, depth, self.vault, self.snapshot)? {
                continue;
            }
            if wtx.blocks_to_maturity(depth) > 0 {
                continue;
            }
            if depth < u64::from(!wtx.from_me) {
                continue;
            }
            for (index, out) in wtx.tx.outputs.iter().enumerate() {
                if self.vault.classify_script(&out.script_pubkey) == IsMine::No {
                    continue;
                }
                let Some(dest) = out.script_pubkey.destination() else {
                    continue;
                };
                let value = if wtx.is_spent(index) { 0 } else { out.value };
                let entry = balances.entry(dest).or_insert(0);
                *entry = add(*entry, value)?;
            }
        }
        Ok(balances)
    }

    /// Owned destinations linked by common input ownership.
    ///
    /// A transaction whose first input is ours ties together all of its
    /// owned input destinations plus its change outputs (owned outputs with
    /// no address book label). Every owned output destination also appears
    /// on its own. Overlapping groups are merged.
    pub fn address_groupings(&self, labels: &BTreeMap<Destination, String>) -> BTreeSet<BTreeSet<Destination>> {
        let mut groupings: Vec<BTreeSet<Destination>> = Vec::new();
        for wtx in self.ledger.ordered_items() {
            let first_is_mine = wtx
                .tx
                .inputs
                .first()
                .is_some_and(|input| self.ledger.classify_output(self.vault, &input.previous_output) != IsMine::No);
            if first_is_mine {
                let mut grouping = BTreeSet::new();
                for input in &wtx.tx.inputs {
                    let op = &input.previous_output;
                    if self.ledger.classify_output(self.vault, op) == IsMine::No {
                        continue;
                    }
                    let dest = self
                        .ledger
                        .get(&op.txid)
                        .and_then(|prev| prev.tx.outputs.get(op.index as usize))
                        .and_then(|out| out.script_pubkey.destination());
                    if let Some(dest) = dest {
                        grouping.insert(dest);
                    }
                }
                if !grouping.is_empty() {
                    for out in &wtx.tx.outputs {
                        if self.vault.classify_script(&out.script_pubkey) == IsMine::No {
                            continue;
                        }
                        if let Some(dest) = out.script_pubkey.destination() {
                            if !labels.contains_key(&dest) {
                                grouping.insert(dest);
                            }
                        }
                    }
                    groupings.push(grouping);
                }
            }

            for out in &wtx.tx.outputs {
                if self.vault.classify_script(&out.script_pubkey) == IsMine::No {
                    continue;
                }
                if let Some(dest) = out.script_pubkey.destination() {
                    groupings.push(BTreeSet::from([dest]));
                }
            }
        }
        merge_groupings(groupings)
    }
}

/// Merge every pair of groups that share a member.
fn merge_groupings(groupings: Vec<BTreeSet<Destination>>) -> BTreeSet<BTreeSet<Destination>> {
    let mut merged: Vec<BTreeSet<Destination>> = Vec::new();
    for mut group in groupings {
        let mut i = 0;
        while i < merged.len() {
            if merged[i].is_disjoint(&group) {
                i += 1;
            } else {
                group.extend(merged.swap_remove(i));
            }
        }
        merged.push(group);
    }
    merged.into_iter().collect()
}
