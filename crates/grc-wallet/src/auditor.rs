//! Spent-state reconciliation against the chain's transaction index.
//!
//! The chain index records, per output, the transaction that spends it.
//! Owned outputs whose ledger flag disagrees are reported and, unless
//! running check-only, corrected in either direction. Records the index
//! does not know are skipped.

use tracing::{info, warn};

use grc_core::money::{Amount, checked_add, format_money};
use grc_core::traits::ChainView;
use grc_core::types::{Hash256, OutPoint};

use crate::error::WalletError;
use crate::ledger::TransactionLedger;
use crate::store::WalletStore;
use crate::vault::{IsMine, KeyVault};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MismatchKind {
    /// Ledger says spent, chain says unspent.
    LostCoin,
    /// Ledger says unspent, chain says spent.
    UnrecordedSpend,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub kind: MismatchKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mismatches: Vec<Mismatch>,
    /// Total value of the mismatched outputs.
    pub value: Amount,
    /// Whether the ledger was corrected.
    pub repaired: bool,
}

impl ReconcileReport {
    pub fn mismatch_count(&self) -> usize {
        self.mismatches.len()
    }

    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct ConsistencyAuditor<'a> {
    chain: &'a dyn ChainView,
}

impl<'a> ConsistencyAuditor<'a> {
    pub fn new(chain: &'a dyn ChainView) -> Self {
        Self { chain }
    }

    /// Compare every owned output's spent flag with the chain index and,
    /// unless `check_only`, overwrite the ledger flag with the chain's.
    pub fn reconcile(
        &self,
        ledger: &mut TransactionLedger,
        vault: &KeyVault,
        store: &dyn WalletStore,
        check_only: bool,
    ) -> Result<ReconcileReport, WalletError> {
        let mut txids: Vec<Hash256> = ledger.records().map(|r| r.txid).collect();
        txids.sort();

        let mut report = ReconcileReport {
            repaired: !check_only,
            ..ReconcileReport::default()
        };
        for txid in txids {
            let Some(entry) = self.chain.transaction_index(&txid)? else {
                continue;
            };
            let Some(rec) = ledger.get(&txid) else {
                continue;
            };
            let mut found = Vec::new();
            for (index, out) in rec.tx.outputs.iter().enumerate() {
                if vault.classify_script(&out.script_pubkey) == IsMine::No {
                    continue;
                }
                let kind = match (rec.is_spent(index), entry.is_spent(index)) {
                    (true, false) => MismatchKind::LostCoin,
                    (false, true) => MismatchKind::UnrecordedSpend,
                    _ => continue,
                };
                found.push(Mismatch {
                    outpoint: OutPoint::new(txid, index as u32),
                    value: out.value,
                    kind,
                });
            }

            for mismatch in found {
                warn!(
                    outpoint = %mismatch.outpoint,
                    value = %format_money(mismatch.value),
                    kind = ?mismatch.kind,
                    check_only,
                    "spent state mismatch"
                );
                report.value = checked_add(report.value, mismatch.value)
                    .ok_or_else(|| WalletError::InvalidAmount("mismatched value out of range".into()))?;
                if !check_only {
                    let spent = mismatch.kind == MismatchKind::UnrecordedSpend;
                    ledger.set_spent(&mismatch.outpoint, spent, store)?;
                }
                report.mismatches.push(mismatch);
            }
        }

        if !report.is_consistent() {
            info!(
                mismatches = report.mismatch_count(),
                value = %format_money(report.value),
                repaired = report.repaired,
                "reconcile finished"
            );
        }
        Ok(report)
    }

    /// Check-only pass that turns any disagreement into an error.
    pub fn verify(
        &self,
        ledger: &mut TransactionLedger,
        vault: &KeyVault,
        store: &dyn WalletStore,
    ) -> Result<(), WalletError> {
        let report = self.reconcile(ledger, vault, store, true)?;
        if report.is_consistent() {
            Ok(())
        } else {
            Err(WalletError::ReorgInconsistency {
                mismatches: report.mismatch_count(),
                value: report.value,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ChainSnapshot;
    use crate::store::{MemoryWalletStore, RecordKey, WalletRecord};
    use crate::test_support::*;
    use grc_core::constants::COIN;
    use grc_core::script::Script;
    use grc_core::types::{Transaction, TxOutput};

    struct Fixture {
        chain: MockChain,
        store: MemoryWalletStore,
        vault: KeyVault,
        mine: Script,
        ledger: TransactionLedger,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryWalletStore::new();
            let (vault, mine) = vault_with_key(&store);
            Self {
                chain: MockChain::new(),
                store,
                vault,
                mine,
                ledger: TransactionLedger::new(),
            }
        }

        fn confirm(&mut self, tx: &Transaction) -> Hash256 {
            let block = self.chain.mine(vec![tx.clone()]);
            let snapshot = ChainSnapshot::new(&self.chain).unwrap();
            self.ledger
                .add_if_involving_me(tx.clone(), Some(&block), true, &self.vault, &snapshot, &self.store)
                .unwrap();
            tx.txid().unwrap()
        }

        fn reconcile(&mut self, check_only: bool) -> ReconcileReport {
            ConsistencyAuditor::new(&self.chain)
                .reconcile(&mut self.ledger, &self.vault, &self.store, check_only)
                .unwrap()
        }
    }

    #[test]
    fn consistent_ledger_reports_nothing() {
        let mut f = Fixture::new();
        let funding = f.confirm(&receive(&f.mine, &[5 * COIN], 1));
        f.confirm(&spend(&[OutPoint::new(funding, 0)], vec![]));
        let report = f.reconcile(false);
        assert!(report.is_consistent());
        assert_eq!(report.value, 0);
    }

    #[test]
    fn lost_coin_is_marked_unspent() {
        let mut f = Fixture::new();
        let funding = f.confirm(&receive(&f.mine, &[5 * COIN, 2 * COIN], 1));
        let op = OutPoint::new(funding, 1);
        f.ledger.set_spent(&op, true, &f.store).unwrap();

        let report = f.reconcile(false);
        assert_eq!(report.mismatches, vec![Mismatch {
            outpoint: op,
            value: 2 * COIN,
            kind: MismatchKind::LostCoin,
        }]);
        assert_eq!(report.value, 2 * COIN);
        assert!(!f.ledger.get(&funding).unwrap().is_spent(1));
        let Some(WalletRecord::Tx(stored)) = f.store.get(&RecordKey::Tx(funding)) else {
            panic!("record missing");
        };
        assert!(!stored.is_spent(1));
    }

    #[test]
    fn spend_unknown_to_ledger_is_marked() {
        let mut f = Fixture::new();
        let funding = f.confirm(&receive(&f.mine, &[3 * COIN], 1));
        f.chain.index_entry_mut(&funding).unwrap().spent_by[0] = Some(Hash256([9; 32]));

        let report = f.reconcile(false);
        assert_eq!(report.mismatch_count(), 1);
        assert_eq!(report.mismatches[0].kind, MismatchKind::UnrecordedSpend);
        assert!(f.ledger.get(&funding).unwrap().is_spent(0));
    }

    #[test]
    fn second_pass_is_clean() {
        let mut f = Fixture::new();
        let a = f.confirm(&receive(&f.mine, &[COIN, COIN], 1));
        let b = f.confirm(&receive(&f.mine, &[4 * COIN], 2));
        f.ledger.set_spent(&OutPoint::new(a, 0), true, &f.store).unwrap();
        f.chain.index_entry_mut(&b).unwrap().spent_by[0] = Some(Hash256([9; 32]));

        let first = f.reconcile(false);
        assert_eq!(first.mismatch_count(), 2);
        assert_eq!(first.value, 5 * COIN);
        assert!(f.reconcile(false).is_consistent());
    }

    #[test]
    fn relayed_copy_keeps_repaired_spend() {
        let mut f = Fixture::new();
        let tx = receive(&f.mine, &[3 * COIN], 1);
        let funding = f.confirm(&tx);
        f.chain.index_entry_mut(&funding).unwrap().spent_by[0] = Some(Hash256([9; 32]));
        assert_eq!(f.reconcile(false).mismatch_count(), 1);

        let snapshot = ChainSnapshot::new(&f.chain).unwrap();
        f.ledger
            .add_if_involving_me(tx, None, true, &f.vault, &snapshot, &f.store)
            .unwrap();
        assert!(f.ledger.get(&funding).unwrap().is_spent(0));
        assert!(f.reconcile(false).is_consistent());
    }

    #[test]
    fn check_only_leaves_ledger_alone() {
        let mut f = Fixture::new();
        let funding = f.confirm(&receive(&f.mine, &[5 * COIN], 1));
        f.ledger.set_spent(&OutPoint::new(funding, 0), true, &f.store).unwrap();

        let report = f.reconcile(true);
        assert_eq!(report.mismatch_count(), 1);
        assert!(!report.repaired);
        assert!(f.ledger.get(&funding).unwrap().is_spent(0));

        let err = ConsistencyAuditor::new(&f.chain)
            .verify(&mut f.ledger, &f.vault, &f.store)
            .unwrap_err();
        assert_eq!(err, WalletError::ReorgInconsistency {
            mismatches: 1,
            value: 5 * COIN,
        });
    }

    #[test]
    fn unindexed_and_foreign_outputs_are_skipped() {
        let mut f = Fixture::new();
        let mut mixed = receive(&f.mine, &[COIN], 1);
        mixed.outputs.push(TxOutput::new(COIN, foreign_script(3)));
        let mixed_id = f.confirm(&mixed);
        f.chain.index_entry_mut(&mixed_id).unwrap().spent_by[1] = Some(Hash256([9; 32]));

        // In the ledger but never indexed: the auditor has nothing to compare.
        let pending = receive(&f.mine, &[COIN], 2);
        let snapshot = ChainSnapshot::new(&f.chain).unwrap();
        f.ledger
            .add_if_involving_me(pending.clone(), None, true, &f.vault, &snapshot, &f.store)
            .unwrap();
        f.ledger.set_spent(&OutPoint::new(pending.txid().unwrap(), 0), true, &f.store).unwrap();

        assert!(f.reconcile(false).is_consistent());
    }
}
