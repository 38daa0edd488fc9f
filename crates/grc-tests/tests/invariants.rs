//! Ledger invariants under random receive/send/mine sequences.

use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use grc_core::constants::{CENT, COIN};
use grc_core::money::Amount;
use grc_core::types::OutPoint;
use grc_tests::helpers::*;
use grc_wallet::builder::{Payload, Recipient};
use grc_wallet::error::WalletError;

#[derive(Clone, Debug)]
enum Step {
    Receive(Vec<Amount>),
    Send(Amount),
    Mine,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        prop::collection::vec(CENT..40 * COIN, 1..4).prop_map(Step::Receive),
        (CENT..60 * COIN).prop_map(Step::Send),
        Just(Step::Mine),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn balances_stay_consistent(steps in prop::collection::vec(step(), 1..14), seed in any::<u64>()) {
        let f = Fixture::in_memory();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut received: Amount = 0;
        let mut sent: Amount = 0;
        let mut nonce = 0u32;

        for step in steps {
            match step {
                Step::Receive(values) => {
                    nonce += 1;
                    received += values.iter().sum::<Amount>();
                    f.receive(&values, nonce);
                }
                Step::Send(amount) => {
                    let recipient = Recipient { script_pubkey: stranger(5), amount };
                    match f.wallet.send(&[recipient], Payload::None, &mut rng) {
                        Ok(_) => sent += amount,
                        Err(WalletError::InsufficientFunds { .. }) => {}
                        Err(e) => return Err(TestCaseError::fail(format!("send failed: {e}"))),
                    }
                }
                Step::Mine => {
                    f.mine_mempool();
                }
            }
            let balances = f.wallet.balances().unwrap();
            prop_assert!(balances.confirmed >= 0);
            prop_assert!(balances.unconfirmed >= 0);
            prop_assert!(balances.confirmed <= received - sent);
        }

        f.mine_mempool();
        let balances = f.wallet.balances().unwrap();
        let unspent: Amount = unspent_outputs(&f.wallet).values().sum();
        prop_assert_eq!(balances.confirmed, unspent);
        prop_assert_eq!(balances.unconfirmed, 0);
        prop_assert!(f.wallet.verify_consistency().is_ok());

        // Every recorded spend marks the parent output it consumed.
        for wtx in f.wallet.history() {
            for input in &wtx.tx.inputs {
                if let Some(parent) = f.wallet.transaction(&input.previous_output.txid) {
                    prop_assert!(parent.is_spent(input.previous_output.index as usize));
                }
            }
        }
    }
}

#[test]
fn reloaded_ledger_matches_live_one() {
    let f = Fixture::in_memory();
    let mut rng = StdRng::seed_from_u64(77);
    for nonce in 1..=5u32 {
        f.receive(&[nonce as Amount * COIN, CENT * 3], nonce);
    }
    for amount in [2 * COIN, 4 * COIN, COIN / 2] {
        let recipient = Recipient { script_pubkey: stranger(6), amount };
        f.wallet.send(&[recipient], Payload::None, &mut rng).unwrap();
    }
    f.mine_mempool();

    let reopened = f.reopen();
    let live: Vec<_> = f.wallet.history().into_iter().map(|w| (w.txid, w.order_pos, w.spent.clone())).collect();
    let loaded: Vec<_> = reopened.history().into_iter().map(|w| (w.txid, w.order_pos, w.spent.clone())).collect();
    assert_eq!(live, loaded);
    assert_eq!(reopened.balances().unwrap(), f.wallet.balances().unwrap());
}

#[test]
fn index_drift_is_reported_then_repaired_once() {
    let f = Fixture::in_memory();
    let a = f.receive(&[3 * COIN, 2 * COIN], 1);
    let b = f.receive(&[7 * COIN], 2);
    {
        let mut chain = f.chain.write();
        chain.set_index_spender(&OutPoint::new(a, 1), Some(b));
        chain.set_index_spender(&OutPoint::new(b, 0), Some(a));
    }

    let report = f.wallet.reconcile(true).unwrap();
    assert_eq!(report.mismatch_count(), 2);
    assert_eq!(report.value, 9 * COIN);
    assert!(!report.repaired);

    let repaired = f.wallet.reconcile(false).unwrap();
    assert_eq!(repaired.mismatch_count(), 2);
    assert!(f.wallet.reconcile(false).unwrap().is_consistent());
    assert_eq!(f.wallet.balances().unwrap().confirmed, 3 * COIN);
}
