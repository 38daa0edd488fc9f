//! Coin selection.
//!
//! Three policies pick inputs for a target value:
//!
//! - **min-conf**: shuffle, take an exact single match if one exists,
//!   otherwise compare the smallest coin above the target against a
//!   stochastic subset-sum over the coins below it;
//! - **smallest-first**: ascending by value until the target is met, used
//!   for transactions carrying a contract;
//! - **staking**: every mature output the wallet could stake alone after
//!   the reserve balance is set aside.
//!
//! General spends retry with looser confirmation requirements: coins from
//! others need 10 confirmations on the first attempt, then 1, and finally
//! our own unconfirmed change becomes eligible.
//!
//! Randomness is always injected so callers and tests control it.

use std::collections::BTreeSet;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use grc_core::constants::{CENT, STAKE_MIN_AGE};
use grc_core::money::{Amount, checked_add, money_range};
use grc_core::script::{Destination, Script};
use grc_core::types::OutPoint;

use crate::error::WalletError;
use crate::ledger::{ChainSnapshot, TransactionLedger};
use crate::vault::{IsMine, KeyVault};

/// Default number of subset-sum trials.
pub const DEFAULT_SELECTION_ITERATIONS: usize = 1000;

/// Confirmation requirements tried in order: (own coins, others' coins).
const CONFIRMATION_ESCALATION: [(u64, u64); 3] = [(1, 10), (1, 1), (0, 1)];

/// A spendable output found by coin enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: Script,
    /// Confirmations of the owning transaction.
    pub depth: u64,
    /// The owning transaction was created by this wallet.
    pub from_me: bool,
    /// Timestamp of the owning transaction.
    pub tx_time: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub coins: Vec<CandidateOutput>,
    pub total: Amount,
}

impl Selection {
    fn push(&mut self, coin: CandidateOutput) {
        self.total += coin.value;
        self.coins.push(coin);
    }

    pub fn outpoints(&self) -> BTreeSet<OutPoint> {
        self.coins.iter().map(|c| c.outpoint).collect()
    }
}

/// Caller constraints on a spend.
#[derive(Clone, Debug, Default)]
pub struct CoinControl {
    /// When non-empty, exactly these outputs are spent.
    pub selected: BTreeSet<OutPoint>,
    /// Fixed destination for change.
    pub change_destination: Option<Destination>,
    /// Send change back to the first input's address instead of a fresh key.
    pub return_change_to_input: bool,
}

impl CoinControl {
    pub fn has_selected(&self) -> bool {
        !self.selected.is_empty()
    }

    pub fn is_selected(&self, outpoint: &OutPoint) -> bool {
        self.selected.contains(outpoint)
    }
}

/// Why the staking pass produced nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotStakingReason {
    NoCoins,
    EntireBalanceReserved,
    NoMatureCoins,
    NoUtxosAvailableDueToReserve,
}

impl NotStakingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotStakingReason::NoCoins => "no coins",
            NotStakingReason::EntireBalanceReserved => "entire balance reserved",
            NotStakingReason::NoMatureCoins => "no mature coins",
            NotStakingReason::NoUtxosAvailableDueToReserve => "no utxos available due to reserve balance",
        }
    }
}

/// Outcome of the staking pass.
#[derive(Clone, Debug, Default)]
pub struct StakingCoins {
    /// Eligible balance, including unconfirmed self-originated outputs.
    pub balance: Amount,
    pub coins: Vec<CandidateOutput>,
    pub reason: Option<NotStakingReason>,
}

/// Selection policy parameters.
#[derive(Clone, Debug)]
pub struct CoinSelector {
    /// Change below this is not worth avoiding.
    pub cent: Amount,
    pub iterations: usize,
    /// Outputs worth less are never selected.
    pub min_input_value: Amount,
    pub stake_min_age: u64,
    /// Balance kept out of staking.
    pub reserve_balance: Amount,
}

impl Default for CoinSelector {
    fn default() -> Self {
        Self {
            cent: CENT,
            iterations: DEFAULT_SELECTION_ITERATIONS,
            min_input_value: 0,
            stake_min_age: STAKE_MIN_AGE,
            reserve_balance: 0,
        }
    }
}

impl CoinSelector {
    /// Unspent, spendable outputs of final, trusted, mature records.
    ///
    /// With a coin control selection only the selected outputs qualify.
    pub fn available_coins(
        &self,
        ledger: &TransactionLedger,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
        coin_control: Option<&CoinControl>,
    ) -> Result<Vec<CandidateOutput>, WalletError> {
        let restrict = coin_control.filter(|cc| cc.has_selected());
        let mut coins = Vec::new();
        for wtx in ledger.records() {
            if !snapshot.is_final(&wtx.tx) {
                continue;
            }
            let depth = snapshot.depth(wtx)?;
            if wtx.blocks_to_maturity(depth) > 0 {
                continue;
            }
            if !ledger.is_trusted(wtx, depth, vault, snapshot)? {
                continue;
            }
            for (index, out) in wtx.tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(wtx.txid, index as u32);
                if wtx.is_spent(index)
                    || out.value < self.min_input_value
                    || vault.classify_script(&out.script_pubkey) != IsMine::Spendable
                    || restrict.is_some_and(|cc| !cc.is_selected(&outpoint))
                {
                    continue;
                }
                coins.push(CandidateOutput {
                    outpoint,
                    value: out.value,
                    script_pubkey: out.script_pubkey.clone(),
                    depth,
                    from_me: wtx.from_me,
                    tx_time: wtx.tx.time,
                });
            }
        }
        Ok(coins)
    }

    fn eligible(coin: &CandidateOutput, spend_time: u64, conf_mine: u64, conf_theirs: u64) -> bool {
        let required = if coin.from_me { conf_mine } else { conf_theirs };
        coin.depth >= required && coin.tx_time <= spend_time
    }

    /// Min-conf policy. `None` if the eligible coins cannot reach `target`.
    pub fn select_min_conf<R: Rng + ?Sized>(
        &self,
        target: Amount,
        spend_time: u64,
        conf_mine: u64,
        conf_theirs: u64,
        coins: &[CandidateOutput],
        rng: &mut R,
    ) -> Option<Selection> {
        let mut shuffled: Vec<&CandidateOutput> = coins.iter().collect();
        shuffled.shuffle(rng);

        let mut lower: Vec<&CandidateOutput> = Vec::new();
        let mut total_lower: Amount = 0;
        let mut lowest_larger: Option<&CandidateOutput> = None;

        for coin in shuffled {
            if !Self::eligible(coin, spend_time, conf_mine, conf_theirs) {
                continue;
            }
            if coin.value == target {
                let mut selection = Selection::default();
                selection.push(coin.clone());
                return Some(selection);
            } else if coin.value < target + self.cent {
                lower.push(coin);
                total_lower += coin.value;
            } else if lowest_larger.is_none_or(|best| coin.value < best.value) {
                lowest_larger = Some(coin);
            }
        }

        if total_lower == target {
            let mut selection = Selection::default();
            for coin in lower {
                selection.push(coin.clone());
            }
            return Some(selection);
        }

        if total_lower < target {
            let coin = lowest_larger?;
            let mut selection = Selection::default();
            selection.push(coin.clone());
            return Some(selection);
        }

        lower.sort_by(|a, b| b.value.cmp(&a.value));
        let values: Vec<Amount> = lower.iter().map(|c| c.value).collect();
        let (mut included, mut best) = approximate_best_subset(&values, total_lower, target, self.iterations, rng);
        if best != target && total_lower >= target + self.cent {
            (included, best) = approximate_best_subset(&values, total_lower, target + self.cent, self.iterations, rng);
        }

        let mut selection = Selection::default();
        match lowest_larger {
            Some(coin) if (best != target && best < target + self.cent) || coin.value <= best => {
                selection.push(coin.clone());
            }
            _ => {
                for (coin, _) in lower.into_iter().zip(&included).filter(|(_, inc)| **inc) {
                    selection.push(coin.clone());
                }
                trace!(best, target, inputs = selection.coins.len(), "best subset");
            }
        }
        Some(selection)
    }

    /// Smallest-first policy. `None` if the eligible coins cannot reach `target`.
    pub fn select_smallest(
        &self,
        target: Amount,
        spend_time: u64,
        conf_mine: u64,
        conf_theirs: u64,
        coins: &[CandidateOutput],
    ) -> Option<Selection> {
        let mut sorted: Vec<&CandidateOutput> = coins.iter().collect();
        sorted.sort_by_key(|c| c.value);

        let mut selection = Selection::default();
        for coin in sorted {
            if !Self::eligible(coin, spend_time, conf_mine, conf_theirs) {
                continue;
            }
            selection.push(coin.clone());
            if selection.total >= target {
                return Some(selection);
            }
        }
        None
    }

    /// Pick inputs for `target` from `coins`.
    ///
    /// A coin control selection is taken whole. Otherwise the contract flag
    /// chooses smallest-first over min-conf, and both escalate through the
    /// confirmation requirements.
    pub fn select_coins<R: Rng + ?Sized>(
        &self,
        target: Amount,
        spend_time: u64,
        coins: &[CandidateOutput],
        coin_control: Option<&CoinControl>,
        contract: bool,
        rng: &mut R,
    ) -> Result<Selection, WalletError> {
        let available = coins
            .iter()
            .try_fold(0, |acc, c| checked_add(acc, c.value))
            .ok_or_else(|| WalletError::InvalidAmount("candidate total out of range".into()))?;

        if coin_control.is_some_and(CoinControl::has_selected) {
            if available < target {
                return Err(WalletError::InsufficientFunds {
                    have: available,
                    need: target,
                });
            }
            let mut selection = Selection::default();
            for coin in coins {
                selection.push(coin.clone());
            }
            return Ok(selection);
        }

        for (conf_mine, conf_theirs) in CONFIRMATION_ESCALATION {
            let found = if contract {
                self.select_smallest(target, spend_time, conf_mine, conf_theirs, coins)
            } else {
                self.select_min_conf(target, spend_time, conf_mine, conf_theirs, coins, rng)
            };
            if let Some(selection) = found {
                debug!(target, total = selection.total, inputs = selection.coins.len(), conf_mine, conf_theirs, contract, "coins selected");
                return Ok(selection);
            }
        }
        Err(WalletError::InsufficientFunds {
            have: available,
            need: target,
        })
    }

    /// Mature outputs eligible to stake at `spend_time`, and the balance.
    ///
    /// The balance counts every unspent owned output of a confirmed record,
    /// or of an unconfirmed one we sent whose inputs are confirmed (or that
    /// is a coinstake). Candidates additionally need their transaction to be
    /// at least `stake_min_age` old and, for coinbase and coinstake, full
    /// stake maturity.
    pub fn available_coins_for_staking(
        &self,
        ledger: &TransactionLedger,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
        spend_time: u64,
    ) -> Result<(Vec<CandidateOutput>, Amount), WalletError> {
        let mut coins = Vec::new();
        let mut balance: Amount = 0;
        let mut records = 0usize;
        let mut with_outputs = 0usize;

        for wtx in ledger.records() {
            records += 1;
            let depth = snapshot.depth(wtx)?;
            let counted = depth > 0
                || (wtx.from_me && (wtx.tx.is_coinstake() || ledger.dependencies_confirmed(wtx, snapshot)?));
            if !counted {
                continue;
            }

            let mut possible = Vec::new();
            for (index, out) in wtx.tx.outputs.iter().enumerate() {
                if !wtx.is_spent(index) && out.value > 0 && vault.classify_script(&out.script_pubkey) != IsMine::No {
                    balance = checked_add(balance, out.value)
                        .ok_or_else(|| WalletError::InvalidAmount("staking balance out of range".into()))?;
                    possible.push((index, out));
                }
            }
            if possible.is_empty() {
                continue;
            }
            if wtx.tx.time.saturating_add(self.stake_min_age) > spend_time {
                continue;
            }
            if wtx.is_coinbase_like() {
                if wtx.blocks_to_maturity(depth) > 0 {
                    continue;
                }
            } else if depth < 1 {
                continue;
            }

            let before = coins.len();
            for (index, out) in possible {
                if out.value >= self.min_input_value {
                    coins.push(CandidateOutput {
                        outpoint: OutPoint::new(wtx.txid, index as u32),
                        value: out.value,
                        script_pubkey: out.script_pubkey.clone(),
                        depth,
                        from_me: wtx.from_me,
                        tx_time: wtx.tx.time,
                    });
                }
            }
            if coins.len() > before {
                with_outputs += 1;
            }
        }
        debug!(records, with_outputs, balance, "staking candidates");
        Ok((coins, balance))
    }

    /// Outputs that could each be staked alone once the reserve is set
    /// aside, shuffled. The reason is set when there are none.
    pub fn select_coins_for_staking<R: Rng + ?Sized>(
        &self,
        ledger: &TransactionLedger,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
        spend_time: u64,
        rng: &mut R,
    ) -> Result<StakingCoins, WalletError> {
        let (candidates, balance) = self.available_coins_for_staking(ledger, vault, snapshot, spend_time)?;
        let mut result = StakingCoins {
            balance,
            ..StakingCoins::default()
        };

        if balance <= 0 {
            result.reason = Some(NotStakingReason::NoCoins);
            return Ok(result);
        }
        let considered = Some(self.reserve_balance)
            .filter(|reserve| money_range(*reserve))
            .and_then(|reserve| balance.checked_sub(reserve))
            .ok_or_else(|| WalletError::InvalidAmount(format!("reserve balance {} out of range", self.reserve_balance)))?;
        if considered <= 0 {
            result.reason = Some(NotStakingReason::EntireBalanceReserved);
            return Ok(result);
        }
        if candidates.is_empty() {
            result.reason = Some(NotStakingReason::NoMatureCoins);
            return Ok(result);
        }

        result.coins = candidates.into_iter().filter(|c| c.value <= considered).collect();
        if result.coins.is_empty() {
            result.reason = Some(NotStakingReason::NoUtxosAvailableDueToReserve);
            return Ok(result);
        }
        result.coins.shuffle(rng);
        debug!(considered, coins = result.coins.len(), "staking coins selected");
        Ok(result)
    }
}

/// Stochastic subset-sum over `values` (sorted descending by the caller).
///
/// Starts from "take everything" and runs up to `iterations` trials, each a
/// random inclusion pass followed by a pass over the remaining values. Any
/// total that reaches `target` is recorded if it is the smallest so far and
/// the last value is dropped again to keep searching. Stops early on an
/// exact hit. Returns the inclusion flags and their total.
pub fn approximate_best_subset<R: Rng + ?Sized>(
    values: &[Amount],
    total_lower: Amount,
    target: Amount,
    iterations: usize,
    rng: &mut R,
) -> (Vec<bool>, Amount) {
    let mut best_flags = vec![true; values.len()];
    let mut best = total_lower;

    let mut rep = 0;
    while rep < iterations && best != target {
        let mut included = vec![false; values.len()];
        let mut total: Amount = 0;
        let mut reached = false;
        for pass in 0..2 {
            if reached {
                break;
            }
            for (i, value) in values.iter().enumerate() {
                let take = if pass == 0 { rng.gen_bool(0.5) } else { !included[i] };
                if !take {
                    continue;
                }
                total += value;
                included[i] = true;
                if total >= target {
                    reached = true;
                    if total < best {
                        best = total;
                        best_flags.clone_from(&included);
                    }
                    total -= value;
                    included[i] = false;
                }
            }
        }
        rep += 1;
    }
    (best_flags, best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryWalletStore;
    use crate::test_support::*;
    use crate::wallet_tx::WalletTx;
    use grc_core::constants::STAKE_MATURITY;
    use grc_core::types::{Hash256, Transaction, TxOutput};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn coin(n: u8, value: Amount, depth: u64, from_me: bool) -> CandidateOutput {
        CandidateOutput {
            outpoint: OutPoint::new(Hash256([n; 32]), 0),
            value,
            script_pubkey: foreign_script(n),
            depth,
            from_me,
            tx_time: 0,
        }
    }

    fn unit_selector() -> CoinSelector {
        CoinSelector {
            cent: 1,
            ..CoinSelector::default()
        }
    }

    fn values(selection: &Selection) -> Vec<Amount> {
        let mut v: Vec<Amount> = selection.coins.iter().map(|c| c.value).collect();
        v.sort();
        v
    }

    #[test]
    fn subset_sum_finds_exact_pair() {
        let coins = vec![coin(1, 30, 20, false), coin(2, 50, 20, false), coin(3, 80, 20, false)];
        let mut rng = StdRng::seed_from_u64(7);
        let selection = unit_selector()
            .select_coins(110, u64::MAX, &coins, None, false, &mut rng)
            .unwrap();
        assert_eq!(values(&selection), vec![30, 80]);
        assert_eq!(selection.total, 110);
    }

    #[test]
    fn falls_back_to_lowest_larger_coin() {
        let coins = vec![coin(1, 30, 20, false), coin(2, 50, 20, false), coin(3, 100, 20, false)];
        let mut rng = StdRng::seed_from_u64(7);
        let selection = unit_selector()
            .select_coins(90, u64::MAX, &coins, None, false, &mut rng)
            .unwrap();
        assert_eq!(values(&selection), vec![100]);
        assert_eq!(selection.total - 90, 10);
    }

    #[test]
    fn exact_single_coin_wins() {
        let coins = vec![coin(1, 10, 20, false), coin(2, 40, 20, false), coin(3, 45, 20, false)];
        let mut rng = StdRng::seed_from_u64(1);
        let selection = unit_selector().select_min_conf(40, u64::MAX, 1, 1, &coins, &mut rng).unwrap();
        assert_eq!(values(&selection), vec![40]);
    }

    #[test]
    fn small_coins_summing_to_target_are_all_taken() {
        let coins = vec![coin(1, 10, 20, false), coin(2, 20, 20, false), coin(3, 500, 20, false)];
        let mut rng = StdRng::seed_from_u64(1);
        let selection = unit_selector().select_min_conf(30, u64::MAX, 1, 1, &coins, &mut rng).unwrap();
        assert_eq!(values(&selection), vec![10, 20]);
    }

    #[test]
    fn larger_coin_preferred_when_no_closer_subset() {
        // Subsets of {40, 30} reach 70 at best; 60 is closer.
        let coins = vec![coin(1, 40, 20, false), coin(2, 30, 20, false), coin(3, 60, 20, false)];
        let mut rng = StdRng::seed_from_u64(3);
        let selection = unit_selector().select_min_conf(55, u64::MAX, 1, 1, &coins, &mut rng).unwrap();
        assert_eq!(values(&selection), vec![60]);
    }

    #[test]
    fn subset_preferred_when_closer_than_larger_coin() {
        let coins = vec![coin(1, 40, 20, false), coin(2, 30, 20, false), coin(3, 200, 20, false)];
        let mut rng = StdRng::seed_from_u64(3);
        let selection = unit_selector().select_min_conf(65, u64::MAX, 1, 1, &coins, &mut rng).unwrap();
        assert_eq!(values(&selection), vec![30, 40]);
    }

    #[test]
    fn inexact_subset_within_cent_still_loses_to_larger_coin() {
        // Best subset is 101: not exact and below target + cent (105), so the
        // larger coin wins even though it overshoots more.
        let selector = CoinSelector {
            cent: 5,
            ..CoinSelector::default()
        };
        let coins = vec![coin(1, 51, 20, false), coin(2, 50, 20, false), coin(3, 130, 20, false)];
        let mut rng = StdRng::seed_from_u64(11);
        let selection = selector.select_min_conf(100, u64::MAX, 1, 1, &coins, &mut rng).unwrap();
        assert_eq!(values(&selection), vec![130]);
    }

    #[test]
    fn confirmation_requirements_escalate() {
        let coins = vec![coin(1, 100, 3, false), coin(2, 100, 0, true)];
        let mut rng = StdRng::seed_from_u64(5);
        let selector = unit_selector();
        // Others' coins need 10 confirmations first, so nothing qualifies.
        assert!(selector.select_min_conf(100, u64::MAX, 1, 10, &coins, &mut rng).is_none());
        let selection = selector.select_coins(100, u64::MAX, &coins, None, false, &mut rng).unwrap();
        assert_eq!(selection.coins[0].outpoint, coins[0].outpoint);

        // Only our own unconfirmed change is left: the last step allows it.
        let selection = selector.select_coins(100, u64::MAX, &coins[1..], None, false, &mut rng).unwrap();
        assert_eq!(selection.coins[0].outpoint, coins[1].outpoint);
    }

    #[test]
    fn future_coins_are_skipped() {
        let mut late = coin(1, 100, 20, false);
        late.tx_time = 1_000;
        let mut rng = StdRng::seed_from_u64(5);
        let err = unit_selector().select_coins(50, 999, &[late], None, false, &mut rng).unwrap_err();
        assert_eq!(err, WalletError::InsufficientFunds { have: 100, need: 50 });
    }

    #[test]
    fn smallest_first_for_contracts() {
        let coins = vec![coin(1, 80, 20, false), coin(2, 5, 20, false), coin(3, 20, 20, false), coin(4, 30, 20, false)];
        let mut rng = StdRng::seed_from_u64(5);
        let selection = unit_selector().select_coins(40, u64::MAX, &coins, None, true, &mut rng).unwrap();
        assert_eq!(values(&selection), vec![5, 20, 30]);
    }

    #[test]
    fn coin_control_takes_everything_selected() {
        let coins = vec![coin(1, 10, 0, false), coin(2, 15, 0, false)];
        let control = CoinControl {
            selected: coins.iter().map(|c| c.outpoint).collect(),
            ..CoinControl::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let selection = unit_selector()
            .select_coins(12, u64::MAX, &coins, Some(&control), false, &mut rng)
            .unwrap();
        assert_eq!(selection.total, 25);

        let err = unit_selector()
            .select_coins(30, u64::MAX, &coins, Some(&control), false, &mut rng)
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { have: 25, need: 30 }));
    }

    #[test]
    fn best_subset_stops_on_exact_hit() {
        let mut rng = StdRng::seed_from_u64(9);
        let (flags, best) = approximate_best_subset(&[8, 5, 3, 2], 18, 10, 1000, &mut rng);
        assert_eq!(best, 10);
        let sum: Amount = [8, 5, 3, 2].iter().zip(&flags).filter(|(_, f)| **f).map(|(v, _)| *v).sum();
        assert_eq!(sum, 10);
    }

    #[test]
    fn best_subset_without_trials_is_everything() {
        let mut rng = StdRng::seed_from_u64(9);
        let (flags, best) = approximate_best_subset(&[8, 5], 13, 10, 0, &mut rng);
        assert_eq!(flags, vec![true, true]);
        assert_eq!(best, 13);
    }

    // --- ledger-backed enumeration ---

    struct Wallet {
        chain: MockChain,
        store: MemoryWalletStore,
        vault: KeyVault,
        mine: Script,
        ledger: TransactionLedger,
    }

    impl Wallet {
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

        fn add(&mut self, tx: &Transaction, mined: bool, from_me: bool) -> Hash256 {
            let block = mined.then(|| self.chain.mine(vec![tx.clone()]));
            let snapshot = ChainSnapshot::new(&self.chain).unwrap();
            let mut wtx = WalletTx::new(tx.clone()).unwrap();
            if let Some(block) = &block {
                wtx.set_merkle_branch(block).unwrap();
            }
            wtx.from_me = from_me;
            self.ledger.add_or_update(wtx, &self.vault, &snapshot, &self.store).unwrap();
            tx.txid().unwrap()
        }

        fn staking(&self, selector: &CoinSelector, spend_time: u64) -> StakingCoins {
            let snapshot = ChainSnapshot::new(&self.chain).unwrap();
            let mut rng = StdRng::seed_from_u64(2);
            selector
                .select_coins_for_staking(&self.ledger, &self.vault, &snapshot, spend_time, &mut rng)
                .unwrap()
        }
    }

    #[test]
    fn available_coins_filters_records() {
        let mut w = Wallet::new();
        let confirmed = w.add(&receive(&w.mine.clone(), &[40, 2], 1), true, false);
        w.add(&receive(&w.mine.clone(), &[7], 2), false, false);
        w.add(&coinbase(&w.mine.clone(), 500, 3), true, false);
        w.add(&receive(&foreign_script(4), &[1000], 4), true, false);

        let selector = CoinSelector {
            min_input_value: 5,
            ..CoinSelector::default()
        };
        let snapshot = ChainSnapshot::new(&w.chain).unwrap();
        let coins = selector.available_coins(&w.ledger, &w.vault, &snapshot, None).unwrap();
        // Untrusted incoming, immature coinbase, dust and foreign outputs drop out.
        assert_eq!(coins.len(), 1);
        assert_eq!(coins[0].outpoint, OutPoint::new(confirmed, 0));
        assert_eq!(coins[0].depth, 3);

        let control = CoinControl {
            selected: BTreeSet::from([OutPoint::new(confirmed, 1)]),
            ..CoinControl::default()
        };
        let restricted = CoinSelector::default()
            .available_coins(&w.ledger, &w.vault, &snapshot, Some(&control))
            .unwrap();
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted[0].value, 2);
    }

    #[test]
    fn staking_entire_balance_reserved() {
        let mut w = Wallet::new();
        w.add(&receive(&w.mine.clone(), &[100], 1), true, false);
        let selector = CoinSelector {
            reserve_balance: 150,
            ..CoinSelector::default()
        };
        let result = w.staking(&selector, u64::MAX);
        assert!(result.coins.is_empty());
        assert_eq!(result.reason, Some(NotStakingReason::EntireBalanceReserved));
        assert_eq!(result.balance, 100);
    }

    #[test]
    fn negative_reserve_is_an_error() {
        let mut w = Wallet::new();
        w.add(&receive(&w.mine.clone(), &[100], 1), true, false);
        let selector = CoinSelector {
            reserve_balance: -50,
            ..CoinSelector::default()
        };
        let snapshot = ChainSnapshot::new(&w.chain).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let err = selector
            .select_coins_for_staking(&w.ledger, &w.vault, &snapshot, u64::MAX, &mut rng)
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
    }

    #[test]
    fn staking_reasons_in_order() {
        let w = Wallet::new();
        assert_eq!(w.staking(&CoinSelector::default(), u64::MAX).reason, Some(NotStakingReason::NoCoins));

        let mut w = Wallet::new();
        w.add(&receive(&w.mine.clone(), &[100], 1), true, false);
        // Too young to stake.
        let result = w.staking(&CoinSelector::default(), GENESIS_TIME);
        assert_eq!(result.reason, Some(NotStakingReason::NoMatureCoins));
        assert_eq!(result.balance, 100);

        w.add(&receive(&w.mine.clone(), &[30], 2), true, false);
        let selector = CoinSelector {
            reserve_balance: 40,
            stake_min_age: 0,
            ..CoinSelector::default()
        };
        // 130 - 40 = 90: the 30 output qualifies, the 100 does not.
        let result = w.staking(&selector, u64::MAX);
        assert_eq!(result.reason, None);
        assert_eq!(result.coins.iter().map(|c| c.value).collect::<Vec<_>>(), vec![30]);

        let selector = CoinSelector {
            reserve_balance: 110,
            stake_min_age: 0,
            ..CoinSelector::default()
        };
        assert_eq!(
            w.staking(&selector, u64::MAX).reason,
            Some(NotStakingReason::NoUtxosAvailableDueToReserve)
        );
    }

    #[test]
    fn staking_requires_full_maturity_for_rewards() {
        let mut w = Wallet::new();
        w.add(&coinbase(&w.mine.clone(), 500, 1), true, false);
        let selector = CoinSelector {
            stake_min_age: 0,
            ..CoinSelector::default()
        };
        let result = w.staking(&selector, u64::MAX);
        assert_eq!(result.reason, Some(NotStakingReason::NoMatureCoins));

        w.chain.advance(STAKE_MATURITY);
        let result = w.staking(&selector, u64::MAX);
        assert_eq!(result.coins.len(), 1);
        assert_eq!(result.balance, 500);
    }

    #[test]
    fn unconfirmed_own_spend_counts_toward_staking_balance() {
        let mut w = Wallet::new();
        let funding = w.add(&receive(&w.mine.clone(), &[100], 1), true, false);
        let own = spend(&[OutPoint::new(funding, 0)], vec![TxOutput::new(90, w.mine.clone())]);
        w.add(&own, false, true);
        let selector = CoinSelector {
            stake_min_age: 0,
            ..CoinSelector::default()
        };
        let result = w.staking(&selector, u64::MAX);
        // Counted in the balance but not stakeable until it confirms.
        assert_eq!(result.balance, 90);
        assert_eq!(result.reason, Some(NotStakingReason::NoMatureCoins));
    }
}
