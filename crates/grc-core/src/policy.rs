//! Relay fee policy.

use crate::constants::{CENT, MAX_MONEY, MAX_STANDARD_TX_SIZE, MIN_TX_FEE};
use crate::money::{Amount, money_range};
use crate::types::Transaction;

/// `rate` charged per started kilobyte of `bytes`.
pub fn per_kb_fee(rate: Amount, bytes: usize) -> Amount {
    rate.saturating_mul(1 + bytes as i64 / 1000)
}

/// Minimum fee the network accepts for `tx` serialized at `bytes`.
///
/// One [`MIN_TX_FEE`] per started kilobyte, plus one more if any spendable
/// output is below [`CENT`]. Clamped to [`MAX_MONEY`].
pub fn min_fee(tx: &Transaction, bytes: usize) -> Amount {
    let mut fee = per_kb_fee(MIN_TX_FEE, bytes);
    let has_dust = tx
        .outputs
        .iter()
        .any(|o| o.value < CENT && !o.script_pubkey.is_unspendable() && !o.is_empty());
    if has_dust {
        fee = fee.saturating_add(MIN_TX_FEE);
    }
    if !money_range(fee) { MAX_MONEY } else { fee }
}

/// Fee a wallet paying `rate` per kilobyte must attach: the larger of its
/// own rate and the network minimum.
pub fn required_fee(rate: Amount, tx: &Transaction, bytes: usize) -> Amount {
    per_kb_fee(rate, bytes).max(min_fee(tx, bytes))
}

pub fn is_standard_size(bytes: usize) -> bool {
    bytes < MAX_STANDARD_TX_SIZE
}
