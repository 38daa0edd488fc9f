//! Protocol constants. All monetary values in base units (1 GRC = 10^8 units).

use crate::money::Amount;

pub const COIN: Amount = 100_000_000;

/// Dust threshold. Change below this is not worth an output of its own.
pub const CENT: Amount = 1_000_000;

/// Upper bound on any single amount or sum of amounts.
pub const MAX_MONEY: Amount = 2_000_000_000 * COIN;

/// Minimum fee per started kilobyte, and the default wallet fee.
pub const MIN_TX_FEE: Amount = 100_000;

/// Burned with every transaction that carries a user message payload.
pub const STANDARD_BURN_AMOUNT: Amount = COIN / 2;

/// Serialized transactions at or above this size are not relayed.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Confirmations before a coinbase output may be spent.
pub const COINBASE_MATURITY: u64 = 100;

/// Extra margin the wallet adds on top of [`COINBASE_MATURITY`] before it
/// treats coinbase and coinstake outputs as mature.
pub const MATURITY_MARGIN: u64 = 10;

/// Depth at which coinbase and coinstake outputs become spendable and stakeable.
pub const STAKE_MATURITY: u64 = COINBASE_MATURITY + MATURITY_MARGIN;

/// Minimum age of a transaction, in seconds, before its outputs may stake.
pub const STAKE_MIN_AGE: u64 = 16 * 60 * 60;

/// Lock times below this value are block heights, at or above it Unix times.
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// Default number of pre-generated keys held in the key pool.
pub const DEFAULT_KEYPOOL_SIZE: usize = 100;

/// Supporting transactions are copied until an ancestor has this many confirmations.
pub const SUPPORTING_COPY_DEPTH: u64 = 3;

/// Blocks older than the first key birth time minus this many seconds are skipped on rescan.
pub const RESCAN_TIME_WINDOW: u64 = 2 * 60 * 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stake_maturity_exceeds_coinbase_maturity() {
        assert_eq!(STAKE_MATURITY, 110);
    }

    #[test]
    fn cent_is_hundredth_of_coin() {
        assert_eq!(CENT * 100, COIN);
    }

    #[test]
    fn max_money_fits_in_i64() {
        assert!(MAX_MONEY > 0);
        assert!(MAX_MONEY.checked_mul(4).is_some());
    }
}
