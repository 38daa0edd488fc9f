//! Money values and range-checked arithmetic.
//!
//! An [`Amount`] is a signed count of base units. Negative values only ever
//! appear as intermediate results (e.g. change before a fee shortfall is
//! detected); anything outside `0..=MAX_MONEY` that reaches a sum is an error.

use crate::constants::{COIN, MAX_MONEY};

/// Signed 64-bit count of base units.
pub type Amount = i64;

/// True if `value` is a valid amount: `0 <= value <= MAX_MONEY`.
pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Add two amounts, returning `None` if either operand or the result leaves
/// the valid money range.
pub fn checked_add(a: Amount, b: Amount) -> Option<Amount> {
    if !money_range(a) || !money_range(b) {
        return None;
    }
    a.checked_add(b).filter(|sum| money_range(*sum))
}

/// Sum an iterator of amounts with [`checked_add`] semantics.
pub fn checked_sum<I: IntoIterator<Item = Amount>>(values: I) -> Option<Amount> {
    values.into_iter().try_fold(0, checked_add)
}

/// Format an amount as a decimal coin string with eight fractional digits.
pub fn format_money(value: Amount) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let coin = COIN as u64;
    format!("{sign}{}.{:08}", abs / coin, abs % coin)
}

/// Parse a decimal coin string (e.g. `"12.5"`) into base units.
///
/// Rejects negative values, more than eight fractional digits and
/// anything outside the money range.
pub fn parse_money(s: &str) -> Option<Amount> {
    let s = s.trim();
    if s.is_empty() || s.starts_with('-') {
        return None;
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > 8 || !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac_units: i64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<8}").parse().ok()?
    };
    let value = whole.checked_mul(COIN)?.checked_add(frac_units)?;
    money_range(value).then_some(value)
}
