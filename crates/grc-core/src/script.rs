//! Output scripts and the destinations they pay to.
//!
//! Scripts are a closed set of templates rather than an interpreted byte
//! language. Anything the wallet does not recognize is carried as
//! [`Script::NonStandard`] and never considered spendable.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Hash256;

/// Locking condition attached to a transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub enum Script {
    /// No condition. Only valid as the coinstake marker output.
    #[default]
    Empty,
    /// Spendable by the key whose id (BLAKE3 of the public key) matches.
    PayToKeyHash(Hash256),
    /// Spendable by revealing a redeem script with this hash and satisfying it.
    PayToScriptHash(Hash256),
    /// Provably unspendable data carrier. Value sent here is burned.
    NullData(Vec<u8>),
    NonStandard(Vec<u8>),
}

/// Where an output pays: a key or a script.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub enum Destination {
    KeyHash(Hash256),
    ScriptHash(Hash256),
}

impl Destination {
    pub fn hash(&self) -> &Hash256 {
        match self {
            Destination::KeyHash(h) | Destination::ScriptHash(h) => h,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::KeyHash(h) => write!(f, "key:{h}"),
            Destination::ScriptHash(h) => write!(f, "script:{h}"),
        }
    }
}

impl Script {
    const TAG_EMPTY: u8 = 0;
    const TAG_KEY_HASH: u8 = 1;
    const TAG_SCRIPT_HASH: u8 = 2;
    const TAG_NULL_DATA: u8 = 3;
    const TAG_NON_STANDARD: u8 = 4;

    pub fn from_destination(dest: &Destination) -> Self {
        match dest {
            Destination::KeyHash(h) => Script::PayToKeyHash(*h),
            Destination::ScriptHash(h) => Script::PayToScriptHash(*h),
        }
    }

    /// The destination this script pays to, if it has one.
    pub fn destination(&self) -> Option<Destination> {
        match self {
            Script::PayToKeyHash(h) => Some(Destination::KeyHash(*h)),
            Script::PayToScriptHash(h) => Some(Destination::ScriptHash(*h)),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Script::Empty)
    }

    pub fn is_unspendable(&self) -> bool {
        matches!(self, Script::NullData(_))
    }

    /// Explicit byte layout: a one-byte tag, then either a 32-byte hash or a
    /// little-endian u32 length followed by raw data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(37);
        match self {
            Script::Empty => out.push(Self::TAG_EMPTY),
            Script::PayToKeyHash(h) => {
                out.push(Self::TAG_KEY_HASH);
                out.extend_from_slice(h.as_bytes());
            }
            Script::PayToScriptHash(h) => {
                out.push(Self::TAG_SCRIPT_HASH);
                out.extend_from_slice(h.as_bytes());
            }
            Script::NullData(data) => {
                out.push(Self::TAG_NULL_DATA);
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            Script::NonStandard(data) => {
                out.push(Self::TAG_NON_STANDARD);
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// BLAKE3 hash of [`Script::to_bytes`], the id a pay-to-script-hash output commits to.
    pub fn script_hash(&self) -> Hash256 {
        Hash256(blake3::hash(&self.to_bytes()).into())
    }
}
