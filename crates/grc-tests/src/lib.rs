//! Integration and property tests for the grc wallet engine.
//!
//! The tests drive a full `WalletEngine` against an in-memory chain,
//! over both the in-memory and the RocksDB record stores.

pub mod helpers;
