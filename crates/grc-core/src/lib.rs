//! # grc-core
//! Foundation types and collaborator traits for the staking wallet engine.

pub mod address;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod merkle;
pub mod money;
pub mod policy;
pub mod script;
pub mod traits;
pub mod types;
