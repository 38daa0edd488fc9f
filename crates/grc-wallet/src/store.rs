//! Wallet record store.
//!
//! The engine persists through the [`WalletStore`] trait: one logical
//! column per [`RecordKind`], records keyed by [`RecordKey`] and encoded
//! with bincode. Writes are durable on return. `txn_begin` / `txn_commit`
//! group writes into one atomic batch; `rewrite` recompacts everything.
//!
//! [`MemoryWalletStore`] keeps records in a `BTreeMap` and is used by
//! tests and volatile wallets. The RocksDB implementation lives in the
//! `grc-walletdb` crate.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use grc_core::crypto::key_id;
use grc_core::script::{Destination, Script};
use grc_core::types::Hash256;

use crate::crypter::MasterKeyRecord;
use crate::error::WalletError;
use crate::keys::{HdChain, KeyMetadata, KeyPoolEntry};
use crate::wallet_tx::WalletTx;

/// Logical column a record lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Key,
    CryptedKey,
    MasterKey,
    HdChain,
    Tx,
    OrderPosNext,
    Pool,
    RedeemScript,
    WatchOnly,
    Name,
}

impl RecordKind {
    pub const ALL: [RecordKind; 10] = [
        RecordKind::Key,
        RecordKind::CryptedKey,
        RecordKind::MasterKey,
        RecordKind::HdChain,
        RecordKind::Tx,
        RecordKind::OrderPosNext,
        RecordKind::Pool,
        RecordKind::RedeemScript,
        RecordKind::WatchOnly,
        RecordKind::Name,
    ];

    /// Column family name used by on-disk stores.
    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::Key => "key",
            RecordKind::CryptedKey => "ckey",
            RecordKind::MasterKey => "mkey",
            RecordKind::HdChain => "hdchain",
            RecordKind::Tx => "tx",
            RecordKind::OrderPosNext => "orderposnext",
            RecordKind::Pool => "pool",
            RecordKind::RedeemScript => "cscript",
            RecordKind::WatchOnly => "watchs",
            RecordKind::Name => "name",
        }
    }
}

/// Identifies a single record within its kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Key(Hash256),
    CryptedKey(Hash256),
    MasterKey(u32),
    HdChain,
    Tx(Hash256),
    OrderPosNext,
    Pool(u64),
    RedeemScript(Hash256),
    WatchOnly(Hash256),
    Name(Destination),
}

impl RecordKey {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordKey::Key(_) => RecordKind::Key,
            RecordKey::CryptedKey(_) => RecordKind::CryptedKey,
            RecordKey::MasterKey(_) => RecordKind::MasterKey,
            RecordKey::HdChain => RecordKind::HdChain,
            RecordKey::Tx(_) => RecordKind::Tx,
            RecordKey::OrderPosNext => RecordKind::OrderPosNext,
            RecordKey::Pool(_) => RecordKind::Pool,
            RecordKey::RedeemScript(_) => RecordKind::RedeemScript,
            RecordKey::WatchOnly(_) => RecordKind::WatchOnly,
            RecordKey::Name(_) => RecordKind::Name,
        }
    }

    /// Key bytes within the record's column. Integers are big-endian so
    /// iteration order matches numeric order.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            RecordKey::Key(h)
            | RecordKey::CryptedKey(h)
            | RecordKey::Tx(h)
            | RecordKey::RedeemScript(h)
            | RecordKey::WatchOnly(h) => h.as_bytes().to_vec(),
            RecordKey::MasterKey(id) => id.to_be_bytes().to_vec(),
            RecordKey::Pool(index) => index.to_be_bytes().to_vec(),
            RecordKey::HdChain => b"hdchain".to_vec(),
            RecordKey::OrderPosNext => b"orderposnext".to_vec(),
            RecordKey::Name(dest) => {
                let mut out = Vec::with_capacity(33);
                out.push(match dest {
                    Destination::KeyHash(_) => 0,
                    Destination::ScriptHash(_) => 1,
                });
                out.extend_from_slice(dest.hash().as_bytes());
                out
            }
        }
    }
}

/// A persisted wallet record.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum WalletRecord {
    /// Plaintext key. Only ever written by an unencrypted vault.
    Key {
        public_key: [u8; 32],
        secret: [u8; 32],
        metadata: KeyMetadata,
    },
    CryptedKey {
        public_key: [u8; 32],
        crypted_secret: Vec<u8>,
        metadata: KeyMetadata,
    },
    MasterKey {
        id: u32,
        record: MasterKeyRecord,
    },
    HdChain(HdChain),
    Tx(WalletTx),
    OrderPosNext(i64),
    Pool {
        index: u64,
        entry: KeyPoolEntry,
    },
    RedeemScript(Script),
    WatchOnly(Script),
    Name {
        destination: Destination,
        label: String,
    },
}

impl WalletRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            WalletRecord::Key { public_key, .. } => RecordKey::Key(key_id(public_key)),
            WalletRecord::CryptedKey { public_key, .. } => RecordKey::CryptedKey(key_id(public_key)),
            WalletRecord::MasterKey { id, .. } => RecordKey::MasterKey(*id),
            WalletRecord::HdChain(_) => RecordKey::HdChain,
            WalletRecord::Tx(wtx) => RecordKey::Tx(wtx.txid),
            WalletRecord::OrderPosNext(_) => RecordKey::OrderPosNext,
            WalletRecord::Pool { index, .. } => RecordKey::Pool(*index),
            WalletRecord::RedeemScript(script) => RecordKey::RedeemScript(script.script_hash()),
            WalletRecord::WatchOnly(script) => RecordKey::WatchOnly(script.script_hash()),
            WalletRecord::Name { destination, .. } => RecordKey::Name(*destination),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WalletError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| WalletError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WalletError> {
        let (record, read) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| WalletError::Serialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(WalletError::Serialization(format!(
                "{} trailing bytes after record",
                bytes.len() - read
            )));
        }
        Ok(record)
    }
}

/// Raw record as read back from a store. Decoding is left to the loader so
/// one bad record does not hide the rest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub kind: RecordKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Persistence collaborator.
pub trait WalletStore: Send + Sync {
    fn write(&self, record: &WalletRecord) -> Result<(), WalletError>;

    fn erase(&self, key: &RecordKey) -> Result<(), WalletError>;

    /// Start buffering writes and erases into one atomic batch.
    fn txn_begin(&self) -> Result<(), WalletError>;

    fn txn_commit(&self) -> Result<(), WalletError>;

    /// Drop everything buffered since `txn_begin`.
    fn txn_abort(&self) -> Result<(), WalletError>;

    /// Fully recompact storage so no stale fragments remain.
    fn rewrite(&self) -> Result<(), WalletError>;

    fn load_all(&self) -> Result<Vec<StoredRecord>, WalletError>;

    /// False for volatile stores. Erasing ledger records requires a persistent store.
    fn is_persistent(&self) -> bool;
}

enum PendingOp {
    Put(RecordKind, Vec<u8>, Vec<u8>),
    Delete(RecordKind, Vec<u8>),
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<(RecordKind, Vec<u8>), Vec<u8>>,
    pending: Option<Vec<PendingOp>>,
    rewrites: usize,
    fail_writes: bool,
}

impl MemoryState {
    fn apply(&mut self, op: PendingOp) {
        match op {
            PendingOp::Put(kind, key, value) => {
                self.records.insert((kind, key), value);
            }
            PendingOp::Delete(kind, key) => {
                self.records.remove(&(kind, key));
            }
        }
    }

    fn submit(&mut self, op: PendingOp) {
        match self.pending.as_mut() {
            Some(batch) => batch.push(op),
            None => self.apply(op),
        }
    }
}

/// In-memory [`WalletStore`].
pub struct MemoryWalletStore {
    state: Mutex<MemoryState>,
    persistent: bool,
}

impl MemoryWalletStore {
    /// A store that behaves as if file-backed.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            persistent: true,
        }
    }

    /// A store that reports itself as not file-backed.
    pub fn volatile() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            persistent: false,
        }
    }

    /// Make every subsequent write and erase fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Number of completed `rewrite` calls.
    pub fn rewrite_count(&self) -> usize {
        self.state.lock().rewrites
    }

    /// Number of committed records of `kind`.
    pub fn count(&self, kind: RecordKind) -> usize {
        self.state
            .lock()
            .records
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn get(&self, key: &RecordKey) -> Option<WalletRecord> {
        let state = self.state.lock();
        let bytes = state.records.get(&(key.kind(), key.to_bytes()))?;
        WalletRecord::decode(bytes).ok()
    }

    /// Store raw bytes under `key`, bypassing encoding.
    pub fn put_raw(&self, kind: RecordKind, key: Vec<u8>, value: Vec<u8>) {
        self.state.lock().records.insert((kind, key), value);
    }
}

impl Default for MemoryWalletStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletStore for MemoryWalletStore {
    fn write(&self, record: &WalletRecord) -> Result<(), WalletError> {
        let key = record.key();
        let value = record.encode()?;
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(WalletError::Storage("write failed".into()));
        }
        state.submit(PendingOp::Put(key.kind(), key.to_bytes(), value));
        Ok(())
    }

    fn erase(&self, key: &RecordKey) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(WalletError::Storage("erase failed".into()));
        }
        state.submit(PendingOp::Delete(key.kind(), key.to_bytes()));
        Ok(())
    }

    fn txn_begin(&self) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        if state.pending.is_some() {
            return Err(WalletError::Storage("transaction already open".into()));
        }
        state.pending = Some(Vec::new());
        Ok(())
    }

    fn txn_commit(&self) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        let batch = state
            .pending
            .take()
            .ok_or_else(|| WalletError::Storage("no open transaction".into()))?;
        let ops = batch.len();
        for op in batch {
            state.apply(op);
        }
        debug!(ops, "committed wallet batch");
        Ok(())
    }

    fn txn_abort(&self) -> Result<(), WalletError> {
        self.state.lock().pending = None;
        Ok(())
    }

    fn rewrite(&self) -> Result<(), WalletError> {
        self.state.lock().rewrites += 1;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<StoredRecord>, WalletError> {
        let state = self.state.lock();
        Ok(state
            .records
            .iter()
            .map(|((kind, key), value)| StoredRecord {
                kind: *kind,
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }
}
