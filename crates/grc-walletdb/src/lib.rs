//! RocksDB-backed wallet record store.
//!
//! Each [`RecordKind`] lives in its own column family, keyed by
//! [`RecordKey::to_bytes`]. Between `txn_begin` and `txn_commit` writes are
//! buffered and applied as one atomic [`WriteBatch`].

use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use tracing::{debug, info};

use grc_wallet::error::WalletError;
use grc_wallet::store::{RecordKey, RecordKind, StoredRecord, WalletRecord, WalletStore};

enum PendingOp {
    Put(RecordKind, Vec<u8>, Vec<u8>),
    Delete(RecordKind, Vec<u8>),
}

pub struct RocksWalletStore {
    db: DB,
    pending: Mutex<Option<Vec<PendingOp>>>,
}

fn storage_err(e: rocksdb::Error) -> WalletError {
    WalletError::Storage(e.to_string())
}

impl RocksWalletStore {
    /// Open or create a wallet database at `path`, creating any missing
    /// column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = RecordKind::ALL
            .iter()
            .map(|kind| ColumnFamilyDescriptor::new(kind.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(storage_err)?;
        info!(path = %path.as_ref().display(), "opened wallet database");
        Ok(Self {
            db,
            pending: Mutex::new(None),
        })
    }

    /// Whether a batch is currently open.
    pub fn in_transaction(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Read one record back. Undecodable bytes are reported as an error.
    pub fn get(&self, key: &RecordKey) -> Result<Option<WalletRecord>, WalletError> {
        let cf = self.cf_handle(key.kind())?;
        match self.db.get_cf(cf, key.to_bytes()).map_err(storage_err)? {
            Some(bytes) => WalletRecord::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn cf_handle(&self, kind: RecordKind) -> Result<&rocksdb::ColumnFamily, WalletError> {
        let name = kind.name();
        self.db
            .cf_handle(name)
            .ok_or_else(|| WalletError::Storage(format!("missing column family: {name}")))
    }

    fn apply(&self, ops: Vec<PendingOp>) -> Result<(), WalletError> {
        let mut batch = WriteBatch::default();
        for op in &ops {
            match op {
                PendingOp::Put(kind, key, value) => batch.put_cf(self.cf_handle(*kind)?, key, value),
                PendingOp::Delete(kind, key) => batch.delete_cf(self.cf_handle(*kind)?, key),
            }
        }
        self.db.write(batch).map_err(storage_err)
    }

    fn submit(&self, op: PendingOp) -> Result<(), WalletError> {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(ops) => {
                ops.push(op);
                Ok(())
            }
            None => {
                drop(pending);
                self.apply(vec![op])
            }
        }
    }
}

impl WalletStore for RocksWalletStore {
    fn write(&self, record: &WalletRecord) -> Result<(), WalletError> {
        let key = record.key();
        let value = record.encode()?;
        self.submit(PendingOp::Put(key.kind(), key.to_bytes(), value))
    }

    fn erase(&self, key: &RecordKey) -> Result<(), WalletError> {
        self.submit(PendingOp::Delete(key.kind(), key.to_bytes()))
    }

    fn txn_begin(&self) -> Result<(), WalletError> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return Err(WalletError::Storage("transaction already open".into()));
        }
        *pending = Some(Vec::new());
        Ok(())
    }

    fn txn_commit(&self) -> Result<(), WalletError> {
        let ops = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| WalletError::Storage("no open transaction".into()))?;
        let count = ops.len();
        self.apply(ops)?;
        debug!(ops = count, "committed wallet batch");
        Ok(())
    }

    fn txn_abort(&self) -> Result<(), WalletError> {
        if let Some(ops) = self.pending.lock().take() {
            debug!(ops = ops.len(), "discarded wallet batch");
        }
        Ok(())
    }

    /// Flush memtables and compact every column family.
    fn rewrite(&self) -> Result<(), WalletError> {
        self.db.flush().map_err(storage_err)?;
        for kind in RecordKind::ALL {
            let cf = self.cf_handle(kind)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        info!("compacted wallet database");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<StoredRecord>, WalletError> {
        let mut out = Vec::new();
        for kind in RecordKind::ALL {
            let cf = self.cf_handle(kind)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, value) = item.map_err(storage_err)?;
                out.push(StoredRecord {
                    kind,
                    key: key.into_vec(),
                    value: value.into_vec(),
                });
            }
        }
        Ok(out)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_record_kind_has_a_column_family() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksWalletStore::open(dir.path()).unwrap();
        for kind in RecordKind::ALL {
            assert!(store.cf_handle(kind).is_ok(), "{}", kind.name());
        }
    }

    #[test]
    fn nested_begin_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksWalletStore::open(dir.path()).unwrap();
        store.txn_begin().unwrap();
        assert!(store.in_transaction());
        assert!(store.txn_begin().is_err());
        store.txn_abort().unwrap();
        assert!(!store.in_transaction());
        assert!(store.txn_commit().is_err());
    }
}
