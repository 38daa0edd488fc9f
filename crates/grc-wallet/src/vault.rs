//! Key vault: private key custody, encryption state and HD derivation.
//!
//! The vault is in exactly one of three states:
//!
//! ```text
//! Unencrypted --encrypt--> Locked <--unlock/lock--> Unlocked
//! ```
//!
//! An unencrypted vault holds plaintext key pairs. Once encrypted, every
//! private key is stored AES-256-GCM encrypted under a random master key and
//! decrypted on demand while the session master key is present. There is no
//! way back to `Unencrypted`.
//!
//! Every mutating operation writes to the [`WalletStore`] before touching
//! in-memory state, so a failed write leaves the vault unchanged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use rand::RngCore;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use grc_core::constants::DEFAULT_KEYPOOL_SIZE;
use grc_core::crypto::{KeyPair, PublicKey, sign_transaction_input, signing_script};
use grc_core::script::Script;
use grc_core::types::{Hash256, Transaction};

use crate::crypter::{
    KdfParams, KeyingMaterial, MasterKeyRecord, WALLET_CRYPTO_KEY_SIZE, decrypt_secret,
    encrypt_secret,
};
use crate::error::WalletError;
use crate::keys::{HARDENED, HdChain, KeyMetadata, KeyPoolEntry, Seed, derive_external_key};
use crate::store::{RecordKey, WalletRecord, WalletStore};

/// Encryption state of the vault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaultState {
    Unencrypted,
    Locked,
    Unlocked,
}

/// Ownership of an output script.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IsMine {
    No,
    WatchOnly,
    Spendable,
}

/// Vault behaviour knobs.
#[derive(Clone, Debug)]
pub struct VaultOptions {
    /// Derive new keys from the HD seed instead of generating them randomly.
    pub use_hd: bool,
    pub keypool_size: usize,
    pub kdf: KdfParams,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            use_hd: true,
            keypool_size: DEFAULT_KEYPOOL_SIZE,
            kdf: KdfParams::default(),
        }
    }
}

/// A key taken out of the pool but not yet committed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservedKey {
    pub index: u64,
    pub entry: KeyPoolEntry,
}

impl ReservedKey {
    pub fn key_id(&self) -> Hash256 {
        grc_core::crypto::key_id(&self.entry.public_key)
    }
}

/// Exported private key.
pub struct DumpedKey {
    pub key_id: Hash256,
    pub public_key: [u8; 32],
    pub metadata: KeyMetadata,
    secret: Zeroizing<[u8; 32]>,
}

impl DumpedKey {
    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for DumpedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumpedKey")
            .field("key_id", &self.key_id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
struct CryptedKey {
    public_key: [u8; 32],
    crypted: Vec<u8>,
}

pub struct KeyVault {
    /// Plaintext keys. Empty once the vault is encrypted.
    keys: HashMap<Hash256, KeyPair>,
    crypted_keys: HashMap<Hash256, CryptedKey>,
    master_keys: BTreeMap<u32, MasterKeyRecord>,
    /// Session master key. Present only while unlocked.
    master_key: Option<KeyingMaterial>,
    metadata: HashMap<Hash256, KeyMetadata>,
    hd_chain: Option<HdChain>,
    redeem_scripts: HashMap<Hash256, Script>,
    watch_only: BTreeSet<Script>,
    key_pool: BTreeMap<u64, KeyPoolEntry>,
    first_key_time: Option<u64>,
    options: VaultOptions,
}

impl KeyVault {
    pub fn new(options: VaultOptions) -> Self {
        Self {
            keys: HashMap::new(),
            crypted_keys: HashMap::new(),
            master_keys: BTreeMap::new(),
            master_key: None,
            metadata: HashMap::new(),
            hd_chain: None,
            redeem_scripts: HashMap::new(),
            watch_only: BTreeSet::new(),
            key_pool: BTreeMap::new(),
            first_key_time: None,
            options,
        }
    }

    pub fn options(&self) -> &VaultOptions {
        &self.options
    }

    pub fn state(&self) -> VaultState {
        if self.master_keys.is_empty() {
            VaultState::Unencrypted
        } else if self.master_key.is_none() {
            VaultState::Locked
        } else {
            VaultState::Unlocked
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !self.master_keys.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.state() == VaultState::Locked
    }

    pub fn have_key(&self, id: &Hash256) -> bool {
        self.keys.contains_key(id) || self.crypted_keys.contains_key(id)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len() + self.crypted_keys.len()
    }

    pub fn public_key(&self, id: &Hash256) -> Option<PublicKey> {
        if let Some(kp) = self.keys.get(id) {
            return Some(kp.public_key());
        }
        let entry = self.crypted_keys.get(id)?;
        PublicKey::from_bytes(&entry.public_key).ok()
    }

    pub fn metadata(&self, id: &Hash256) -> Option<&KeyMetadata> {
        self.metadata.get(id)
    }

    pub fn hd_chain(&self) -> Option<&HdChain> {
        self.hd_chain.as_ref()
    }

    /// Earliest key creation time, the lower bound for chain rescans.
    pub fn first_key_time(&self) -> Option<u64> {
        self.first_key_time
    }

    fn note_key_time(&mut self, create_time: u64) {
        self.first_key_time = Some(match self.first_key_time {
            Some(current) => current.min(create_time),
            None => create_time,
        });
    }

    // --- key generation -------------------------------------------------

    /// Create a new key and persist it.
    ///
    /// In HD mode the key is the next unused child under `m/0'/0'`;
    /// otherwise it is random. Fails with [`WalletError::VaultLocked`] when
    /// the vault is locked, since the new key could be neither derived nor
    /// encrypted.
    pub fn generate_key(&mut self, store: &dyn WalletStore, now: u64) -> Result<PublicKey, WalletError> {
        if self.is_locked() {
            return Err(WalletError::VaultLocked);
        }
        let (keypair, metadata) = if self.options.use_hd && self.hd_chain.is_some() {
            self.derive_next_child(store, now)?
        } else {
            (KeyPair::generate(), KeyMetadata::new(now))
        };
        let public_key = keypair.public_key();
        self.add_key_pair(store, keypair, metadata)?;
        debug!(key_id = %public_key.key_id(), "generated key");
        Ok(public_key)
    }

    fn derive_next_child(
        &mut self,
        store: &dyn WalletStore,
        now: u64,
    ) -> Result<(KeyPair, KeyMetadata), WalletError> {
        let mut chain = self
            .hd_chain
            .clone()
            .ok_or_else(|| WalletError::KeyNotFound("hd chain".into()))?;
        let seed = Seed::from_bytes(self.keypair(&chain.master_key_id)?.secret_bytes());

        let (keypair, path) = loop {
            if chain.external_counter >= HARDENED {
                return Err(WalletError::BuildError("hd external chain exhausted".into()));
            }
            let (keypair, path) = derive_external_key(&seed, chain.external_counter);
            chain.external_counter += 1;
            if !self.have_key(&keypair.key_id()) {
                break (keypair, path);
            }
        };

        store.write(&WalletRecord::HdChain(chain.clone()))?;
        let metadata = KeyMetadata {
            create_time: now,
            hd_keypath: Some(path),
            hd_master_key_id: Some(chain.master_key_id),
        };
        self.hd_chain = Some(chain);
        Ok((keypair, metadata))
    }

    /// Store a key pair, encrypted if the vault is encrypted.
    fn add_key_pair(
        &mut self,
        store: &dyn WalletStore,
        keypair: KeyPair,
        metadata: KeyMetadata,
    ) -> Result<(), WalletError> {
        let id = keypair.key_id();
        let public_key = keypair.public_key().to_bytes();
        let secret = Zeroizing::new(keypair.secret_bytes());

        if self.is_encrypted() {
            let master = self.master_key.as_ref().ok_or(WalletError::VaultLocked)?;
            let crypted = encrypt_secret(master, &public_key, &secret)?;
            store.write(&WalletRecord::CryptedKey {
                public_key,
                crypted_secret: crypted.clone(),
                metadata: metadata.clone(),
            })?;
            self.crypted_keys.insert(id, CryptedKey { public_key, crypted });
        } else {
            store.write(&WalletRecord::Key {
                public_key,
                secret: *secret,
                metadata: metadata.clone(),
            })?;
            self.keys.insert(id, keypair);
        }
        self.note_key_time(metadata.create_time);
        self.metadata.insert(id, metadata);
        Ok(())
    }

    /// Install `seed` as the HD seed. New keys derive from it from now on.
    pub fn set_hd_seed(&mut self, store: &dyn WalletStore, seed: &Seed, now: u64) -> Result<Hash256, WalletError> {
        if self.is_locked() {
            return Err(WalletError::VaultLocked);
        }
        let keypair = seed.as_keypair();
        let id = keypair.key_id();
        if !self.have_key(&id) {
            let metadata = KeyMetadata {
                create_time: now,
                hd_keypath: Some("m".into()),
                hd_master_key_id: Some(id),
            };
            self.add_key_pair(store, keypair, metadata)?;
        }
        let chain = HdChain {
            master_key_id: id,
            external_counter: 0,
        };
        store.write(&WalletRecord::HdChain(chain.clone()))?;
        self.hd_chain = Some(chain);
        info!(master_key_id = %id, "installed hd seed");
        Ok(id)
    }

    pub fn new_hd_seed(&mut self, store: &dyn WalletStore, now: u64) -> Result<Hash256, WalletError> {
        self.set_hd_seed(store, &Seed::generate(), now)
    }

    /// The current HD seed. Requires the private key material.
    pub fn hd_seed(&self) -> Result<Seed, WalletError> {
        let chain = self
            .hd_chain
            .as_ref()
            .ok_or_else(|| WalletError::KeyNotFound("hd chain".into()))?;
        let keypair = self.keypair(&chain.master_key_id)?;
        Ok(Seed::from_bytes(keypair.secret_bytes()))
    }

    /// Add an externally supplied private key. Known keys are left as is.
    pub fn import_key(
        &mut self,
        store: &dyn WalletStore,
        secret: [u8; 32],
        birth_time: u64,
    ) -> Result<Hash256, WalletError> {
        let keypair = KeyPair::from_secret_bytes(secret);
        let id = keypair.key_id();
        if self.have_key(&id) {
            return Ok(id);
        }
        if self.is_locked() {
            return Err(WalletError::VaultLocked);
        }
        self.add_key_pair(store, keypair, KeyMetadata::new(birth_time))?;
        info!(key_id = %id, birth_time, "imported key");
        Ok(id)
    }

    /// Export every private key. Not available while locked.
    pub fn dump_keys(&self) -> Result<Vec<DumpedKey>, WalletError> {
        if self.is_locked() {
            return Err(WalletError::VaultLocked);
        }
        let mut ids: Vec<Hash256> = self
            .keys
            .keys()
            .chain(self.crypted_keys.keys())
            .copied()
            .collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let keypair = self.keypair(&id)?;
                Ok(DumpedKey {
                    key_id: id,
                    public_key: keypair.public_key().to_bytes(),
                    metadata: self.metadata.get(&id).cloned().unwrap_or_default(),
                    secret: Zeroizing::new(keypair.secret_bytes()),
                })
            })
            .collect()
    }

    /// Creation time of every key. Zero means unknown.
    pub fn key_birth_times(&self) -> BTreeMap<Hash256, u64> {
        self.keys
            .keys()
            .chain(self.crypted_keys.keys())
            .map(|id| (*id, self.metadata.get(id).map_or(0, |m| m.create_time)))
            .collect()
    }

    pub fn add_redeem_script(&mut self, store: &dyn WalletStore, script: Script) -> Result<Hash256, WalletError> {
        let hash = script.script_hash();
        store.write(&WalletRecord::RedeemScript(script.clone()))?;
        self.redeem_scripts.insert(hash, script);
        Ok(hash)
    }

    pub fn add_watch_only(&mut self, store: &dyn WalletStore, script: Script) -> Result<(), WalletError> {
        store.write(&WalletRecord::WatchOnly(script.clone()))?;
        self.watch_only.insert(script);
        Ok(())
    }

    pub fn redeem_script(&self, hash: &Hash256) -> Option<&Script> {
        self.redeem_scripts.get(hash)
    }

    // --- encryption -----------------------------------------------------

    /// Encrypt the vault under `passphrase`.
    ///
    /// Writes the wrapped master key and every re-encrypted key in one store
    /// batch. A failure after re-encryption started aborts the process:
    /// half-migrated key material must never survive. After the commit a
    /// fresh HD seed replaces the old one (HD mode), the key pool is
    /// regenerated and the store is fully rewritten. The vault ends `Locked`
    /// whether or not those later steps succeed.
    pub fn encrypt(&mut self, store: &dyn WalletStore, passphrase: &[u8], now: u64) -> Result<(), WalletError> {
        if self.is_encrypted() {
            return Err(WalletError::AlreadyEncrypted);
        }

        let mut master = Zeroizing::new([0u8; WALLET_CRYPTO_KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(&mut master[..]);
        let record = MasterKeyRecord::create(passphrase, &master, &self.options.kdf)?;
        let master_id = 1;

        store.txn_begin()?;
        if let Err(e) = store.write(&WalletRecord::MasterKey {
            id: master_id,
            record: record.clone(),
        }) {
            let _ = store.txn_abort();
            return Err(e);
        }

        let crypted = match self.encrypt_keys(store, &master) {
            Ok(crypted) => crypted,
            Err(e) => {
                let _ = store.txn_abort();
                error!(error = %e, "key re-encryption failed mid-way, aborting");
                std::process::abort();
            }
        };
        if let Err(e) = store.txn_commit() {
            error!(error = %e, "committing encrypted keys failed, aborting");
            std::process::abort();
        }

        self.keys.clear();
        self.crypted_keys = crypted;
        self.master_keys.insert(master_id, record);
        self.master_key = Some(master);
        info!(keys = self.crypted_keys.len(), "vault encrypted");

        let refreshed = self.refresh_after_encrypt(store, now);
        self.lock();
        if let Err(e) = refreshed {
            error!(error = %e, "key refresh after encryption failed; vault left locked");
            return Err(e);
        }

        store.rewrite().map_err(|e| {
            error!(error = %e, "store rewrite after encryption failed");
            e
        })
    }

    /// Replace the HD seed (HD mode) and regenerate the key pool under the
    /// new master key.
    fn refresh_after_encrypt(&mut self, store: &dyn WalletStore, now: u64) -> Result<(), WalletError> {
        if self.options.use_hd {
            self.new_hd_seed(store, now)?;
        }
        self.new_key_pool(store, now)
    }

    fn encrypt_keys(
        &self,
        store: &dyn WalletStore,
        master: &[u8; WALLET_CRYPTO_KEY_SIZE],
    ) -> Result<HashMap<Hash256, CryptedKey>, WalletError> {
        let mut crypted = HashMap::with_capacity(self.keys.len());
        for (id, keypair) in &self.keys {
            let public_key = keypair.public_key().to_bytes();
            let secret = Zeroizing::new(keypair.secret_bytes());
            let ciphertext = encrypt_secret(master, &public_key, &secret)?;
            store.write(&WalletRecord::CryptedKey {
                public_key,
                crypted_secret: ciphertext.clone(),
                metadata: self.metadata.get(id).cloned().unwrap_or_default(),
            })?;
            store.erase(&RecordKey::Key(*id))?;
            crypted.insert(*id, CryptedKey {
                public_key,
                crypted: ciphertext,
            });
        }
        Ok(crypted)
    }

    /// Check a candidate master key against one stored encrypted key.
    fn verify_master_key(&self, master: &[u8; WALLET_CRYPTO_KEY_SIZE]) -> bool {
        let Some(entry) = self.crypted_keys.values().next() else {
            return true;
        };
        match decrypt_secret(master, &entry.public_key, &entry.crypted) {
            Ok(secret) => KeyPair::from_secret_bytes(*secret).public_key().to_bytes() == entry.public_key,
            Err(_) => false,
        }
    }

    /// Try `passphrase` against every master key record.
    ///
    /// Returns false on a wrong passphrase and leaves the state untouched.
    pub fn unlock(&mut self, passphrase: &[u8]) -> Result<bool, WalletError> {
        if !self.is_encrypted() {
            return Err(WalletError::NotEncrypted);
        }
        for record in self.master_keys.values() {
            let Some(master) = record.unwrap_key(passphrase)? else {
                continue;
            };
            if self.verify_master_key(&master) {
                self.master_key = Some(master);
                debug!("vault unlocked");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Discard the session master key.
    pub fn lock(&mut self) {
        if self.master_key.take().is_some() {
            debug!("vault locked");
        }
    }

    /// Rewrap the master key under `new`. Returns false if `old` is wrong.
    /// The lock state is preserved.
    pub fn change_passphrase(
        &mut self,
        store: &dyn WalletStore,
        old: &[u8],
        new: &[u8],
    ) -> Result<bool, WalletError> {
        if !self.is_encrypted() {
            return Err(WalletError::NotEncrypted);
        }
        let ids: Vec<u32> = self.master_keys.keys().copied().collect();
        for id in ids {
            let Some(record) = self.master_keys.get(&id) else {
                continue;
            };
            let Some(master) = record.unwrap_key(old)? else {
                continue;
            };
            if !self.verify_master_key(&master) {
                continue;
            }
            let rewrapped = MasterKeyRecord::create(new, &master, &self.options.kdf)?;
            store.write(&WalletRecord::MasterKey {
                id,
                record: rewrapped.clone(),
            })?;
            self.master_keys.insert(id, rewrapped);
            info!(master_key = id, "passphrase changed");
            return Ok(true);
        }
        Ok(false)
    }

    // --- ownership and signing ------------------------------------------

    /// Classify an output script against the keys and scripts held here.
    pub fn classify_script(&self, script: &Script) -> IsMine {
        let spendable = match script {
            Script::PayToKeyHash(id) => self.have_key(id),
            Script::PayToScriptHash(hash) => {
                matches!(self.redeem_scripts.get(hash), Some(Script::PayToKeyHash(id)) if self.have_key(id))
            }
            _ => false,
        };
        if spendable {
            IsMine::Spendable
        } else if self.watch_only.contains(script) {
            IsMine::WatchOnly
        } else {
            IsMine::No
        }
    }

    /// Key pair for `id`, decrypting it if necessary.
    pub fn keypair(&self, id: &Hash256) -> Result<KeyPair, WalletError> {
        if let Some(keypair) = self.keys.get(id) {
            return Ok(keypair.clone());
        }
        let entry = self
            .crypted_keys
            .get(id)
            .ok_or_else(|| WalletError::KeyNotFound(id.to_string()))?;
        let master = self.master_key.as_ref().ok_or(WalletError::VaultLocked)?;
        let secret = decrypt_secret(master, &entry.public_key, &entry.crypted)?;
        Ok(KeyPair::from_secret_bytes(*secret))
    }

    pub fn sign(&self, id: &Hash256, message: &[u8]) -> Result<[u8; 64], WalletError> {
        Ok(self.keypair(id)?.sign(message))
    }

    /// Sign input `index` of `tx`, which spends an output locked by `prev_script`.
    pub fn sign_input(&self, tx: &mut Transaction, index: usize, prev_script: &Script) -> Result<(), WalletError> {
        let redeem = match prev_script {
            Script::PayToScriptHash(hash) => self.redeem_scripts.get(hash),
            _ => None,
        };
        let inner = signing_script(prev_script, redeem).map_err(|e| WalletError::Signature(e.to_string()))?;
        let Script::PayToKeyHash(id) = inner else {
            return Err(WalletError::Signature("unsupported script".into()));
        };
        let keypair = match self.keypair(id) {
            Ok(keypair) => keypair,
            Err(WalletError::VaultLocked) => return Err(WalletError::VaultLocked),
            Err(e) => return Err(WalletError::Signature(e.to_string())),
        };
        sign_transaction_input(tx, index, &keypair, prev_script, redeem)
            .map_err(|e| WalletError::Signature(e.to_string()))
    }

    // --- key pool -------------------------------------------------------

    pub fn key_pool_size(&self) -> usize {
        self.key_pool.len()
    }

    /// Drop every pooled key and generate a full new pool.
    pub fn new_key_pool(&mut self, store: &dyn WalletStore, now: u64) -> Result<(), WalletError> {
        for index in self.key_pool.keys() {
            store.erase(&RecordKey::Pool(*index))?;
        }
        self.key_pool.clear();
        if self.is_locked() {
            return Err(WalletError::VaultLocked);
        }
        for index in 1..=self.options.keypool_size as u64 {
            self.push_pool_key(store, index, now)?;
        }
        info!(keys = self.options.keypool_size, "wrote new key pool");
        Ok(())
    }

    fn push_pool_key(&mut self, store: &dyn WalletStore, index: u64, now: u64) -> Result<(), WalletError> {
        let public_key = self.generate_key(store, now)?;
        let entry = KeyPoolEntry {
            time: now,
            public_key: public_key.to_bytes(),
        };
        store.write(&WalletRecord::Pool {
            index,
            entry: entry.clone(),
        })?;
        self.key_pool.insert(index, entry);
        Ok(())
    }

    /// Fill the pool to `size` keys, or the configured size when `size` is 0.
    pub fn top_up_key_pool(&mut self, store: &dyn WalletStore, size: usize, now: u64) -> Result<(), WalletError> {
        if self.is_locked() {
            return Err(WalletError::VaultLocked);
        }
        let target = if size > 0 { size } else { self.options.keypool_size };
        while self.key_pool.len() < target {
            let next = self.key_pool.keys().next_back().map_or(1, |last| last + 1);
            self.push_pool_key(store, next, now)?;
            debug!(index = next, size = self.key_pool.len(), "key pool added key");
        }
        Ok(())
    }

    /// Take the oldest pooled key. The pool is topped up first when possible.
    /// `None` if the pool is empty and cannot be refilled.
    pub fn reserve_key(&mut self, store: &dyn WalletStore, now: u64) -> Result<Option<ReservedKey>, WalletError> {
        if !self.is_locked() {
            self.top_up_key_pool(store, 0, now)?;
        }
        let Some((index, entry)) = self.key_pool.pop_first() else {
            return Ok(None);
        };
        let reserved = ReservedKey { index, entry };
        if !self.have_key(&reserved.key_id()) {
            return Err(WalletError::KeyNotFound(format!("pool key {index}")));
        }
        debug!(index, "key pool reserve");
        Ok(Some(reserved))
    }

    /// Commit to a reserved key: it leaves the pool for good.
    pub fn keep_key(&mut self, store: &dyn WalletStore, reserved: &ReservedKey) -> Result<(), WalletError> {
        store.erase(&RecordKey::Pool(reserved.index))?;
        debug!(index = reserved.index, "key pool keep");
        Ok(())
    }

    /// Put a reserved key back.
    pub fn return_key(&mut self, reserved: ReservedKey) {
        debug!(index = reserved.index, "key pool return");
        self.key_pool.insert(reserved.index, reserved.entry);
    }

    /// A fresh receiving key: from the pool, else newly generated.
    pub fn key_from_pool(&mut self, store: &dyn WalletStore, now: u64) -> Result<PublicKey, WalletError> {
        match self.reserve_key(store, now)? {
            Some(reserved) => {
                self.keep_key(store, &reserved)?;
                PublicKey::from_bytes(&reserved.entry.public_key).map_err(WalletError::from)
            }
            None if self.is_locked() => Err(WalletError::KeypoolExhausted),
            None => self.generate_key(store, now),
        }
    }

    /// Creation time of the oldest pooled key, or `now` if the pool is empty.
    pub fn oldest_key_pool_time(&self, now: u64) -> u64 {
        self.key_pool.values().next().map_or(now, |entry| entry.time)
    }

    // --- loading --------------------------------------------------------

    /// Apply a key-related record read back from the store. Other record
    /// kinds are ignored.
    pub fn load_record(&mut self, record: WalletRecord) -> Result<(), WalletError> {
        match record {
            WalletRecord::Key {
                public_key,
                secret,
                metadata,
            } => {
                let keypair = KeyPair::from_secret_bytes(secret);
                if keypair.public_key().to_bytes() != public_key {
                    return Err(WalletError::Decryption("stored key does not match its public key".into()));
                }
                let id = keypair.key_id();
                self.note_key_time(metadata.create_time);
                self.metadata.insert(id, metadata);
                self.keys.insert(id, keypair);
            }
            WalletRecord::CryptedKey {
                public_key,
                crypted_secret,
                metadata,
            } => {
                let id = grc_core::crypto::key_id(&public_key);
                self.note_key_time(metadata.create_time);
                self.metadata.insert(id, metadata);
                self.crypted_keys.insert(id, CryptedKey {
                    public_key,
                    crypted: crypted_secret,
                });
            }
            WalletRecord::MasterKey { id, record } => {
                self.master_keys.insert(id, record);
            }
            WalletRecord::HdChain(chain) => self.hd_chain = Some(chain),
            WalletRecord::Pool { index, entry } => {
                self.key_pool.insert(index, entry);
            }
            WalletRecord::RedeemScript(script) => {
                self.redeem_scripts.insert(script.script_hash(), script);
            }
            WalletRecord::WatchOnly(script) => {
                self.watch_only.insert(script);
            }
            WalletRecord::Tx(_) | WalletRecord::OrderPosNext(_) | WalletRecord::Name { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryWalletStore, RecordKey, RecordKind, StoredRecord};
    use grc_core::crypto::verify_transaction_input;
    use std::sync::atomic::{AtomicBool, Ordering};
    use grc_core::types::{OutPoint, TxInput, TxOutput};

    fn options(use_hd: bool, keypool_size: usize) -> VaultOptions {
        VaultOptions {
            use_hd,
            keypool_size,
            kdf: KdfParams {
                target_ms: 1,
                memory_kib: 64,
                min_iterations: 1,
            },
        }
    }

    fn hd_vault(store: &MemoryWalletStore) -> KeyVault {
        let mut vault = KeyVault::new(options(true, 3));
        vault.set_hd_seed(store, &Seed::from_bytes([1; 32]), 100).unwrap();
        vault
    }

    fn spend(prev: &Script) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            inputs: vec![TxInput::unsigned(OutPoint::new(Hash256([3; 32]), 0))],
            outputs: vec![TxOutput::new(5, prev.clone())],
            lock_time: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn hd_keys_are_deterministic_and_sequential() {
        let store = MemoryWalletStore::new();
        let other_store = MemoryWalletStore::new();
        let mut a = hd_vault(&store);
        let mut b = hd_vault(&other_store);
        let ka = a.generate_key(&store, 100).unwrap();
        let kb = b.generate_key(&other_store, 100).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(a.hd_chain().unwrap().external_counter, 1);
        let meta = a.metadata(&ka.key_id()).unwrap();
        assert_eq!(meta.hd_keypath.as_deref(), Some("m/0'/0'/0'"));

        let (expected, _) = derive_external_key(&Seed::from_bytes([1; 32]), 1);
        assert_eq!(a.generate_key(&store, 100).unwrap(), expected.public_key());
    }

    #[test]
    fn hd_derivation_skips_known_children() {
        let store = MemoryWalletStore::new();
        let mut vault = hd_vault(&store);
        let (child0, _) = derive_external_key(&Seed::from_bytes([1; 32]), 0);
        vault.import_key(&store, child0.secret_bytes(), 50).unwrap();
        let next = vault.generate_key(&store, 100).unwrap();
        assert_ne!(next, child0.public_key());
        assert_eq!(vault.hd_chain().unwrap().external_counter, 2);
    }

    #[test]
    fn non_hd_keys_are_random() {
        let store = MemoryWalletStore::new();
        let mut vault = KeyVault::new(options(false, 0));
        let a = vault.generate_key(&store, 1).unwrap();
        let b = vault.generate_key(&store, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.count(RecordKind::Key), 2);
    }

    #[test]
    fn failed_write_leaves_vault_unchanged() {
        let store = MemoryWalletStore::new();
        let mut vault = KeyVault::new(options(false, 0));
        store.set_fail_writes(true);
        assert!(vault.generate_key(&store, 1).is_err());
        assert_eq!(vault.key_count(), 0);
    }

    #[test]
    fn encrypt_unlock_scenario() {
        let store = MemoryWalletStore::new();
        let mut vault = hd_vault(&store);
        let id = vault.generate_key(&store, 100).unwrap().key_id();
        vault.encrypt(&store, b"pw", 200).unwrap();
        assert_eq!(vault.state(), VaultState::Locked);

        assert!(!vault.unlock(b"wrong").unwrap());
        assert_eq!(vault.state(), VaultState::Locked);
        assert_eq!(vault.sign(&id, b"msg"), Err(WalletError::VaultLocked));

        assert!(vault.unlock(b"pw").unwrap());
        assert_eq!(vault.state(), VaultState::Unlocked);
        let sig = vault.sign(&id, b"msg").unwrap();
        vault.public_key(&id).unwrap().verify(b"msg", &sig).unwrap();
    }

    #[test]
    fn encryption_removes_plaintext_and_rewrites() {
        let store = MemoryWalletStore::new();
        let mut vault = KeyVault::new(options(false, 2));
        vault.generate_key(&store, 1).unwrap();
        vault.encrypt(&store, b"pw", 2).unwrap();
        assert_eq!(store.count(RecordKind::Key), 0);
        assert_eq!(store.count(RecordKind::CryptedKey), vault.key_count());
        assert_eq!(store.count(RecordKind::MasterKey), 1);
        assert_eq!(store.count(RecordKind::Pool), 2);
        assert_eq!(store.rewrite_count(), 1);
        assert_eq!(vault.encrypt(&store, b"pw", 3), Err(WalletError::AlreadyEncrypted));
    }

    /// Passes everything through until the first commit, then fails writes
    /// and rewrites.
    struct FailAfterCommit {
        inner: MemoryWalletStore,
        committed: AtomicBool,
        fail_rewrite_only: bool,
    }

    impl FailAfterCommit {
        fn new(fail_rewrite_only: bool) -> Self {
            Self {
                inner: MemoryWalletStore::new(),
                committed: AtomicBool::new(false),
                fail_rewrite_only,
            }
        }

        fn failing(&self) -> bool {
            self.committed.load(Ordering::SeqCst)
        }
    }

    impl WalletStore for FailAfterCommit {
        fn write(&self, record: &WalletRecord) -> Result<(), WalletError> {
            if self.failing() && !self.fail_rewrite_only {
                return Err(WalletError::Storage("disk full".into()));
            }
            self.inner.write(record)
        }

        fn erase(&self, key: &RecordKey) -> Result<(), WalletError> {
            self.inner.erase(key)
        }

        fn txn_begin(&self) -> Result<(), WalletError> {
            self.inner.txn_begin()
        }

        fn txn_commit(&self) -> Result<(), WalletError> {
            self.inner.txn_commit()?;
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn txn_abort(&self) -> Result<(), WalletError> {
            self.inner.txn_abort()
        }

        fn rewrite(&self) -> Result<(), WalletError> {
            if self.failing() {
                return Err(WalletError::Storage("compaction failed".into()));
            }
            self.inner.rewrite()
        }

        fn load_all(&self) -> Result<Vec<StoredRecord>, WalletError> {
            self.inner.load_all()
        }

        fn is_persistent(&self) -> bool {
            true
        }
    }

    #[test]
    fn failed_pool_refresh_still_locks() {
        let store = FailAfterCommit::new(false);
        let mut vault = KeyVault::new(options(true, 3));
        vault.set_hd_seed(&store, &Seed::from_bytes([1; 32]), 100).unwrap();

        let err = vault.encrypt(&store, b"pw", 200).unwrap_err();
        assert_eq!(err, WalletError::Storage("disk full".into()));
        assert_eq!(vault.state(), VaultState::Locked);
        assert!(matches!(vault.dump_keys(), Err(WalletError::VaultLocked)));
        assert_eq!(store.inner.count(RecordKind::Key), 0);
    }

    #[test]
    fn failed_rewrite_is_reported() {
        let store = FailAfterCommit::new(true);
        let mut vault = KeyVault::new(options(false, 2));
        vault.generate_key(&store, 1).unwrap();

        let err = vault.encrypt(&store, b"pw", 2).unwrap_err();
        assert_eq!(err, WalletError::Storage("compaction failed".into()));
        assert_eq!(vault.state(), VaultState::Locked);
        assert_eq!(store.inner.count(RecordKind::Pool), 2);
        assert!(vault.unlock(b"pw").unwrap());
    }

    #[test]
    fn encryption_replaces_hd_seed() {
        let store = MemoryWalletStore::new();
        let mut vault = hd_vault(&store);
        let old = vault.hd_chain().unwrap().master_key_id;
        vault.encrypt(&store, b"pw", 200).unwrap();
        assert_ne!(vault.hd_chain().unwrap().master_key_id, old);
        assert!(vault.have_key(&old));
    }

    #[test]
    fn locked_vault_refuses_generation() {
        let store = MemoryWalletStore::new();
        let mut vault = hd_vault(&store);
        vault.encrypt(&store, b"pw", 200).unwrap();
        assert_eq!(vault.generate_key(&store, 300), Err(WalletError::VaultLocked));
        assert!(matches!(vault.dump_keys(), Err(WalletError::VaultLocked)));
        vault.unlock(b"pw").unwrap();
        assert!(vault.generate_key(&store, 300).is_ok());
        vault.lock();
        assert!(vault.is_locked());
    }

    #[test]
    fn unlock_unencrypted_is_error() {
        let mut vault = KeyVault::new(options(false, 0));
        assert_eq!(vault.unlock(b"pw"), Err(WalletError::NotEncrypted));
    }

    #[test]
    fn change_passphrase_keeps_lock_state() {
        let store = MemoryWalletStore::new();
        let mut vault = KeyVault::new(options(false, 1));
        vault.generate_key(&store, 1).unwrap();
        vault.encrypt(&store, b"old", 2).unwrap();

        assert!(!vault.change_passphrase(&store, b"nope", b"new").unwrap());
        assert!(vault.change_passphrase(&store, b"old", b"new").unwrap());
        assert!(vault.is_locked());
        assert!(!vault.unlock(b"old").unwrap());
        assert!(vault.unlock(b"new").unwrap());

        assert!(vault.change_passphrase(&store, b"new", b"newer").unwrap());
        assert_eq!(vault.state(), VaultState::Unlocked);
    }

    #[test]
    fn classify_key_script_and_watch_only() {
        let store = MemoryWalletStore::new();
        let mut vault = KeyVault::new(options(false, 0));
        let id = vault.generate_key(&store, 1).unwrap().key_id();
        let mine = Script::PayToKeyHash(id);
        let p2sh = Script::PayToScriptHash(mine.script_hash());
        let other = Script::PayToKeyHash(Hash256([7; 32]));

        assert_eq!(vault.classify_script(&mine), IsMine::Spendable);
        assert_eq!(vault.classify_script(&p2sh), IsMine::No);
        vault.add_redeem_script(&store, mine.clone()).unwrap();
        assert_eq!(vault.classify_script(&p2sh), IsMine::Spendable);

        assert_eq!(vault.classify_script(&other), IsMine::No);
        vault.add_watch_only(&store, other.clone()).unwrap();
        assert_eq!(vault.classify_script(&other), IsMine::WatchOnly);
        assert_eq!(vault.classify_script(&Script::NullData(vec![1])), IsMine::No);
    }

    #[test]
    fn sign_input_produces_verifiable_signatures() {
        let store = MemoryWalletStore::new();
        let mut vault = KeyVault::new(options(false, 0));
        let id = vault.generate_key(&store, 1).unwrap().key_id();
        let p2pkh = Script::PayToKeyHash(id);
        let mut tx = spend(&p2pkh);
        vault.sign_input(&mut tx, 0, &p2pkh).unwrap();
        verify_transaction_input(&tx, 0, &p2pkh).unwrap();

        let p2sh = Script::PayToScriptHash(vault.add_redeem_script(&store, p2pkh.clone()).unwrap());
        let mut tx = spend(&p2sh);
        vault.sign_input(&mut tx, 0, &p2sh).unwrap();
        verify_transaction_input(&tx, 0, &p2sh).unwrap();
    }

    #[test]
    fn sign_input_for_foreign_key_is_signature_error() {
        let vault = KeyVault::new(options(false, 0));
        let script = Script::PayToKeyHash(Hash256([7; 32]));
        let mut tx = spend(&script);
        assert!(matches!(
            vault.sign_input(&mut tx, 0, &script),
            Err(WalletError::Signature(_))
        ));
        let mut tx = spend(&Script::NullData(vec![]));
        assert!(matches!(
            vault.sign_input(&mut tx, 0, &Script::NullData(vec![])),
            Err(WalletError::Signature(_))
        ));
    }

    #[test]
    fn sign_unknown_key_is_key_not_found() {
        let vault = KeyVault::new(options(false, 0));
        assert!(matches!(vault.sign(&Hash256([1; 32]), b"m"), Err(WalletError::KeyNotFound(_))));
    }

    #[test]
    fn key_pool_reserve_keep_return() {
        let store = MemoryWalletStore::new();
        let mut vault = hd_vault(&store);
        vault.new_key_pool(&store, 10).unwrap();
        assert_eq!(vault.key_pool_size(), 3);

        let reserved = vault.reserve_key(&store, 20).unwrap().unwrap();
        assert_eq!(reserved.index, 1);
        // Topped up before reserving, so one is gone from a full pool.
        assert_eq!(vault.key_pool_size(), 2);
        vault.return_key(reserved.clone());
        assert_eq!(vault.key_pool_size(), 3);

        let again = vault.reserve_key(&store, 20).unwrap().unwrap();
        assert_eq!(again, reserved);
        vault.keep_key(&store, &again).unwrap();
        assert!(store.get(&RecordKey::Pool(1)).is_none());
        assert_eq!(vault.oldest_key_pool_time(99), 10);
    }

    #[test]
    fn top_up_appends_after_highest_index() {
        let store = MemoryWalletStore::new();
        let mut vault = hd_vault(&store);
        vault.new_key_pool(&store, 10).unwrap();
        let first = vault.reserve_key(&store, 20).unwrap().unwrap();
        vault.keep_key(&store, &first).unwrap();
        vault.top_up_key_pool(&store, 0, 30).unwrap();
        assert_eq!(vault.key_pool_size(), 3);
        assert!(store.get(&RecordKey::Pool(4)).is_some());
    }

    #[test]
    fn locked_empty_pool_is_exhausted() {
        let store = MemoryWalletStore::new();
        let mut vault = KeyVault::new(options(false, 1));
        vault.encrypt(&store, b"pw", 1).unwrap();
        vault.key_from_pool(&store, 2).unwrap();
        assert_eq!(vault.key_from_pool(&store, 3), Err(WalletError::KeypoolExhausted));
        assert_eq!(vault.oldest_key_pool_time(42), 42);
    }

    #[test]
    fn dump_and_import_round_trip_birth_times() {
        let store = MemoryWalletStore::new();
        let mut vault = KeyVault::new(options(false, 0));
        let id = vault.generate_key(&store, 77).unwrap().key_id();
        let dumped = vault.dump_keys().unwrap();
        assert_eq!(dumped.len(), 1);
        assert!(format!("{:?}", dumped[0]).contains("REDACTED"));

        let mut other = KeyVault::new(options(false, 0));
        let imported = other.import_key(&store, *dumped[0].secret(), 55).unwrap();
        assert_eq!(imported, id);
        assert_eq!(other.key_birth_times().get(&id), Some(&55));
        assert_eq!(other.first_key_time(), Some(55));
    }

    #[test]
    fn reload_from_store_restores_encrypted_vault() {
        let store = MemoryWalletStore::new();
        let mut vault = hd_vault(&store);
        let id = vault.generate_key(&store, 100).unwrap().key_id();
        vault.encrypt(&store, b"pw", 200).unwrap();

        let mut reloaded = KeyVault::new(options(true, 3));
        for raw in store.load_all().unwrap() {
            reloaded.load_record(WalletRecord::decode(&raw.value).unwrap()).unwrap();
        }
        assert_eq!(reloaded.state(), VaultState::Locked);
        assert_eq!(reloaded.key_count(), vault.key_count());
        assert_eq!(reloaded.key_pool_size(), 3);
        assert!(reloaded.unlock(b"pw").unwrap());
        assert!(reloaded.sign(&id, b"x").is_ok());
    }
}
