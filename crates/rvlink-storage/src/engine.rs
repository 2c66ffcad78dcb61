//! Database lifecycle, key management and transaction scopes.
//!
//! [`ClientDb`] owns the sled database and the derived value key. Reads
//! and writes happen inside [`Tx`] scopes:
//!
//! - [`ClientDb::view`] runs a closure with a read-only [`Tx`]. Any
//!   number of views may run concurrently.
//! - [`ClientDb::update`] runs a closure with a writable [`Tx`]. Writes
//!   are buffered in the transaction and applied as one sled batch only
//!   if the closure returns `Ok`. Updates are serialized with each other
//!   and with views, so a view never observes half of an update.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use rvlink_crypto::aead;
use rvlink_crypto::hkdf::derive_key32;
use rvlink_types::{Result, RvlinkError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Required master key length in bytes.
const KEY_LEN: usize = 32;

/// HKDF salt for deriving sub-keys from the master key.
const HKDF_SALT: &[u8] = b"rvlink-clientdb";

/// HKDF info for the value encryption sub-key.
const HKDF_INFO_ENC: &[u8] = b"value encryption";

/// Name of the sled tree holding every record.
const TREE_NAME: &str = "clientdb";

// ---------------------------------------------------------------------------
// DerivedKeys
// ---------------------------------------------------------------------------

#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKeys {
    enc_key: [u8; 32],
}

impl DerivedKeys {
    fn derive(master_key: &[u8; 32]) -> Result<Self> {
        Ok(Self {
            enc_key: derive_key32(master_key, HKDF_SALT, HKDF_INFO_ENC)?,
        })
    }
}

fn storage_err(what: &str, e: impl std::fmt::Display) -> RvlinkError {
    RvlinkError::Storage {
        reason: format!("{what}: {e}"),
    }
}

// ---------------------------------------------------------------------------
// ClientDb
// ---------------------------------------------------------------------------

/// Encrypted client database backed by sled.
pub struct ClientDb {
    db: sled::Db,
    tree: sled::Tree,
    keys: DerivedKeys,
    lock: RwLock<()>,
}

impl ClientDb {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::Config`] if `master_key` is not 32 bytes.
    /// - [`RvlinkError::Storage`] if sled cannot open the database.
    pub fn open(path: &Path, master_key: &[u8]) -> Result<Self> {
        let db = sled::open(path).map_err(|e| storage_err("failed to open sled database", e))?;
        Self::from_sled(db, master_key)
    }

    /// Opens a throwaway database removed on drop.
    pub fn open_temporary(master_key: &[u8]) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| storage_err("failed to open temporary database", e))?;
        Self::from_sled(db, master_key)
    }

    fn from_sled(db: sled::Db, master_key: &[u8]) -> Result<Self> {
        if master_key.len() != KEY_LEN {
            return Err(RvlinkError::Config {
                reason: format!(
                    "database key must be {KEY_LEN} bytes, got {}",
                    master_key.len()
                ),
            });
        }
        let mut master = [0u8; 32];
        master.copy_from_slice(master_key);
        let keys = DerivedKeys::derive(&master);
        master.zeroize();
        let keys = keys?;

        let tree = db
            .open_tree(TREE_NAME)
            .map_err(|e| storage_err("failed to open tree", e))?;

        Ok(Self {
            db,
            tree,
            keys,
            lock: RwLock::new(()),
        })
    }

    /// Runs `f` inside a read-only transaction.
    pub fn view<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Tx<'_>) -> Result<R>,
    {
        let _guard = self
            .lock
            .read()
            .map_err(|_| storage_err("database lock", "poisoned"))?;
        let tx = Tx {
            db: &self.db,
            tree: &self.tree,
            keys: &self.keys,
            writes: None,
        };
        f(&tx)
    }

    /// Runs `f` inside a read-write transaction. Writes commit atomically
    /// when `f` returns `Ok` and are discarded otherwise.
    pub fn update<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<R>,
    {
        let _guard = self
            .lock
            .write()
            .map_err(|_| storage_err("database lock", "poisoned"))?;
        let mut tx = Tx {
            db: &self.db,
            tree: &self.tree,
            keys: &self.keys,
            writes: Some(BTreeMap::new()),
        };
        let out = f(&mut tx)?;

        let writes = tx.writes.take().unwrap_or_default();
        if writes.is_empty() {
            return Ok(out);
        }
        let count = writes.len();
        let mut batch = sled::Batch::default();
        for (key, value) in writes {
            match value {
                Some(v) => batch.insert(key, v),
                None => batch.remove(key),
            }
        }
        self.tree
            .apply_batch(batch)
            .map_err(|e| storage_err("failed to commit transaction", e))?;
        tracing::trace!(count, "transaction committed");
        Ok(out)
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| storage_err("failed to flush database", e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tx
// ---------------------------------------------------------------------------

/// A transaction scope. Typed accessors for each record family are
/// implemented in the sibling modules.
pub struct Tx<'a> {
    db: &'a sled::Db,
    tree: &'a sled::Tree,
    keys: &'a DerivedKeys,
    /// Buffered writes; `None` for read-only transactions. A `None`
    /// value marks a deletion.
    writes: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl<'a> Tx<'a> {
    fn raw_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.as_ref().and_then(|w| w.get(key)) {
            return Ok(pending.clone());
        }
        let raw = self
            .tree
            .get(key)
            .map_err(|e| storage_err("sled get failed", e))?;
        Ok(raw.map(|v| v.to_vec()))
    }

    fn writes_mut(&mut self) -> Result<&mut BTreeMap<Vec<u8>, Option<Vec<u8>>>> {
        self.writes.as_mut().ok_or_else(|| RvlinkError::Storage {
            reason: "write attempted in a read-only transaction".into(),
        })
    }

    fn encrypt_value<T: Serialize>(&self, key: &[u8], value: &T) -> Result<Vec<u8>> {
        let plaintext =
            bincode::serialize(value).map_err(|e| storage_err("bincode serialization failed", e))?;
        aead::seal(&self.keys.enc_key, &plaintext, key)
    }

    fn decrypt_value<T: DeserializeOwned>(&self, key: &[u8], raw: &[u8]) -> Result<T> {
        let plaintext = aead::open(&self.keys.enc_key, raw, key).map_err(|_| {
            RvlinkError::Storage {
                reason: format!(
                    "failed to decrypt value at {}",
                    String::from_utf8_lossy(key)
                ),
            }
        })?;
        bincode::deserialize(&plaintext)
            .map_err(|e| storage_err("bincode deserialization failed", e))
    }

    /// Reads and decrypts a value.
    pub(crate) fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.raw_get(key.as_bytes())? {
            Some(raw) => Ok(Some(self.decrypt_value(key.as_bytes(), &raw)?)),
            None => Ok(None),
        }
    }

    /// Encrypts and buffers a value.
    pub(crate) fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let encrypted = self.encrypt_value(key.as_bytes(), value)?;
        self.writes_mut()?
            .insert(key.as_bytes().to_vec(), Some(encrypted));
        Ok(())
    }

    /// Buffers a deletion. Returns whether the key existed.
    pub(crate) fn delete(&mut self, key: &str) -> Result<bool> {
        let existed = self.raw_get(key.as_bytes())?.is_some();
        self.writes_mut()?.insert(key.as_bytes().to_vec(), None);
        Ok(existed)
    }

    pub(crate) fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.raw_get(key.as_bytes())?.is_some())
    }

    /// Returns all `(key, value)` pairs under `prefix`, including writes
    /// buffered in this transaction, in key order.
    pub(crate) fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item.map_err(|e| storage_err("sled scan_prefix failed", e))?;
            merged.insert(key.to_vec(), value.to_vec());
        }
        if let Some(writes) = &self.writes {
            for (key, value) in writes.range(prefix.as_bytes().to_vec()..) {
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                match value {
                    Some(v) => merged.insert(key.clone(), v.clone()),
                    None => merged.remove(key),
                };
            }
        }

        let mut out = Vec::with_capacity(merged.len());
        for (key, raw) in merged {
            let value = self.decrypt_value(&key, &raw)?;
            let key = String::from_utf8(key).map_err(|e| storage_err("non-utf8 key", e))?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Deletes every key under `prefix`. Returns how many were removed.
    pub(crate) fn delete_prefix(&mut self, prefix: &str) -> Result<usize> {
        let keys = self.scan_keys(prefix)?;
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }

    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = std::collections::BTreeSet::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item.map_err(|e| storage_err("sled scan_prefix failed", e))?;
            keys.insert(key.to_vec());
        }
        if let Some(writes) = &self.writes {
            for (key, value) in writes.range(prefix.as_bytes().to_vec()..) {
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                if value.is_some() {
                    keys.insert(key.clone());
                } else {
                    keys.remove(key);
                }
            }
        }
        keys.into_iter()
            .map(|k| String::from_utf8(k).map_err(|e| storage_err("non-utf8 key", e)))
            .collect()
    }

    /// Returns a database-unique, monotonically increasing id.
    pub(crate) fn next_id(&self) -> Result<u64> {
        self.db
            .generate_id()
            .map_err(|e| storage_err("failed to generate id", e))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
