//! Thread-Safe Document Store with CAS and Expiry
//!
//! This module implements the storage behind [`MemoryBackend`]: a sharded
//! map from document key to value plus the metadata legacy clients see
//! (flags, datatype, CAS, expiry).
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: keys are spread over 64 shards, each behind its own `RwLock`.
//! 2. **Lazy Expiry**: expired documents are treated as missing on access and
//!    removed; a background sweeper removes the ones nobody touches.
//! 3. **CAS**: every mutation takes a fresh value from one monotonic counter, so
//!    a CAS never repeats within a store.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! │                  next_cas: AtomicU64                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`MemoryBackend`]: crate::backend::MemoryBackend

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// A stored document and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub value: Bytes,
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
    /// When this document expires (None = never expires)
    pub expires_at: Option<Instant>,
}

impl StoredDocument {
    /// Checks if this document has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }
}

/// A write to apply with [`StorageEngine::upsert`].
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    pub value: Bytes,
    pub flags: u32,
    pub datatype: u8,
    pub expires_at: Option<Instant>,
    /// Required current CAS; 0 writes unconditionally.
    pub cas: u64,
    /// Keep the existing document's expiry instead of `expires_at`.
    pub preserve_ttl: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,

    #[error("document CAS does not match")]
    CasMismatch,
}

/// Statistics about the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    pub expired: u64,
}

#[derive(Debug)]
struct Shard {
    data: RwLock<HashMap<Bytes, StoredDocument>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

/// A sharded, CAS-versioned document store.
///
/// Designed to be wrapped in an `Arc` and shared by every connection task.
///
/// # Example
///
/// ```
/// use kvbridge::storage::{Mutation, StorageEngine, StoreError};
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
///
/// let cas = engine
///     .upsert(Bytes::from("name"), Mutation { value: Bytes::from("Ariz"), ..Default::default() })
///     .unwrap();
/// assert_eq!(engine.get(&Bytes::from("name")).unwrap().cas, cas);
///
/// // A stale CAS is rejected
/// let stale = Mutation { value: Bytes::from("x"), cas: cas + 1, ..Default::default() };
/// assert_eq!(engine.upsert(Bytes::from("name"), stale), Err(StoreError::CasMismatch));
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,
    next_cas: AtomicU64,
    key_count: AtomicU64,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::new()).collect();

        // CAS values start at the current time in nanoseconds
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);

        Self {
            shards,
            next_cas: AtomicU64::new(seed),
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn get_shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    #[inline]
    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_expired(&self, count: u64) {
        self.key_count.fetch_sub(count, Ordering::Relaxed);
        self.expired_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Gets a document.
    ///
    /// Returns `None` if the key doesn't exist or has expired. Expired
    /// documents are removed on access.
    pub fn get(&self, key: &Bytes) -> Option<StoredDocument> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);

        // Fast path under the read lock
        {
            let data = shard.data.read();
            match data.get(key) {
                Some(doc) if !doc.is_expired() => return Some(doc.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut data = shard.data.write();
        match data.get(key) {
            Some(doc) if doc.is_expired() => {
                data.remove(key);
                self.record_expired(1);
                None
            }
            // Another writer replaced it in between
            Some(doc) => Some(doc.clone()),
            None => None,
        }
    }

    /// Creates or replaces a document and returns its new CAS.
    ///
    /// With a non-zero `mutation.cas` the document must exist and carry that
    /// CAS.
    pub fn upsert(&self, key: Bytes, mutation: Mutation) -> Result<u64, StoreError> {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(&key);
        let mut data = shard.data.write();

        let existing = data.get(&key).filter(|doc| !doc.is_expired());
        if mutation.cas != 0 {
            match existing {
                None => return Err(StoreError::NotFound),
                Some(doc) if doc.cas != mutation.cas => return Err(StoreError::CasMismatch),
                Some(_) => {}
            }
        }

        let expires_at = match existing {
            Some(doc) if mutation.preserve_ttl => doc.expires_at,
            _ => mutation.expires_at,
        };

        let cas = self.next_cas();
        let previous = data.insert(
            key,
            StoredDocument {
                value: mutation.value,
                flags: mutation.flags,
                datatype: mutation.datatype,
                cas,
                expires_at,
            },
        );

        if previous.is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }

        Ok(cas)
    }

    /// Removes a document and returns the CAS of the deletion.
    ///
    /// With a non-zero `cas` the document must carry that CAS.
    pub fn remove(&self, key: &Bytes, cas: u64) -> Result<u64, StoreError> {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);
        let mut data = shard.data.write();

        match data.get(key) {
            None => return Err(StoreError::NotFound),
            Some(doc) if doc.is_expired() => {
                data.remove(key);
                self.record_expired(1);
                return Err(StoreError::NotFound);
            }
            Some(doc) if cas != 0 && doc.cas != cas => return Err(StoreError::CasMismatch),
            Some(_) => {}
        }

        data.remove(key);
        self.key_count.fetch_sub(1, Ordering::Relaxed);
        Ok(self.next_cas())
    }

    /// Returns the approximate number of documents, expired ones included
    /// until they are swept.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Removes expired documents from all shards.
    ///
    /// Called by the background expiry sweeper. Returns the number removed.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut data = shard.data.write();
            let before = data.len();
            data.retain(|_, doc| !doc.is_expired());
            cleaned += (before - data.len()) as u64;
        }

        if cleaned > 0 {
            self.record_expired(cleaned);
        }

        cleaned
    }
}
