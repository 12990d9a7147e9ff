//! Collections
//!
//! A collection is the storage tenant: its own dataspace table, keyval
//! table, attribute table, handle ledger, and position cache, all rooted in
//! one subtree of the storage directory. A process-wide registry owned by
//! the storage space tracks open collections by id and hands out
//! refcounted handles.

use crate::config::{StorageConfig, SyncPolicy};
use crate::storage::db::Db;
use crate::storage::layout::{CollectionId, StorageLayout};
use crate::storage::ledger::HandleLedger;
use crate::storage::Handle;
use crate::{Error, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Attribute keys the engine itself keeps in the collection attribute table
pub const VERSION_KEY: &[u8] = b"format-version";
pub const ROOT_HANDLE_KEY: &[u8] = b"root-handle";
pub const LAST_HANDLE_KEY: &[u8] = b"last-handle";

/// Continuation token for resumable iteration
pub type PositionToken = u64;

/// Cached cursor continuation state for one handle
struct Position {
    handle: Handle,
    /// Raw table key of the last entry returned
    last_key: Vec<u8>,
}

/// Per-collection cache of iteration continuation tokens
///
/// Tokens are random so a stale token from a prior mount cannot
/// accidentally resolve. Removing any entry under a handle drops that
/// handle's tokens; iteration promises progress, not a snapshot.
pub struct PositionCache {
    positions: Mutex<HashMap<PositionToken, Position>>,
}

impl PositionCache {
    pub fn new() -> Self {
        PositionCache {
            positions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, handle: Handle, last_key: Vec<u8>) -> PositionToken {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::thread_rng();
        loop {
            let token: PositionToken = rng.gen();
            if token != 0 && !positions.contains_key(&token) {
                positions.insert(token, Position { handle, last_key });
                return token;
            }
        }
    }

    /// Take a token's continuation key; tokens are single-use
    pub fn take(&self, token: PositionToken) -> Option<Vec<u8>> {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        positions.remove(&token).map(|p| p.last_key)
    }

    /// Drop every token under a handle
    pub fn invalidate_handle(&self, handle: Handle) {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        positions.retain(|_, p| p.handle != handle);
    }

    pub fn len(&self) -> usize {
        self.positions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for PositionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// One open collection
pub struct Collection {
    id: CollectionId,
    name: String,
    layout: StorageLayout,
    coll_attr_db: Arc<Db>,
    ds_attr_db: Arc<Db>,
    keyval_db: Arc<Db>,
    ledger: HandleLedger,
    position_cache: PositionCache,
    /// Unconfirmed keyval writes, retained until flush confirms durability
    pub(crate) write_cache: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    /// Serializes bytestream-size read-modify-writes on the attr record;
    /// concurrent writers must not clobber a larger committed size
    pub(crate) bstream_size_lock: Mutex<()>,
    sync_policy: SyncPolicy,
    sync_high_watermark: usize,
    immediate_completion: bool,
    key_max: usize,
    /// Set when an internal error leaves the collection needing recovery;
    /// all further writes are refused until the collection is re-opened
    recovery_needed: AtomicBool,
}

impl Collection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: CollectionId,
        name: String,
        layout: StorageLayout,
        coll_attr_db: Arc<Db>,
        ds_attr_db: Arc<Db>,
        keyval_db: Arc<Db>,
        ledger: HandleLedger,
        config: &StorageConfig,
    ) -> Self {
        Collection {
            id,
            name,
            layout,
            coll_attr_db,
            ds_attr_db,
            keyval_db,
            ledger,
            position_cache: PositionCache::new(),
            write_cache: Mutex::new(HashMap::new()),
            bstream_size_lock: Mutex::new(()),
            sync_policy: config.sync_policy,
            sync_high_watermark: config.sync_high_watermark,
            immediate_completion: config.immediate_completion,
            key_max: config.key_max,
            recovery_needed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn ledger(&self) -> &HandleLedger {
        &self.ledger
    }

    pub fn position_cache(&self) -> &PositionCache {
        &self.position_cache
    }

    pub(crate) fn coll_attr_db(&self) -> &Arc<Db> {
        &self.coll_attr_db
    }

    pub(crate) fn ds_attr_db(&self) -> &Arc<Db> {
        &self.ds_attr_db
    }

    pub(crate) fn keyval_db(&self) -> &Arc<Db> {
        &self.keyval_db
    }

    pub fn immediate_completion(&self) -> bool {
        self.immediate_completion
    }

    pub(crate) fn key_max(&self) -> usize {
        self.key_max
    }

    /// Root handle recorded at creation time, if any
    pub fn root_handle(&self) -> Option<Handle> {
        let bytes = self.coll_attr_db.get(ROOT_HANDLE_KEY).ok()?;
        let array: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_be_bytes(array))
    }

    /// Store an engine bookkeeping attribute
    pub fn put_attr(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.coll_attr_db.put(key, value)?;
        self.maybe_sync(&self.coll_attr_db)
    }

    pub fn get_attr(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.coll_attr_db.get(key)
    }

    /// Apply the collection's metadata sync policy after a write
    pub(crate) fn maybe_sync(&self, db: &Db) -> Result<()> {
        match self.sync_policy {
            SyncPolicy::Always => db.sync(),
            SyncPolicy::Never => Ok(()),
            SyncPolicy::Coalesce => {
                if db.pending_writes() >= self.sync_high_watermark as u64 {
                    db.sync()
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Refuse writes once recovery is needed
    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.recovery_needed.load(Ordering::Acquire) {
            return Err(Error::Internal(format!(
                "collection {:08x} needs recovery; writes refused",
                self.id
            )));
        }
        Ok(())
    }

    /// Mark the collection as needing recovery
    pub(crate) fn mark_recovery_needed(&self) {
        tracing::error!(collection = self.id, "collection marked recovery-needed");
        self.recovery_needed.store(true, Ordering::Release);
    }

    pub fn needs_recovery(&self) -> bool {
        self.recovery_needed.load(Ordering::Acquire)
    }

    /// Flush every table of this collection to durable storage
    pub fn sync_all(&self) -> Result<()> {
        self.coll_attr_db.sync()?;
        self.ds_attr_db.sync()?;
        self.keyval_db.sync()?;
        let mut cache = self.write_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
        Ok(())
    }
}

/// Process-wide table of open collections
pub struct CollectionRegistry {
    collections: RwLock<HashMap<CollectionId, Arc<Collection>>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        CollectionRegistry {
            collections: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, collection: Arc<Collection>) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if collections.contains_key(&collection.id()) {
            return Err(Error::Exists);
        }
        collections.insert(collection.id(), collection);
        Ok(())
    }

    pub fn lookup(&self, id: CollectionId) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: CollectionId) -> Option<Arc<Collection>> {
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    pub fn ids(&self) -> Vec<CollectionId> {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CollectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_cache_roundtrip() {
        let cache = PositionCache::new();
        let token = cache.store(7, b"key-a".to_vec());
        assert_ne!(token, 0);
        assert_eq!(cache.take(token).unwrap(), b"key-a");
        // Tokens are single-use.
        assert!(cache.take(token).is_none());
    }

    #[test]
    fn test_position_cache_invalidate_handle() {
        let cache = PositionCache::new();
        let t1 = cache.store(7, b"a".to_vec());
        let t2 = cache.store(8, b"b".to_vec());
        cache.invalidate_handle(7);
        assert!(cache.take(t1).is_none());
        assert_eq!(cache.take(t2).unwrap(), b"b");
    }

    #[test]
    fn test_registry_insert_lookup_remove() {
        use crate::config::StorageConfig;
        use crate::storage::db::KeyOrder;
        use crate::storage::ledger::Extent;
        use std::time::Duration;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path(), 64);
        let config = StorageConfig::default();

        std::fs::create_dir_all(layout.coll_dir(1)).unwrap();
        let coll = Arc::new(Collection::new(
            1,
            "fs0".into(),
            layout.clone(),
            Db::open(&layout.coll_attr_table(1), KeyOrder::Lexicographic, true).unwrap(),
            Db::open(&layout.ds_attr_table(1), KeyOrder::DsAttr, true).unwrap(),
            Db::open(&layout.keyval_table(1), KeyOrder::Keyval, true).unwrap(),
            HandleLedger::new(vec![Extent::new(1, 100)], Duration::from_secs(2)),
            &config,
        ));

        let registry = CollectionRegistry::new();
        registry.insert(Arc::clone(&coll)).unwrap();
        assert_eq!(registry.insert(coll).unwrap_err(), Error::Exists);
        assert_eq!(registry.lookup(1).unwrap().name(), "fs0");
        assert!(registry.lookup(2).is_none());
        assert!(registry.remove(1).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_recovery_gate() {
        use crate::config::StorageConfig;
        use crate::storage::db::KeyOrder;
        use crate::storage::ledger::Extent;
        use std::time::Duration;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path(), 64);
        std::fs::create_dir_all(layout.coll_dir(2)).unwrap();
        let coll = Collection::new(
            2,
            "fs1".into(),
            layout.clone(),
            Db::open(&layout.coll_attr_table(2), KeyOrder::Lexicographic, true).unwrap(),
            Db::open(&layout.ds_attr_table(2), KeyOrder::DsAttr, true).unwrap(),
            Db::open(&layout.keyval_table(2), KeyOrder::Keyval, true).unwrap(),
            HandleLedger::new(vec![Extent::new(1, 10)], Duration::from_secs(2)),
            &StorageConfig::default(),
        );

        coll.put_attr(b"ok", b"1").unwrap();
        coll.mark_recovery_needed();
        assert!(coll.needs_recovery());
        assert!(matches!(
            coll.put_attr(b"nope", b"1").unwrap_err(),
            Error::Internal(_)
        ));
    }
}
