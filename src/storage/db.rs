//! Key-value table abstraction
//!
//! A thin ordered-table layer between the storage engine and its backing
//! store, so the engine never touches backend specifics directly. The
//! engine stores two key shapes and therefore needs two comparison methods,
//! selected at open time; attribute tables use plain lexicographic order.
//!
//! The backend is an in-process ordered tree persisted by atomic snapshot:
//! mutations mark the table dirty, and `sync` serializes the table to a
//! temporary file, fsyncs it, and renames it over the previous snapshot.
//! Readers and writers share an `RwLock`, so concurrent lookups proceed in
//! parallel with each other.
//!
//! Cursors address the live table by key position rather than holding any
//! lock, so iteration makes progress under concurrent insertion but does
//! not see a consistent snapshot.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Size of the handle field inside a keyval-shaped key
pub const KEY_HANDLE_SIZE: usize = 16;

/// Minimum size of a keyval-shaped key: handle plus type byte
pub const KEY_HEADER_SIZE: usize = KEY_HANDLE_SIZE + 1;

/// Key comparison method for a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOrder {
    /// Plain byte-lexicographic order (attribute and name tables)
    Lexicographic,
    /// Dataspace attribute keys: a handle compared numerically
    DsAttr,
    /// Keyval keys: handle, then type byte, then key length, then key bytes
    Keyval,
}

fn compare_keys(order: KeyOrder, a: &[u8], b: &[u8]) -> CmpOrdering {
    match order {
        KeyOrder::Lexicographic => a.cmp(b),
        // The handle is stored big-endian and fixed-width, so byte order is
        // numeric order.
        KeyOrder::DsAttr => a.cmp(b),
        KeyOrder::Keyval => {
            debug_assert!(a.len() >= KEY_HEADER_SIZE && b.len() >= KEY_HEADER_SIZE);
            let handle = a[..KEY_HANDLE_SIZE].cmp(&b[..KEY_HANDLE_SIZE]);
            if handle != CmpOrdering::Equal {
                return handle;
            }
            let type_byte = a[KEY_HANDLE_SIZE].cmp(&b[KEY_HANDLE_SIZE]);
            if type_byte != CmpOrdering::Equal {
                return type_byte;
            }
            let len = a.len().cmp(&b.len());
            if len != CmpOrdering::Equal {
                return len;
            }
            a[KEY_HEADER_SIZE..].cmp(&b[KEY_HEADER_SIZE..])
        }
    }
}

/// Key wrapper carrying the table's comparison method
#[derive(Debug, Clone, Eq, PartialEq)]
struct TableKey {
    order: KeyOrder,
    bytes: Vec<u8>,
}

impl Ord for TableKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        compare_keys(self.order, &self.bytes, &other.bytes)
    }
}

impl PartialOrd for TableKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// One ordered key-value table
#[derive(Debug)]
pub struct Db {
    path: PathBuf,
    order: KeyOrder,
    tree: RwLock<BTreeMap<TableKey, Vec<u8>>>,
    /// Mutations since the last successful sync
    pending: AtomicU64,
}

impl Db {
    /// Open a table, creating it when `create` is set
    ///
    /// Opening with `create` fails `Exists` if the table is already on
    /// disk; opening without it fails `NotFound` if it is not.
    pub fn open(path: &Path, order: KeyOrder, create: bool) -> Result<Arc<Db>> {
        let exists = path.exists();
        if create && exists {
            return Err(Error::Exists);
        }
        if !create && !exists {
            return Err(Error::NotFound);
        }

        let mut tree = BTreeMap::new();
        if exists {
            let bytes = fs::read(path)?;
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = bincode::deserialize(&bytes)
                .map_err(|e| Error::Internal(format!("table {} corrupt: {}", path.display(), e)))?;
            for (key, value) in pairs {
                tree.insert(TableKey { order, bytes: key }, value);
            }
        }

        let db = Arc::new(Db {
            path: path.to_path_buf(),
            order,
            tree: RwLock::new(tree),
            pending: AtomicU64::new(0),
        });
        if create {
            // Materialize the empty table so a later non-create open works.
            db.sync()?;
        }
        Ok(db)
    }

    pub fn order(&self) -> KeyOrder {
        self.order
    }

    fn key(&self, bytes: &[u8]) -> TableKey {
        TableKey {
            order: self.order,
            bytes: bytes.to_vec(),
        }
    }

    /// Retrieve the value for a key
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.get(&self.key(key)).cloned().ok_or(Error::NotFound)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.contains_key(&self.key(key))
    }

    /// Store a value, overwriting any previous one
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        tree.insert(self.key(key), value.to_vec());
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Store a value, failing `Exists` if the key is present
    pub fn put_once(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        let entry = self.key(key);
        if tree.contains_key(&entry) {
            return Err(Error::Exists);
        }
        tree.insert(entry, value.to_vec());
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Store a batch as a unit: all keys are validated first, so the table
    /// is unchanged if any insertion would fail
    pub fn put_list(&self, pairs: &[(Vec<u8>, Vec<u8>)], once: bool) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        if once {
            for (key, _) in pairs {
                if tree.contains_key(&self.key(key)) {
                    return Err(Error::Exists);
                }
            }
        }
        for (key, value) in pairs {
            tree.insert(self.key(key), value.clone());
        }
        self.pending.fetch_add(pairs.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a key
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        tree.remove(&self.key(key)).ok_or(Error::NotFound)?;
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a batch as a unit; the table is unchanged unless every key
    /// exists
    pub fn del_list(&self, keys: &[Vec<u8>]) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if !tree.contains_key(&self.key(key)) {
                return Err(Error::NotFound);
            }
        }
        for key in keys {
            tree.remove(&self.key(key));
        }
        self.pending.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutations since the last successful sync
    pub fn pending_writes(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    /// Write the table to durable storage
    ///
    /// Snapshot is written to a sibling temp file, fsynced, and renamed
    /// over the previous snapshot, so a crash mid-sync leaves the old
    /// snapshot intact.
    pub fn sync(&self) -> Result<()> {
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = {
            let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
            tree.iter()
                .map(|(k, v)| (k.bytes.clone(), v.clone()))
                .collect()
        };
        let encoded = bincode::serialize(&pairs)
            .map_err(|e| Error::Internal(format!("table encode: {}", e)))?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.pending.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Open a cursor positioned before the first key
    pub fn cursor(self: &Arc<Self>) -> DbCursor {
        DbCursor {
            db: Arc::clone(self),
            position: None,
        }
    }

    /// First key at or after `key`, with its value
    fn ceiling(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.range((Bound::Included(self.key(key)), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
    }

    /// First key strictly after `key`, with its value
    fn higher(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.range((Bound::Excluded(self.key(key)), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
    }

    fn first(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.iter()
            .next()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
    }
}

/// Which key a cursor read targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorOp {
    /// First key in the table
    First,
    /// The key after the last one returned
    Next,
    /// The last key returned
    Current,
    /// Exactly the given key
    Set(Vec<u8>),
    /// The first key at or after the given key
    SetRange(Vec<u8>),
}

/// Iteration position over a table
///
/// The cursor remembers the last key it returned and addresses the live
/// table by key order; it holds no lock between calls.
pub struct DbCursor {
    db: Arc<Db>,
    position: Option<Vec<u8>>,
}

impl DbCursor {
    /// Read the key/value the op selects and advance the cursor there
    pub fn get(&mut self, op: CursorOp) -> Result<(Vec<u8>, Vec<u8>)> {
        let found = match op {
            CursorOp::First => self.db.first(),
            CursorOp::Next => match &self.position {
                Some(position) => self.db.higher(position),
                None => self.db.first(),
            },
            CursorOp::Current => match &self.position {
                Some(position) => self
                    .db
                    .get(position)
                    .ok()
                    .map(|value| (position.clone(), value)),
                None => None,
            },
            CursorOp::Set(key) => self.db.get(&key).ok().map(|value| (key, value)),
            CursorOp::SetRange(key) => self.db.ceiling(&key),
        };
        match found {
            Some((key, value)) => {
                self.position = Some(key.clone());
                Ok((key, value))
            }
            None => Err(Error::NotFound),
        }
    }

    /// Delete the key the cursor currently rests on
    pub fn delete(&mut self) -> Result<()> {
        let position = self.position.clone().ok_or(Error::NotFound)?;
        self.db.del(&position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp(order: KeyOrder) -> (TempDir, Arc<Db>) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("table"), order, true).unwrap();
        (dir, db)
    }

    #[test]
    fn test_put_get_del() {
        let (_dir, db) = open_tmp(KeyOrder::Lexicographic);
        db.put(b"alpha", b"1").unwrap();
        assert_eq!(db.get(b"alpha").unwrap(), b"1");
        db.put(b"alpha", b"2").unwrap();
        assert_eq!(db.get(b"alpha").unwrap(), b"2");
        db.del(b"alpha").unwrap();
        assert_eq!(db.get(b"alpha").unwrap_err(), Error::NotFound);
        assert_eq!(db.del(b"alpha").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_put_once() {
        let (_dir, db) = open_tmp(KeyOrder::Lexicographic);
        db.put_once(b"k", b"v").unwrap();
        assert_eq!(db.put_once(b"k", b"w").unwrap_err(), Error::Exists);
        assert_eq!(db.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_put_list_atomic() {
        let (_dir, db) = open_tmp(KeyOrder::Lexicographic);
        db.put(b"taken", b"x").unwrap();

        let batch = vec![
            (b"new".to_vec(), b"1".to_vec()),
            (b"taken".to_vec(), b"2".to_vec()),
        ];
        assert_eq!(db.put_list(&batch, true).unwrap_err(), Error::Exists);
        // Nothing from the failed batch landed.
        assert_eq!(db.get(b"new").unwrap_err(), Error::NotFound);

        db.put_list(&batch, false).unwrap();
        assert_eq!(db.get(b"taken").unwrap(), b"2");
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table");
        {
            let db = Db::open(&path, KeyOrder::Lexicographic, true).unwrap();
            db.put(b"persist", b"me").unwrap();
            assert_eq!(db.pending_writes(), 1);
            db.sync().unwrap();
            assert_eq!(db.pending_writes(), 0);
        }
        let db = Db::open(&path, KeyOrder::Lexicographic, false).unwrap();
        assert_eq!(db.get(b"persist").unwrap(), b"me");
    }

    #[test]
    fn test_open_create_semantics() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table");
        assert_eq!(
            Db::open(&path, KeyOrder::Lexicographic, false).unwrap_err(),
            Error::NotFound
        );
        let _db = Db::open(&path, KeyOrder::Lexicographic, true).unwrap();
        assert_eq!(
            Db::open(&path, KeyOrder::Lexicographic, true).unwrap_err(),
            Error::Exists
        );
    }

    fn keyval_key(handle: u64, type_byte: u8, key: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; KEY_HANDLE_SIZE];
        out[8..16].copy_from_slice(&handle.to_be_bytes());
        out.push(type_byte);
        out.extend_from_slice(key);
        out
    }

    #[test]
    fn test_keyval_order() {
        let (_dir, db) = open_tmp(KeyOrder::Keyval);
        // Inserted out of order on purpose.
        db.put(&keyval_key(1, b'd', b"b"), b"3").unwrap();
        db.put(&keyval_key(1, b'd', b"a"), b"2").unwrap();
        db.put(&keyval_key(1, b'a', b"z"), b"1").unwrap();
        db.put(&keyval_key(2, b'd', b"a"), b"4").unwrap();

        let mut cursor = db.cursor();
        let mut values = Vec::new();
        let mut op = CursorOp::First;
        while let Ok((_k, v)) = cursor.get(op.clone()) {
            values.push(v);
            op = CursorOp::Next;
        }
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
    }

    #[test]
    fn test_keyval_length_before_bytes() {
        let (_dir, db) = open_tmp(KeyOrder::Keyval);
        // "z" is shorter than "aa", so it sorts first despite byte order.
        db.put(&keyval_key(1, b'd', b"aa"), b"long").unwrap();
        db.put(&keyval_key(1, b'd', b"z"), b"short").unwrap();

        let mut cursor = db.cursor();
        let (_k, first) = cursor.get(CursorOp::First).unwrap();
        assert_eq!(first, b"short");
    }

    #[test]
    fn test_cursor_set_range_and_delete() {
        let (_dir, db) = open_tmp(KeyOrder::Lexicographic);
        db.put(b"a", b"1").unwrap();
        db.put(b"c", b"2").unwrap();
        db.put(b"e", b"3").unwrap();

        let mut cursor = db.cursor();
        let (key, value) = cursor.get(CursorOp::SetRange(b"b".to_vec())).unwrap();
        assert_eq!(key, b"c");
        assert_eq!(value, b"2");

        cursor.delete().unwrap();
        assert_eq!(db.get(b"c").unwrap_err(), Error::NotFound);

        // Next from the deleted position continues past it.
        let (key, _) = cursor.get(CursorOp::Next).unwrap();
        assert_eq!(key, b"e");
    }

    #[test]
    fn test_cursor_progress_under_insertion() {
        let (_dir, db) = open_tmp(KeyOrder::Lexicographic);
        db.put(b"a", b"1").unwrap();
        db.put(b"m", b"2").unwrap();

        let mut cursor = db.cursor();
        cursor.get(CursorOp::First).unwrap();

        // Insert behind and ahead of the cursor.
        db.put(b"0", b"behind").unwrap();
        db.put(b"z", b"ahead").unwrap();

        let (key, _) = cursor.get(CursorOp::Next).unwrap();
        assert_eq!(key, b"m");
        let (key, _) = cursor.get(CursorOp::Next).unwrap();
        assert_eq!(key, b"z");
    }

    #[test]
    fn test_del_list_atomic() {
        let (_dir, db) = open_tmp(KeyOrder::Lexicographic);
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();

        let missing = vec![b"a".to_vec(), b"nope".to_vec()];
        assert_eq!(db.del_list(&missing).unwrap_err(), Error::NotFound);
        assert!(db.contains(b"a"));

        let both = vec![b"a".to_vec(), b"b".to_vec()];
        db.del_list(&both).unwrap();
        assert!(db.is_empty());
    }
}
