//! Keyval store
//!
//! (handle, type, key) → value records inside a collection. Several key
//! classes (common engine keys, directory-entry component names, extended
//! attributes) share one physical table, separated by the type byte.
//! Records sort by handle, then type byte, then key length, then key
//! bytes, so all entries for one handle are contiguous and directory
//! listings walk component names cheaply.
//!
//! `write_list` succeeds as a unit or leaves the store unchanged. A
//! position cache hands out continuation tokens so clients can resume
//! iteration across calls without the engine pinning a cursor.

use crate::storage::collection::{Collection, PositionToken};
use crate::storage::db::{CursorOp, KEY_HANDLE_SIZE, KEY_HEADER_SIZE};
use crate::storage::handle_key_bytes;
use crate::storage::Handle;
use crate::{Error, Result};

/// Key class tags sharing the keyval table
pub mod key_class {
    /// Engine-defined common keys (datafile handles, symlink targets)
    pub const COMMON: u8 = b'c';
    /// Directory-entry component names
    pub const COMPONENT: u8 = b'k';
    /// Extended attributes
    pub const XATTR: u8 = b'x';
}

/// Flags accepted by keyval writes
#[derive(Debug, Clone, Copy, Default)]
pub struct KvFlags {
    /// Fail `Exists` instead of overwriting
    pub no_overwrite: bool,
    /// Force durability before returning
    pub sync: bool,
    /// Skip the printable-key check; the key is an opaque blob
    pub binary_key: bool,
}

/// Per-handle keyval accounting, for directory-entry aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvHandleInfo {
    /// Number of keyval entries stored under the handle
    pub count: u64,
}

/// Where an iteration starts
#[derive(Debug, Clone, Copy)]
pub enum KvPosition {
    Start,
    /// Continuation token from a previous iteration
    Token(PositionToken),
}

/// Result of one iteration batch
pub struct KvIteration {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// Token resuming after the last returned entry; `None` at the end
    pub token: Option<PositionToken>,
}

/// Build the physical table key: 16-byte handle, type byte, key bytes
pub(crate) fn keyval_key(handle: Handle, type_byte: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEY_HEADER_SIZE + key.len());
    out.extend_from_slice(&handle_key_bytes(handle));
    out.push(type_byte);
    out.extend_from_slice(key);
    out
}

fn split_key(raw: &[u8]) -> (&[u8], u8, &[u8]) {
    (
        &raw[..KEY_HANDLE_SIZE],
        raw[KEY_HANDLE_SIZE],
        &raw[KEY_HEADER_SIZE..],
    )
}

impl Collection {
    fn check_key(&self, key: &[u8], flags: KvFlags) -> Result<()> {
        if key.is_empty() || key.len() > self.key_max() {
            return Err(Error::InvalidArg(format!(
                "key length {} outside 1..={}",
                key.len(),
                self.key_max()
            )));
        }
        if !flags.binary_key {
            // Default keys are names: printable and NUL-free.
            if key.iter().any(|&b| b == 0) {
                return Err(Error::InvalidArg(
                    "string key contains NUL; use the binary-key flag".into(),
                ));
            }
        }
        Ok(())
    }

    /// Read the value for (handle, type, key)
    pub fn kv_read_sync(&self, handle: Handle, type_byte: u8, key: &[u8]) -> Result<Vec<u8>> {
        let raw = keyval_key(handle, type_byte, key);
        // Unconfirmed writes are visible to readers in this collection.
        {
            let cache = self.write_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(value) = cache.get(&raw) {
                return Ok(value.clone());
            }
        }
        self.keyval_db().get(&raw)
    }

    /// Store a value for (handle, type, key)
    pub fn kv_write_sync(
        &self,
        handle: Handle,
        type_byte: u8,
        key: &[u8],
        value: &[u8],
        flags: KvFlags,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.check_key(key, flags)?;
        let raw = keyval_key(handle, type_byte, key);
        if flags.no_overwrite {
            self.keyval_db().put_once(&raw, value)?;
        } else {
            self.keyval_db().put(&raw, value)?;
        }
        {
            let mut cache = self.write_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(raw, value.to_vec());
        }
        if flags.sync {
            self.kv_flush_sync()?;
        } else {
            self.maybe_sync(self.keyval_db())?;
        }
        Ok(())
    }

    /// Store a batch of values as a unit
    ///
    /// With `no_overwrite`, any existing key fails the whole batch and the
    /// store is unchanged.
    pub fn kv_write_list_sync(
        &self,
        handle: Handle,
        type_byte: u8,
        pairs: &[(Vec<u8>, Vec<u8>)],
        flags: KvFlags,
    ) -> Result<()> {
        self.ensure_writable()?;
        let mut raw_pairs = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            self.check_key(key, flags)?;
            raw_pairs.push((keyval_key(handle, type_byte, key), value.clone()));
        }
        self.keyval_db().put_list(&raw_pairs, flags.no_overwrite)?;
        {
            let mut cache = self.write_cache.lock().unwrap_or_else(|e| e.into_inner());
            for (raw, value) in raw_pairs {
                cache.insert(raw, value);
            }
        }
        if flags.sync {
            self.kv_flush_sync()?;
        } else {
            self.maybe_sync(self.keyval_db())?;
        }
        Ok(())
    }

    /// Remove (handle, type, key)
    pub fn kv_remove_sync(&self, handle: Handle, type_byte: u8, key: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let raw = keyval_key(handle, type_byte, key);
        self.keyval_db().del(&raw)?;
        {
            let mut cache = self.write_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.remove(&raw);
        }
        self.position_cache().invalidate_handle(handle);
        self.maybe_sync(self.keyval_db())
    }

    /// Remove a batch of keys as a unit
    pub fn kv_remove_list_sync(
        &self,
        handle: Handle,
        type_byte: u8,
        keys: &[Vec<u8>],
    ) -> Result<()> {
        self.ensure_writable()?;
        let raw_keys: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| keyval_key(handle, type_byte, k))
            .collect();
        self.keyval_db().del_list(&raw_keys)?;
        {
            let mut cache = self.write_cache.lock().unwrap_or_else(|e| e.into_inner());
            for raw in &raw_keys {
                cache.remove(raw);
            }
        }
        self.position_cache().invalidate_handle(handle);
        self.maybe_sync(self.keyval_db())
    }

    /// Check that a key exists
    pub fn kv_validate_sync(&self, handle: Handle, type_byte: u8, key: &[u8]) -> Result<()> {
        self.kv_read_sync(handle, type_byte, key).map(|_| ())
    }

    /// Iterate (key, value) pairs under (handle, type) in table order
    pub fn kv_iterate_sync(
        &self,
        handle: Handle,
        type_byte: u8,
        position: KvPosition,
        max: usize,
    ) -> Result<KvIteration> {
        let start = match position {
            KvPosition::Start => CursorOp::SetRange(keyval_key(handle, type_byte, &[])),
            KvPosition::Token(token) => {
                let last = self
                    .position_cache()
                    .take(token)
                    .ok_or(Error::NotFound)?;
                CursorOp::SetRange(last)
            }
        };
        // A continuation lands on the first key at or after the cached one;
        // skip the cached key itself if it is still present.
        let skip_exact = matches!(position, KvPosition::Token(_));

        let mut cursor = self.keyval_db().cursor();
        let mut op = start.clone();
        let mut entries = Vec::new();
        let mut first = true;
        loop {
            if entries.len() >= max {
                break;
            }
            let (raw, value) = match cursor.get(op.clone()) {
                Ok(pair) => pair,
                Err(Error::NotFound) => {
                    return Ok(KvIteration {
                        entries,
                        token: None,
                    })
                }
                Err(e) => return Err(e),
            };
            let (key_handle, key_type, key) = split_key(&raw);
            if key_handle != &handle_key_bytes(handle)[..] || key_type != type_byte {
                // Walked past this (handle, type) span.
                return Ok(KvIteration {
                    entries,
                    token: None,
                });
            }
            let is_resume_point = first
                && skip_exact
                && matches!(&start, CursorOp::SetRange(last) if last == &raw);
            if !is_resume_point {
                entries.push((key.to_vec(), value));
            }
            first = false;
            op = CursorOp::Next;
        }

        let token = entries.last().map(|(key, _)| {
            self.position_cache()
                .store(handle, keyval_key(handle, type_byte, key))
        });
        Ok(KvIteration { entries, token })
    }

    /// Iterate keys only
    pub fn kv_iterate_keys_sync(
        &self,
        handle: Handle,
        type_byte: u8,
        position: KvPosition,
        max: usize,
    ) -> Result<(Vec<Vec<u8>>, Option<PositionToken>)> {
        let iteration = self.kv_iterate_sync(handle, type_byte, position, max)?;
        Ok((
            iteration.entries.into_iter().map(|(k, _)| k).collect(),
            iteration.token,
        ))
    }

    /// Per-handle entry count across all key classes
    pub fn kv_get_handle_info_sync(&self, handle: Handle) -> Result<KvHandleInfo> {
        let prefix = handle_key_bytes(handle);
        let mut cursor = self.keyval_db().cursor();
        let mut op = CursorOp::SetRange(prefix.to_vec());
        let mut count = 0u64;
        loop {
            match cursor.get(op) {
                Ok((raw, _)) => {
                    if &raw[..KEY_HANDLE_SIZE] != prefix.as_slice() {
                        break;
                    }
                    count += 1;
                }
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            }
            op = CursorOp::Next;
        }
        Ok(KvHandleInfo { count })
    }

    /// Force keyval durability
    pub fn kv_flush_sync(&self) -> Result<()> {
        self.keyval_db().sync()?;
        let mut cache = self.write_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
        Ok(())
    }

    /// Drop every keyval entry under a handle; used by dataspace removal
    pub(crate) fn kv_remove_all_for_handle(&self, handle: Handle) -> Result<()> {
        let prefix = handle_key_bytes(handle);
        let mut cursor = self.keyval_db().cursor();
        loop {
            let (raw, _) = match cursor.get(CursorOp::SetRange(prefix.to_vec())) {
                Ok(pair) => pair,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            };
            if &raw[..KEY_HANDLE_SIZE] != prefix.as_slice() {
                break;
            }
            cursor.delete()?;
        }
        {
            let mut cache = self.write_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.retain(|raw, _| &raw[..KEY_HANDLE_SIZE] != prefix.as_slice());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::open_test_collection;

    #[test]
    fn test_write_read() {
        let (_dir, coll) = open_test_collection();
        coll.kv_write_sync(1, key_class::COMMON, b"st", b"/target", KvFlags::default())
            .unwrap();
        let value = coll.kv_read_sync(1, key_class::COMMON, b"st").unwrap();
        assert_eq!(value, b"/target");
    }

    #[test]
    fn test_read_missing() {
        let (_dir, coll) = open_test_collection();
        assert_eq!(
            coll.kv_read_sync(1, key_class::COMMON, b"nope").unwrap_err(),
            Error::NotFound
        );
    }

    #[test]
    fn test_no_overwrite() {
        let (_dir, coll) = open_test_collection();
        let flags = KvFlags {
            no_overwrite: true,
            ..Default::default()
        };
        coll.kv_write_sync(1, key_class::COMPONENT, b"file.txt", b"h1", flags)
            .unwrap();
        assert_eq!(
            coll.kv_write_sync(1, key_class::COMPONENT, b"file.txt", b"h2", flags)
                .unwrap_err(),
            Error::Exists
        );
        // Plain write still overwrites.
        coll.kv_write_sync(
            1,
            key_class::COMPONENT,
            b"file.txt",
            b"h3",
            KvFlags::default(),
        )
        .unwrap();
        assert_eq!(
            coll.kv_read_sync(1, key_class::COMPONENT, b"file.txt").unwrap(),
            b"h3"
        );
    }

    #[test]
    fn test_binary_key_check() {
        let (_dir, coll) = open_test_collection();
        let with_nul = b"raw\0key";
        assert!(matches!(
            coll.kv_write_sync(1, key_class::XATTR, with_nul, b"v", KvFlags::default())
                .unwrap_err(),
            Error::InvalidArg(_)
        ));
        let flags = KvFlags {
            binary_key: true,
            ..Default::default()
        };
        coll.kv_write_sync(1, key_class::XATTR, with_nul, b"v", flags)
            .unwrap();
        assert_eq!(
            coll.kv_read_sync(1, key_class::XATTR, with_nul).unwrap(),
            b"v"
        );
    }

    #[test]
    fn test_iteration_order() {
        let (_dir, coll) = open_test_collection();
        // Inserted out of order; must come back ordered by
        // (handle, type, length, bytes).
        coll.kv_write_sync(1, b'd', b"b", b"3", KvFlags::default()).unwrap();
        coll.kv_write_sync(1, b'd', b"a", b"2", KvFlags::default()).unwrap();
        coll.kv_write_sync(1, b'a', b"z", b"1", KvFlags::default()).unwrap();
        coll.kv_write_sync(2, b'd', b"a", b"4", KvFlags::default()).unwrap();

        let it = coll
            .kv_iterate_sync(1, b'd', KvPosition::Start, 100)
            .unwrap();
        let keys: Vec<Vec<u8>> = it.entries.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(it.token.is_none());

        let it = coll
            .kv_iterate_sync(1, b'a', KvPosition::Start, 100)
            .unwrap();
        assert_eq!(it.entries.len(), 1);
        assert_eq!(it.entries[0].0, b"z");
    }

    #[test]
    fn test_iteration_resumes_with_token() {
        let (_dir, coll) = open_test_collection();
        for i in 0..10u8 {
            coll.kv_write_sync(
                5,
                key_class::COMPONENT,
                &[b'f', b'0' + i],
                &[i],
                KvFlags::default(),
            )
            .unwrap();
        }

        let first = coll
            .kv_iterate_sync(5, key_class::COMPONENT, KvPosition::Start, 4)
            .unwrap();
        assert_eq!(first.entries.len(), 4);
        let token = first.token.expect("more entries remain");

        let second = coll
            .kv_iterate_sync(5, key_class::COMPONENT, KvPosition::Token(token), 100)
            .unwrap();
        assert_eq!(second.entries.len(), 6);
        assert!(second.token.is_none());

        let mut all: Vec<Vec<u8>> = first
            .entries
            .into_iter()
            .chain(second.entries)
            .map(|(k, _)| k)
            .collect();
        let mut expected: Vec<Vec<u8>> =
            (0..10u8).map(|i| vec![b'f', b'0' + i]).collect();
        all.sort();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_write_list_atomic() {
        let (_dir, coll) = open_test_collection();
        coll.kv_write_sync(1, b'k', b"taken", b"x", KvFlags::default())
            .unwrap();

        let batch = vec![
            (b"fresh".to_vec(), b"1".to_vec()),
            (b"taken".to_vec(), b"2".to_vec()),
        ];
        let flags = KvFlags {
            no_overwrite: true,
            ..Default::default()
        };
        assert_eq!(
            coll.kv_write_list_sync(1, b'k', &batch, flags).unwrap_err(),
            Error::Exists
        );
        assert_eq!(
            coll.kv_read_sync(1, b'k', b"fresh").unwrap_err(),
            Error::NotFound
        );

        coll.kv_write_list_sync(1, b'k', &batch, KvFlags::default())
            .unwrap();
        assert_eq!(coll.kv_read_sync(1, b'k', b"taken").unwrap(), b"2");
    }

    #[test]
    fn test_remove_and_remove_list() {
        let (_dir, coll) = open_test_collection();
        coll.kv_write_sync(1, b'k', b"a", b"1", KvFlags::default()).unwrap();
        coll.kv_write_sync(1, b'k', b"b", b"2", KvFlags::default()).unwrap();

        coll.kv_remove_sync(1, b'k', b"a").unwrap();
        assert_eq!(
            coll.kv_read_sync(1, b'k', b"a").unwrap_err(),
            Error::NotFound
        );

        // Batch removal with a missing key leaves the store unchanged.
        let keys = vec![b"b".to_vec(), b"missing".to_vec()];
        assert_eq!(
            coll.kv_remove_list_sync(1, b'k', &keys).unwrap_err(),
            Error::NotFound
        );
        assert!(coll.kv_read_sync(1, b'k', b"b").is_ok());

        coll.kv_remove_list_sync(1, b'k', &[b"b".to_vec()]).unwrap();
        assert_eq!(
            coll.kv_read_sync(1, b'k', b"b").unwrap_err(),
            Error::NotFound
        );
    }

    #[test]
    fn test_get_handle_info() {
        let (_dir, coll) = open_test_collection();
        for i in 0..5u8 {
            coll.kv_write_sync(9, b'k', &[b'e', i + b'0'], b"h", KvFlags::default())
                .unwrap();
        }
        coll.kv_write_sync(9, b'x', b"attr", b"v", KvFlags::default())
            .unwrap();
        coll.kv_write_sync(10, b'k', b"other", b"h", KvFlags::default())
            .unwrap();

        let info = coll.kv_get_handle_info_sync(9).unwrap();
        assert_eq!(info.count, 6);
        let info = coll.kv_get_handle_info_sync(10).unwrap();
        assert_eq!(info.count, 1);
        let info = coll.kv_get_handle_info_sync(11).unwrap();
        assert_eq!(info.count, 0);
    }

    #[test]
    fn test_sync_flag_clears_write_cache() {
        let (_dir, coll) = open_test_collection();
        let flags = KvFlags {
            sync: true,
            ..Default::default()
        };
        coll.kv_write_sync(1, b'c', b"key", b"value", flags).unwrap();
        let cache = coll.write_cache.lock().unwrap();
        assert!(cache.is_empty());
        drop(cache);
        assert_eq!(coll.kv_read_sync(1, b'c', b"key").unwrap(), b"value");
    }
}
