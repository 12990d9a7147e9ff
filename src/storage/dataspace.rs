//! Dataspaces
//!
//! A dataspace is a handle-addressed object inside a collection: a type
//! tag, an attribute record, and (for datafiles) an associated bytestream.
//! Creation and removal are atomic per handle; attribute writes replace the
//! whole record under the table lock.
//!
//! These are the synchronous cores; the storage facade wraps them in posted
//! ops for asynchronous callers.

use crate::storage::collection::{Collection, LAST_HANDLE_KEY};
use crate::storage::handle_key_bytes;
use crate::storage::ledger::Extent;
use crate::storage::Handle;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Dataspace type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsType {
    Directory,
    Metafile,
    Datafile,
    DirData,
    Symlink,
    Internal,
}

impl std::fmt::Display for DsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DsType::Directory => write!(f, "directory"),
            DsType::Metafile => write!(f, "metafile"),
            DsType::Datafile => write!(f, "datafile"),
            DsType::DirData => write!(f, "dirdata"),
            DsType::Symlink => write!(f, "symlink"),
            DsType::Internal => write!(f, "internal"),
        }
    }
}

/// Type-specific attribute fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeAttrs {
    None,
    Datafile {
        /// Logical bytestream size in bytes
        bstream_size: u64,
    },
    Metafile {
        dfile_count: u32,
        dist_size: u32,
    },
    Directory {
        dirent_count: u64,
        /// Distributed-directory parameters
        tree_height: u32,
        dirdata_count: u32,
        split_size: u32,
        bitmap_size: u32,
    },
    DirData {
        dirent_count: u64,
    },
    Symlink {
        target_len: u32,
    },
}

impl TypeAttrs {
    fn default_for(ds_type: DsType) -> Self {
        match ds_type {
            DsType::Datafile => TypeAttrs::Datafile { bstream_size: 0 },
            DsType::Metafile => TypeAttrs::Metafile {
                dfile_count: 0,
                dist_size: 0,
            },
            DsType::Directory => TypeAttrs::Directory {
                dirent_count: 0,
                tree_height: 0,
                dirdata_count: 0,
                split_size: 0,
                bitmap_size: 0,
            },
            DsType::DirData => TypeAttrs::DirData { dirent_count: 0 },
            DsType::Symlink => TypeAttrs::Symlink { target_len: 0 },
            DsType::Internal => TypeAttrs::None,
        }
    }
}

/// Dataspace attribute record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsAttrs {
    pub handle: Handle,
    pub ds_type: DsType,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub type_attrs: TypeAttrs,
}

impl DsAttrs {
    fn new(handle: Handle, ds_type: DsType) -> Self {
        let now = now_secs();
        DsAttrs {
            handle,
            ds_type,
            uid: 0,
            gid: 0,
            mode: 0,
            ctime: now,
            mtime: now,
            atime: now,
            type_attrs: TypeAttrs::default_for(ds_type),
        }
    }

    /// Logical bytestream size; zero for non-datafiles
    pub fn bstream_size(&self) -> u64 {
        match self.type_attrs {
            TypeAttrs::Datafile { bstream_size } => bstream_size,
            _ => 0,
        }
    }
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn encode_attrs(attrs: &DsAttrs) -> Result<Vec<u8>> {
    bincode::serialize(attrs).map_err(|e| Error::Internal(format!("attr encode: {}", e)))
}

fn decode_attrs(bytes: &[u8]) -> Result<DsAttrs> {
    bincode::deserialize(bytes).map_err(|e| Error::Internal(format!("attr decode: {}", e)))
}

/// Parameters for creating a dataspace
#[derive(Debug, Clone)]
pub struct DsCreateRequest {
    /// Ranges to allocate the handle from; empty means any ledger extent
    pub extents: Vec<Extent>,
    /// Specific handle the caller wants
    pub requested: Option<Handle>,
    /// Fail unless exactly the requested handle can be issued
    pub force_requested: bool,
    pub ds_type: DsType,
}

impl Collection {
    /// Create a dataspace and return its handle
    pub fn ds_create_sync(&self, req: &DsCreateRequest) -> Result<Handle> {
        self.ensure_writable()?;

        let handle = if req.force_requested {
            let requested = req.requested.ok_or_else(|| {
                Error::InvalidArg("forced create without a requested handle".into())
            })?;
            self.ledger().set_used(requested)?;
            requested
        } else if !req.extents.is_empty() {
            self.ledger().alloc_from_ranges(&req.extents)?
        } else {
            self.ledger().alloc()?
        };

        let attrs = DsAttrs::new(handle, req.ds_type);
        let key = handle_key_bytes(handle);
        let encoded = encode_attrs(&attrs)?;
        if let Err(e) = self.ds_attr_db().put_once(&key, &encoded) {
            // Roll the handle back out of the ledger; creation failed.
            let _ = self.ledger().free(handle);
            return Err(e);
        }
        self.put_attr(LAST_HANDLE_KEY, &handle.to_be_bytes())?;
        self.maybe_sync(self.ds_attr_db())?;
        tracing::debug!(collection = self.id(), handle, ds_type = %req.ds_type, "dataspace created");
        Ok(handle)
    }

    /// Create several dataspaces; stops at the first failure
    pub fn ds_create_list_sync(&self, reqs: &[DsCreateRequest]) -> Result<Vec<Handle>> {
        let mut handles = Vec::with_capacity(reqs.len());
        for req in reqs {
            handles.push(self.ds_create_sync(req)?);
        }
        Ok(handles)
    }

    /// Remove a dataspace: its attribute record, its keyval entries, and
    /// its bytestream file (stranded for later reclamation)
    pub fn ds_remove_sync(&self, handle: Handle) -> Result<()> {
        self.ensure_writable()?;
        let key = handle_key_bytes(handle);
        if !self.ds_attr_db().contains(&key) {
            return Err(Error::NotFound);
        }

        self.ds_attr_db().del(&key)?;
        self.kv_remove_all_for_handle(handle)?;
        self.position_cache().invalidate_handle(handle);

        // Strand the bstream file; reclamation sweeps it up later.
        let bstream = self.layout().bstream_path(self.id(), handle);
        if bstream.exists() {
            let stranded = self.layout().stranded_path(self.id(), handle);
            if let Some(parent) = stranded.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&bstream, &stranded)?;
        }

        self.ledger().free(handle)?;
        self.maybe_sync(self.ds_attr_db())?;
        tracing::debug!(collection = self.id(), handle, "dataspace removed");
        Ok(())
    }

    /// Remove several dataspaces; stops at the first failure
    pub fn ds_remove_list_sync(&self, handles: &[Handle]) -> Result<()> {
        for handle in handles {
            self.ds_remove_sync(*handle)?;
        }
        Ok(())
    }

    /// Check a handle exists and return its type tag
    pub fn ds_verify_sync(&self, handle: Handle) -> Result<DsType> {
        Ok(self.ds_getattr_sync(handle)?.ds_type)
    }

    /// Read a dataspace's attribute record
    pub fn ds_getattr_sync(&self, handle: Handle) -> Result<DsAttrs> {
        let bytes = self.ds_attr_db().get(&handle_key_bytes(handle))?;
        decode_attrs(&bytes)
    }

    /// Read several attribute records; each slot carries its own result
    pub fn ds_getattr_list_sync(&self, handles: &[Handle]) -> Vec<Result<DsAttrs>> {
        handles.iter().map(|h| self.ds_getattr_sync(*h)).collect()
    }

    /// Replace a dataspace's attribute record
    ///
    /// The record's handle and type tag must match the stored record;
    /// changing an object's type is not an attribute update.
    pub fn ds_setattr_sync(&self, handle: Handle, attrs: &DsAttrs) -> Result<()> {
        self.ensure_writable()?;
        let _size_guard = self
            .bstream_size_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let current = self.ds_getattr_sync(handle)?;
        if attrs.handle != handle || attrs.ds_type != current.ds_type {
            return Err(Error::InvalidArg(
                "attribute record handle/type mismatch".into(),
            ));
        }
        self.ds_attr_db()
            .put(&handle_key_bytes(handle), &encode_attrs(attrs)?)?;
        self.maybe_sync(self.ds_attr_db())
    }

    /// Iterate live handles in table order
    ///
    /// `start` continues from a previous call's returned position. The
    /// cursor promises progress under concurrent creation but not a
    /// consistent snapshot.
    pub fn ds_iterate_handles_sync(
        &self,
        start: Option<Handle>,
        max: usize,
    ) -> Result<(Vec<Handle>, Option<Handle>)> {
        use crate::storage::db::CursorOp;

        let mut cursor = self.ds_attr_db().cursor();
        let mut op = match start {
            Some(handle) => CursorOp::SetRange(handle_key_bytes(handle).to_vec()),
            None => CursorOp::First,
        };
        let mut handles = Vec::new();
        while handles.len() < max {
            match cursor.get(op.clone()) {
                Ok((key, _)) => {
                    let array: [u8; 8] = key[8..16]
                        .try_into()
                        .map_err(|_| Error::Internal("short dataspace key".into()))?;
                    handles.push(u64::from_be_bytes(array));
                }
                Err(Error::NotFound) => return Ok((handles, None)),
                Err(e) => return Err(e),
            }
            op = CursorOp::Next;
        }
        let next = handles.last().map(|h| h + 1);
        Ok((handles, next))
    }

    /// Merge a committed end offset into the stored bytestream size
    ///
    /// The logical size tracks the maximum byte ever committed, so a
    /// concurrent writer that finishes late with a smaller end must not
    /// win. The size lock serializes the read-modify-write and the merge
    /// compares against a freshly read record, never a stale baseline.
    pub(crate) fn ds_commit_bstream_size(&self, handle: Handle, committed_end: u64) -> Result<()> {
        let _size_guard = self
            .bstream_size_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut attrs = self.ds_getattr_sync(handle)?;
        match &mut attrs.type_attrs {
            TypeAttrs::Datafile { bstream_size } => {
                if committed_end <= *bstream_size {
                    return Ok(());
                }
                *bstream_size = committed_end;
            }
            _ => {
                return Err(Error::InvalidArg(format!(
                    "handle {:#x} is not a datafile",
                    handle
                )))
            }
        }
        attrs.mtime = now_secs();
        self.ds_attr_db()
            .put(&handle_key_bytes(handle), &encode_attrs(&attrs)?)?;
        self.maybe_sync(self.ds_attr_db())
    }

    /// Set the stored bytestream size exactly; resize shrinks as well as
    /// grows, under the same lock as the commit path
    pub(crate) fn ds_set_bstream_size(&self, handle: Handle, size: u64) -> Result<()> {
        let _size_guard = self
            .bstream_size_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut attrs = self.ds_getattr_sync(handle)?;
        match &mut attrs.type_attrs {
            TypeAttrs::Datafile { bstream_size } => *bstream_size = size,
            _ => {
                return Err(Error::InvalidArg(format!(
                    "handle {:#x} is not a datafile",
                    handle
                )))
            }
        }
        attrs.mtime = now_secs();
        self.ds_attr_db()
            .put(&handle_key_bytes(handle), &encode_attrs(&attrs)?)?;
        self.maybe_sync(self.ds_attr_db())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::open_test_collection;

    fn create_req(ds_type: DsType) -> DsCreateRequest {
        DsCreateRequest {
            extents: Vec::new(),
            requested: None,
            force_requested: false,
            ds_type,
        }
    }

    #[test]
    fn test_create_getattr() {
        let (_dir, coll) = open_test_collection();
        let handle = coll.ds_create_sync(&create_req(DsType::Datafile)).unwrap();
        let attrs = coll.ds_getattr_sync(handle).unwrap();
        assert_eq!(attrs.handle, handle);
        assert_eq!(attrs.ds_type, DsType::Datafile);
        assert_eq!(attrs.bstream_size(), 0);
        assert!(attrs.ctime > 0);
    }

    #[test]
    fn test_create_unique_handles() {
        let (_dir, coll) = open_test_collection();
        let a = coll.ds_create_sync(&create_req(DsType::Metafile)).unwrap();
        let b = coll.ds_create_sync(&create_req(DsType::Metafile)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_forced_handle() {
        let (_dir, coll) = open_test_collection();
        let req = DsCreateRequest {
            extents: Vec::new(),
            requested: Some(77),
            force_requested: true,
            ds_type: DsType::Directory,
        };
        assert_eq!(coll.ds_create_sync(&req).unwrap(), 77);
        // Forcing the same handle again collides.
        assert_eq!(coll.ds_create_sync(&req).unwrap_err(), Error::Exists);
    }

    #[test]
    fn test_remove() {
        let (_dir, coll) = open_test_collection();
        let handle = coll.ds_create_sync(&create_req(DsType::Datafile)).unwrap();
        coll.ds_remove_sync(handle).unwrap();
        assert_eq!(coll.ds_getattr_sync(handle).unwrap_err(), Error::NotFound);
        assert_eq!(coll.ds_remove_sync(handle).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_verify_type() {
        let (_dir, coll) = open_test_collection();
        let handle = coll.ds_create_sync(&create_req(DsType::Symlink)).unwrap();
        assert_eq!(coll.ds_verify_sync(handle).unwrap(), DsType::Symlink);
        assert_eq!(coll.ds_verify_sync(9999).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_setattr() {
        let (_dir, coll) = open_test_collection();
        let handle = coll.ds_create_sync(&create_req(DsType::Metafile)).unwrap();
        let mut attrs = coll.ds_getattr_sync(handle).unwrap();
        attrs.uid = 1000;
        attrs.gid = 1000;
        attrs.mode = 0o644;
        coll.ds_setattr_sync(handle, &attrs).unwrap();
        let back = coll.ds_getattr_sync(handle).unwrap();
        assert_eq!(back.uid, 1000);
        assert_eq!(back.mode, 0o644);

        // Type changes are rejected.
        attrs.ds_type = DsType::Datafile;
        assert!(matches!(
            coll.ds_setattr_sync(handle, &attrs).unwrap_err(),
            Error::InvalidArg(_)
        ));
    }

    #[test]
    fn test_iterate_handles() {
        let (_dir, coll) = open_test_collection();
        let mut created: Vec<Handle> = (0..10)
            .map(|_| coll.ds_create_sync(&create_req(DsType::Datafile)).unwrap())
            .collect();
        created.sort_unstable();

        // Walk in two batches using the continuation position.
        let (first, next) = coll.ds_iterate_handles_sync(None, 6).unwrap();
        assert_eq!(first.len(), 6);
        let (second, done) = coll.ds_iterate_handles_sync(next, 10).unwrap();
        assert_eq!(second.len(), 4);
        assert!(done.is_none());

        let mut all = first;
        all.extend(second);
        assert_eq!(all, created);
    }

    #[test]
    fn test_getattr_list_mixed() {
        let (_dir, coll) = open_test_collection();
        let handle = coll.ds_create_sync(&create_req(DsType::Datafile)).unwrap();
        let results = coll.ds_getattr_list_sync(&[handle, 9999]);
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err(), &Error::NotFound);
    }
}
