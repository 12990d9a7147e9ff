//! On-disk layout
//!
//! Path construction for everything the engine persists. Per storage root:
//!
//! ```text
//! <root>/storage_attributes        store-global metadata table
//! <root>/collections               name -> collection id table
//! <root>/<collid:08x>/collection_attributes
//! <root>/<collid:08x>/dataspace_attributes
//! <root>/<collid:08x>/keyval
//! <root>/<collid:08x>/bstreams/<bucket:08>/<handle:016x>.bstream
//! <root>/<collid:08x>/stranded-bstreams/<handle:016x>.bstream
//! ```
//!
//! Bstream files are sharded into hash buckets so host-filesystem directory
//! sizes stay bounded; removed handles' files move to `stranded-bstreams/`
//! until reclamation.

use crate::storage::Handle;
use std::path::{Path, PathBuf};

pub const STO_ATTRIB_NAME: &str = "storage_attributes";
pub const COLLECTIONS_NAME: &str = "collections";
pub const COLL_ATTRIB_NAME: &str = "collection_attributes";
pub const DS_ATTRIB_NAME: &str = "dataspace_attributes";
pub const KEYVAL_NAME: &str = "keyval";
pub const BSTREAM_DIRNAME: &str = "bstreams";
pub const STRANDED_BSTREAM_DIRNAME: &str = "stranded-bstreams";

/// Maximum length accepted for a collection name
pub const COLLECTION_NAME_MAX: usize = 255;

/// Id of an open collection within a storage root
pub type CollectionId = u32;

/// Path builder for one storage root
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    buckets: u32,
}

impl StorageLayout {
    pub fn new(root: &Path, buckets: u32) -> Self {
        StorageLayout {
            root: root.to_path_buf(),
            buckets: buckets.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    pub fn sto_attr_table(&self) -> PathBuf {
        self.root.join(STO_ATTRIB_NAME)
    }

    pub fn collections_table(&self) -> PathBuf {
        self.root.join(COLLECTIONS_NAME)
    }

    pub fn coll_dir(&self, coll_id: CollectionId) -> PathBuf {
        self.root.join(format!("{:08x}", coll_id))
    }

    pub fn coll_attr_table(&self, coll_id: CollectionId) -> PathBuf {
        self.coll_dir(coll_id).join(COLL_ATTRIB_NAME)
    }

    pub fn ds_attr_table(&self, coll_id: CollectionId) -> PathBuf {
        self.coll_dir(coll_id).join(DS_ATTRIB_NAME)
    }

    pub fn keyval_table(&self, coll_id: CollectionId) -> PathBuf {
        self.coll_dir(coll_id).join(KEYVAL_NAME)
    }

    pub fn bstream_dir(&self, coll_id: CollectionId) -> PathBuf {
        self.coll_dir(coll_id).join(BSTREAM_DIRNAME)
    }

    pub fn stranded_dir(&self, coll_id: CollectionId) -> PathBuf {
        self.coll_dir(coll_id).join(STRANDED_BSTREAM_DIRNAME)
    }

    /// Bucket a handle shards into
    pub fn bucket(&self, handle: Handle) -> u32 {
        // Mix the halves so handles allocated from one extent still spread
        // across buckets.
        let mixed = (handle ^ (handle >> 32)).wrapping_mul(0x9e37_79b9);
        (mixed as u32) % self.buckets
    }

    pub fn bucket_dir(&self, coll_id: CollectionId, bucket: u32) -> PathBuf {
        self.bstream_dir(coll_id).join(format!("{:08}", bucket))
    }

    pub fn bstream_path(&self, coll_id: CollectionId, handle: Handle) -> PathBuf {
        self.bucket_dir(coll_id, self.bucket(handle))
            .join(format!("{:016x}.bstream", handle))
    }

    pub fn stranded_path(&self, coll_id: CollectionId, handle: Handle) -> PathBuf {
        self.stranded_dir(coll_id)
            .join(format!("{:016x}.bstream", handle))
    }
}
