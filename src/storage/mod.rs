//! Storage engine
//!
//! An append-friendly on-disk layout combining three access methods per
//! collection: handle-addressed **dataspaces** with typed attribute
//! records, per-handle **bytestreams** with scatter-gather list I/O, and an
//! ordered **keyval** store keyed by (handle, type, key).
//!
//! The [`StorageSpace`] facade owns the on-disk skeleton, the collection
//! registry, and an [`mgmt::OpManager`](crate::mgmt::OpManager) wired with
//! a threaded-queues worker for metadata ops and a blocking worker for
//! collections flagged immediate-completion. Storage entry points post ops
//! whose service closures run the synchronous cores in the submodules;
//! bytestream list I/O instead submits to the pluggable [`aio`] backend and
//! completes from its notify callback.
//!
//! Results of asynchronous calls are retrieved in two steps: completion
//! (success or error) arrives through the op's completion context, and the
//! op's output value is read from the returned [`OpResult`] slot.

pub mod aio;
pub mod bstream;
pub mod collection;
pub mod dataspace;
pub mod db;
pub mod keyval;
pub mod layout;
pub mod ledger;
pub mod version;

use crate::config::Config;
use crate::hints::HintBag;
use crate::mgmt::context::CompletionContext;
use crate::mgmt::op::{OpId, ServiceFn, ServiceOutcome};
use crate::mgmt::queue::OpQueue;
use crate::mgmt::worker::{PostOutcome, ThreadedAttrs, WorkerAttrs, WorkerId};
use crate::mgmt::{OpManager, PostTarget};
use crate::{Error, Result};
use aio::{AioBackend, AioKind, AioOp, ThreadedAio};
use bstream::StreamSegment;
use collection::{Collection, CollectionRegistry, ROOT_HANDLE_KEY};
use dataspace::{DsAttrs, DsCreateRequest, DsType};
use db::{Db, KeyOrder};
use keyval::{KvFlags, KvHandleInfo, KvIteration, KvPosition};
use layout::{CollectionId, StorageLayout, COLLECTION_NAME_MAX};
use ledger::{Extent, HandleLedger};
use std::fs;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// 64-bit object identifier within a collection
pub type Handle = u64;

/// Fixed-width big-endian key form of a handle
///
/// The key record reserves 16 bytes for the handle; the upper 8 are zero
/// with 64-bit handles, keeping byte order equal to numeric order.
pub(crate) fn handle_key_bytes(handle: Handle) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[8..].copy_from_slice(&handle.to_be_bytes());
    out
}

const LAST_COLL_ID_KEY: &[u8] = b"last-collection-id";
const STO_VERSION_KEY: &[u8] = b"format-version";

/// Output slot for an asynchronous storage op
///
/// The op's service closure deposits its value here before completing;
/// callers read it after the completion context reports the op done.
pub struct OpResult<T>(Arc<Mutex<Option<T>>>);

impl<T> OpResult<T> {
    fn new() -> Self {
        OpResult(Arc::new(Mutex::new(None)))
    }

    pub(crate) fn set(&self, value: T) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }

    /// Take the value; `None` until the op completed successfully
    pub fn take(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl<T> Clone for OpResult<T> {
    fn clone(&self) -> Self {
        OpResult(Arc::clone(&self.0))
    }
}

/// Request for a bytestream list transfer
pub struct BsListRequest {
    pub handle: Handle,
    /// Memory segments; for reads, pre-sized buffers the engine fills
    pub buffers: Vec<Vec<u8>>,
    /// Stream segments; total size must equal total buffer bytes
    pub stream: Vec<StreamSegment>,
}

/// Completed read transfer: the filled buffers and delivered byte count
pub struct BsListDone {
    pub buffers: Vec<Vec<u8>>,
    pub bytes: u64,
}

/// The storage engine facade
pub struct StorageSpace {
    layout: StorageLayout,
    config: Config,
    sto_attr_db: Arc<Db>,
    collections_db: Arc<Db>,
    registry: CollectionRegistry,
    manager: Arc<OpManager>,
    meta_queue: Arc<OpQueue>,
    blocking_worker: WorkerId,
    aio: Arc<dyn AioBackend>,
}

impl StorageSpace {
    /// Create a new storage space skeleton on disk
    pub fn create(root: &std::path::Path, config: Config) -> Result<Arc<StorageSpace>> {
        config.validate()?;
        fs::create_dir_all(root)?;
        let layout = StorageLayout::new(root, config.storage.bstream_buckets);

        let sto_attr_db = Db::open(&layout.sto_attr_table(), KeyOrder::Lexicographic, true)?;
        let collections_db = Db::open(&layout.collections_table(), KeyOrder::Lexicographic, true)?;
        sto_attr_db.put(
            STO_VERSION_KEY,
            version::CURRENT_VERSION.to_string().as_bytes(),
        )?;
        sto_attr_db.sync()?;
        tracing::debug!(root = %root.display(), "storage space created");

        Self::build(layout, config, sto_attr_db, collections_db)
    }

    /// Open an existing storage space
    pub fn open(root: &std::path::Path, config: Config) -> Result<Arc<StorageSpace>> {
        config.validate()?;
        let layout = StorageLayout::new(root, config.storage.bstream_buckets);
        let sto_attr_db = Db::open(&layout.sto_attr_table(), KeyOrder::Lexicographic, false)?;
        let collections_db =
            Db::open(&layout.collections_table(), KeyOrder::Lexicographic, false)?;

        let bytes = sto_attr_db.get(STO_VERSION_KEY).map_err(|e| match e {
            Error::NotFound => Error::Internal("storage space has no format-version".into()),
            other => other,
        })?;
        let text = String::from_utf8(bytes)
            .map_err(|_| Error::Internal("format-version is not utf-8".into()))?;
        let on_disk = version::FormatVersion::parse(&text)?;
        if on_disk.major > version::CURRENT_VERSION.major {
            return Err(Error::Internal(format!(
                "on-disk format {} is newer than engine format {}",
                on_disk,
                version::CURRENT_VERSION
            )));
        }

        Self::build(layout, config, sto_attr_db, collections_db)
    }

    fn build(
        layout: StorageLayout,
        config: Config,
        sto_attr_db: Arc<Db>,
        collections_db: Arc<Db>,
    ) -> Result<Arc<StorageSpace>> {
        let manager = OpManager::new(CompletionContext::open_pull());
        let meta_worker = manager.add_worker(WorkerAttrs::Threaded(ThreadedAttrs {
            thread_count: config.workers.effective_thread_count(),
            ops_per_queue: config.workers.ops_per_queue,
            timeout: Duration::from_micros(config.workers.wait_timeout_us),
        }))?;
        let blocking_worker = manager.add_worker(WorkerAttrs::Blocking)?;
        let meta_queue = OpQueue::new();
        manager.queue_add(meta_worker, Arc::clone(&meta_queue))?;

        Ok(Arc::new(StorageSpace {
            layout,
            config,
            sto_attr_db,
            collections_db,
            registry: CollectionRegistry::new(),
            manager,
            meta_queue,
            blocking_worker,
            aio: Arc::new(ThreadedAio::new()),
        }))
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn manager(&self) -> &Arc<OpManager> {
        &self.manager
    }

    pub fn aio(&self) -> &Arc<dyn AioBackend> {
        &self.aio
    }

    // Collection management ------------------------------------------------

    /// Create a collection and its on-disk subtree
    pub fn collection_create(&self, name: &str) -> Result<CollectionId> {
        if name.is_empty() || name.len() > COLLECTION_NAME_MAX {
            return Err(Error::InvalidArg(format!(
                "collection name length {} outside 1..={}",
                name.len(),
                COLLECTION_NAME_MAX
            )));
        }

        let coll_id = match self.sto_attr_db.get(LAST_COLL_ID_KEY) {
            Ok(bytes) => {
                let array: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| Error::Internal("bad last-collection-id record".into()))?;
                u32::from_be_bytes(array) + 1
            }
            Err(Error::NotFound) => 1,
            Err(e) => return Err(e),
        };

        self.collections_db
            .put_once(name.as_bytes(), &coll_id.to_be_bytes())?;
        self.sto_attr_db
            .put(LAST_COLL_ID_KEY, &coll_id.to_be_bytes())?;

        fs::create_dir_all(self.layout.coll_dir(coll_id))?;
        for bucket in 0..self.layout.buckets() {
            fs::create_dir_all(self.layout.bucket_dir(coll_id, bucket))?;
        }
        fs::create_dir_all(self.layout.stranded_dir(coll_id))?;

        let coll_attr_db = Db::open(
            &self.layout.coll_attr_table(coll_id),
            KeyOrder::Lexicographic,
            true,
        )?;
        let ds_attr_db = Db::open(&self.layout.ds_attr_table(coll_id), KeyOrder::DsAttr, true)?;
        let keyval_db = Db::open(&self.layout.keyval_table(coll_id), KeyOrder::Keyval, true)?;

        coll_attr_db.put(
            collection::VERSION_KEY,
            version::CURRENT_VERSION.to_string().as_bytes(),
        )?;
        coll_attr_db.sync()?;
        ds_attr_db.sync()?;
        keyval_db.sync()?;
        self.collections_db.sync()?;
        self.sto_attr_db.sync()?;
        tracing::debug!(collection = coll_id, name, "collection created");
        Ok(coll_id)
    }

    /// Resolve a collection name to its id
    pub fn collection_lookup(&self, name: &str) -> Result<CollectionId> {
        let bytes = self.collections_db.get(name.as_bytes())?;
        let array: [u8; 4] = bytes
            .try_into()
            .map_err(|_| Error::Internal("bad collection id record".into()))?;
        Ok(u32::from_be_bytes(array))
    }

    /// Open a collection with the given handle extents
    ///
    /// Re-opening an already open collection returns the existing handle;
    /// otherwise the tables are loaded, the format version checked and
    /// migrated, and the ledger rebuilt from the dataspace table.
    pub fn collection_open(
        &self,
        coll_id: CollectionId,
        extents: Vec<Extent>,
    ) -> Result<Arc<Collection>> {
        if let Some(coll) = self.registry.lookup(coll_id) {
            return Ok(coll);
        }

        let name = self.collection_name_of(coll_id)?;
        let coll_attr_db = Db::open(
            &self.layout.coll_attr_table(coll_id),
            KeyOrder::Lexicographic,
            false,
        )?;
        let ds_attr_db = Db::open(&self.layout.ds_attr_table(coll_id), KeyOrder::DsAttr, false)?;
        let keyval_db = Db::open(&self.layout.keyval_table(coll_id), KeyOrder::Keyval, false)?;

        let ledger = HandleLedger::new(
            extents,
            Duration::from_secs(self.config.storage.handle_purgatory_secs),
        );

        let coll = Arc::new(Collection::new(
            coll_id,
            name,
            self.layout.clone(),
            coll_attr_db,
            ds_attr_db,
            keyval_db,
            ledger,
            &self.config.storage,
        ));

        version::check_and_migrate(&coll)?;

        // Every live handle in the dataspace table is re-marked used so the
        // ledger cannot reissue it.
        let mut start = None;
        loop {
            let (handles, next) = coll.ds_iterate_handles_sync(start, 1024)?;
            for handle in &handles {
                coll.ledger().mark_used_unchecked(*handle);
            }
            match next {
                Some(_) if !handles.is_empty() => start = next,
                _ => break,
            }
        }

        self.registry.insert(Arc::clone(&coll))?;
        Ok(coll)
    }

    fn collection_name_of(&self, coll_id: CollectionId) -> Result<String> {
        let mut cursor = self.collections_db.cursor();
        let mut op = db::CursorOp::First;
        loop {
            let (name, id_bytes) = match cursor.get(op) {
                Ok(pair) => pair,
                Err(Error::NotFound) => return Err(Error::NotFound),
                Err(e) => return Err(e),
            };
            if id_bytes.as_slice() == coll_id.to_be_bytes().as_slice() {
                return String::from_utf8(name)
                    .map_err(|_| Error::Internal("collection name is not utf-8".into()));
            }
            op = db::CursorOp::Next;
        }
    }

    /// Look up an open collection by id
    pub fn collection_ref(&self, coll_id: CollectionId) -> Result<Arc<Collection>> {
        self.registry.lookup(coll_id).ok_or(Error::NotFound)
    }

    /// Remove a collection and delete its subtree
    ///
    /// Fails `Busy` while the collection is open.
    pub fn collection_remove(&self, name: &str) -> Result<()> {
        let coll_id = self.collection_lookup(name)?;
        if self.registry.lookup(coll_id).is_some() {
            return Err(Error::Busy(format!("collection {} is open", name)));
        }
        self.collections_db.del(name.as_bytes())?;
        self.collections_db.sync()?;
        fs::remove_dir_all(self.layout.coll_dir(coll_id))?;
        tracing::debug!(collection = coll_id, name, "collection removed");
        Ok(())
    }

    /// Close an open collection, flushing its tables
    pub fn collection_close(&self, coll_id: CollectionId) -> Result<()> {
        let coll = self.registry.remove(coll_id).ok_or(Error::NotFound)?;
        coll.sync_all()
    }

    /// Record the filesystem root handle for a collection
    pub fn collection_set_root_handle(&self, coll: &Collection, root: Handle) -> Result<()> {
        coll.put_attr(ROOT_HANDLE_KEY, &root.to_be_bytes())
    }

    /// Delete stranded bytestream files left behind by dataspace removal
    ///
    /// Returns how many files were reclaimed.
    pub fn reclaim_stranded(&self, coll: &Collection) -> Result<usize> {
        let stranded = self.layout.stranded_dir(coll.id());
        let mut count = 0;
        if stranded.exists() {
            for entry in fs::read_dir(&stranded)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    fs::remove_file(entry.path())?;
                    count += 1;
                }
            }
        }
        if count > 0 {
            tracing::debug!(collection = coll.id(), count, "stranded bytestreams reclaimed");
        }
        Ok(count)
    }

    // Posting helpers -------------------------------------------------------

    fn post_target(&self, coll: &Collection) -> PostTarget {
        if coll.immediate_completion() {
            PostTarget::Worker(self.blocking_worker)
        } else {
            PostTarget::Queue(self.meta_queue.id())
        }
    }

    /// Post a metadata op whose service closure runs a synchronous core
    fn post_storage_op<T, F>(
        &self,
        coll: &Arc<Collection>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
        hints: HintBag,
        body: F,
    ) -> Result<(OpId, PostOutcome, OpResult<T>)>
    where
        T: Send + 'static,
        F: FnOnce(&Collection) -> Result<T> + Send + 'static,
    {
        let slot = OpResult::new();
        let service_slot = slot.clone();
        let service_coll = Arc::clone(coll);
        let mut body = Some(body);
        let service: ServiceFn = Box::new(move |_args| {
            let body = body
                .take()
                .ok_or_else(|| Error::Internal("storage op serviced twice".into()))?;
            let value = body(&service_coll)?;
            service_slot.set(value);
            Ok(ServiceOutcome::Completed)
        });

        let target = self.post_target(coll);
        let (op_id, outcome) = self
            .manager
            .ctx_post(ctx, user_data, service, None, hints, target)?;
        Ok((op_id, outcome, slot))
    }

    // Dataspace ops ---------------------------------------------------------

    pub fn ds_create(
        &self,
        coll: &Arc<Collection>,
        req: DsCreateRequest,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<Handle>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.ds_create_sync(&req)
        })
    }

    pub fn ds_create_list(
        &self,
        coll: &Arc<Collection>,
        reqs: Vec<DsCreateRequest>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<Vec<Handle>>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.ds_create_list_sync(&reqs)
        })
    }

    pub fn ds_remove(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.ds_remove_sync(handle)
        })
    }

    pub fn ds_remove_list(
        &self,
        coll: &Arc<Collection>,
        handles: Vec<Handle>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.ds_remove_list_sync(&handles)
        })
    }

    pub fn ds_verify(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<DsType>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.ds_verify_sync(handle)
        })
    }

    pub fn ds_getattr(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<DsAttrs>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.ds_getattr_sync(handle)
        })
    }

    pub fn ds_getattr_list(
        &self,
        coll: &Arc<Collection>,
        handles: Vec<Handle>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<Vec<Result<DsAttrs>>>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            Ok(coll.ds_getattr_list_sync(&handles))
        })
    }

    pub fn ds_setattr(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        attrs: DsAttrs,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.ds_setattr_sync(handle, &attrs)
        })
    }

    pub fn ds_iterate_handles(
        &self,
        coll: &Arc<Collection>,
        start: Option<Handle>,
        max: usize,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<(Vec<Handle>, Option<Handle>)>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.ds_iterate_handles_sync(start, max)
        })
    }

    // Keyval ops ------------------------------------------------------------

    pub fn kv_read(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        type_byte: u8,
        key: Vec<u8>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<Vec<u8>>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_read_sync(handle, type_byte, &key)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn kv_write(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        type_byte: u8,
        key: Vec<u8>,
        value: Vec<u8>,
        flags: KvFlags,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_write_sync(handle, type_byte, &key, &value, flags)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn kv_write_list(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        type_byte: u8,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
        flags: KvFlags,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_write_list_sync(handle, type_byte, &pairs, flags)
        })
    }

    pub fn kv_remove(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        type_byte: u8,
        key: Vec<u8>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_remove_sync(handle, type_byte, &key)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn kv_remove_list(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        type_byte: u8,
        keys: Vec<Vec<u8>>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_remove_list_sync(handle, type_byte, &keys)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn kv_iterate(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        type_byte: u8,
        position: KvPosition,
        max: usize,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<KvIteration>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_iterate_sync(handle, type_byte, position, max)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn kv_iterate_keys(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        type_byte: u8,
        position: KvPosition,
        max: usize,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(
        OpId,
        PostOutcome,
        OpResult<(Vec<Vec<u8>>, Option<collection::PositionToken>)>,
    )> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_iterate_keys_sync(handle, type_byte, position, max)
        })
    }

    pub fn kv_validate(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        type_byte: u8,
        key: Vec<u8>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_validate_sync(handle, type_byte, &key)
        })
    }

    pub fn kv_get_handle_info(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<KvHandleInfo>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.kv_get_handle_info_sync(handle)
        })
    }

    pub fn kv_flush(
        &self,
        coll: &Arc<Collection>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), |coll| {
            coll.kv_flush_sync()
        })
    }

    // Bytestream ops --------------------------------------------------------

    /// Scalar write; a one-segment convenience over [`Self::bs_write_list`]
    pub fn bs_write_at(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        offset: u64,
        data: Vec<u8>,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<BsListDone>)> {
        let size = data.len() as u64;
        self.bs_write_list(
            coll,
            BsListRequest {
                handle,
                buffers: vec![data],
                stream: vec![StreamSegment::new(offset, size)],
            },
            ctx,
            user_data,
        )
    }

    /// Scalar read; a one-segment convenience over [`Self::bs_read_list`]
    pub fn bs_read_at(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        offset: u64,
        len: usize,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<BsListDone>)> {
        self.bs_read_list(
            coll,
            BsListRequest {
                handle,
                buffers: vec![vec![0u8; len]],
                stream: vec![StreamSegment::new(offset, len as u64)],
            },
            ctx,
            user_data,
        )
    }

    pub fn bs_resize(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        size: u64,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.bs_resize_sync(handle, size)
        })
    }

    pub fn bs_validate(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<bstream::BstreamInfo>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.bs_validate_sync(handle)
        })
    }

    pub fn bs_flush(
        &self,
        coll: &Arc<Collection>,
        handle: Handle,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<()>)> {
        self.post_storage_op(coll, ctx, user_data, HintBag::new(), move |coll| {
            coll.bs_flush_sync(handle)
        })
    }

    /// Post a scatter-gather write through the async-I/O backend
    ///
    /// The service closure submits the batch and returns; completion
    /// arrives from the backend's notify callback, which updates the
    /// logical size and completes the op into its context. The result slot
    /// returns the buffers to the caller along with the achieved count.
    pub fn bs_write_list(
        &self,
        coll: &Arc<Collection>,
        req: BsListRequest,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<BsListDone>)> {
        self.bs_list_io(coll, req, AioKind::Write, ctx, user_data)
    }

    /// Post a scatter-gather read through the async-I/O backend
    pub fn bs_read_list(
        &self,
        coll: &Arc<Collection>,
        req: BsListRequest,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<BsListDone>)> {
        self.bs_list_io(coll, req, AioKind::Read, ctx, user_data)
    }

    fn bs_list_io(
        &self,
        coll: &Arc<Collection>,
        req: BsListRequest,
        kind: AioKind,
        ctx: &Arc<CompletionContext>,
        user_data: u64,
    ) -> Result<(OpId, PostOutcome, OpResult<BsListDone>)> {
        let mem_total: u64 = req.buffers.iter().map(|b| b.len() as u64).sum();
        let stream_total: u64 = req.stream.iter().map(|s| s.size).sum();
        if mem_total != stream_total {
            return Err(Error::InvalidArg(format!(
                "memory bytes {} != stream bytes {}",
                mem_total, stream_total
            )));
        }

        let slot = OpResult::new();
        let notify_slot = slot.clone();
        let service_coll = Arc::clone(coll);
        let weak_mgr = Arc::downgrade(&self.manager);
        let aio = Arc::clone(&self.aio);
        let batch_cell: Arc<OnceLock<aio::AioBatchId>> = Arc::new(OnceLock::new());
        let cancel_cell = Arc::clone(&batch_cell);
        let cancel_aio = Arc::clone(&self.aio);

        let mut state = Some(req);
        let service: ServiceFn = Box::new(move |args| {
            let req = state
                .take()
                .ok_or_else(|| Error::Internal("list I/O serviced twice".into()))?;
            let op_id = args.op_id;
            let handle = req.handle;

            // Reads of a never-materialized bytestream are all holes; run
            // the synchronous core inline rather than submitting I/O
            // against a file that does not exist.
            if kind == AioKind::Read && service_coll.bstream_file(handle, false).is_err() {
                let mut buffers = req.buffers;
                let bytes = {
                    let mut mem: Vec<&mut [u8]> =
                        buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
                    service_coll.bs_read_list_sync(handle, &mut mem, &req.stream)?
                };
                notify_slot.set(BsListDone { buffers, bytes });
                return Ok(ServiceOutcome::Completed);
            }

            // Validates the handle names a datafile before touching the file.
            service_coll.bstream_logical_size(handle)?;
            let (file, _path) = service_coll.bstream_file(handle, kind == AioKind::Write)?;
            let fd = file.as_raw_fd();

            // Break the (memory, stream) pair into contiguous pieces; each
            // piece is one descriptor.
            let mut ops = Vec::new();
            let mut piece_ends = Vec::new();
            {
                let mut seg_idx = 0usize;
                let mut seg_off = 0usize;
                for stream_seg in &req.stream {
                    let mut need = stream_seg.size;
                    let mut file_off = stream_seg.offset;
                    while need > 0 {
                        let buf = &req.buffers[seg_idx];
                        let avail = buf.len() - seg_off;
                        let take = (avail as u64).min(need) as usize;
                        ops.push(AioOp {
                            kind,
                            fd,
                            offset: file_off,
                            // Safety note: buffers live in the notify
                            // closure until it has run.
                            buffer: unsafe { buf.as_ptr().add(seg_off) as *mut u8 },
                            len: take,
                        });
                        piece_ends.push(file_off + take as u64);
                        need -= take as u64;
                        file_off += take as u64;
                        seg_off += take;
                        if seg_off == buf.len() {
                            seg_idx += 1;
                            seg_off = 0;
                        }
                    }
                }
            }

            let holder_coll = Arc::clone(&service_coll);
            let holder_slot = notify_slot.clone();
            let holder_mgr = weak_mgr.clone();
            // The notify closure owns the buffers and the file so every
            // descriptor's pointer stays valid until it runs.
            let mut holder = Some((req.buffers, file));
            let expected: Vec<usize> = ops.iter().map(|op| op.len).collect();
            let notify: aio::AioNotify = Box::new(move |results| {
                let (buffers, _file) = holder.take().expect("notify runs once");

                let mut achieved = 0u64;
                let mut committed_end = 0u64;
                let mut failure: Option<Error> = None;
                let mut sorted: Vec<_> = results.iter().collect();
                sorted.sort_by_key(|r| r.index);
                for r in &sorted {
                    match &r.result {
                        Ok(n) => {
                            achieved += *n as u64;
                            if kind == AioKind::Write && *n > 0 {
                                let end = piece_ends[r.index] - (expected[r.index] - *n) as u64;
                                committed_end = committed_end.max(end);
                            }
                            if *n < expected[r.index] {
                                break;
                            }
                        }
                        Err(e) => {
                            failure = Some(e.clone());
                            break;
                        }
                    }
                }

                let mut result = match failure {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                // The commit merges against a freshly read record under the
                // collection size lock; stale baselines cannot clobber a
                // larger committed size.
                if result.is_ok() && kind == AioKind::Write {
                    if let Err(e) = holder_coll.ds_commit_bstream_size(handle, committed_end) {
                        result = Err(e);
                    }
                }

                holder_slot.set(BsListDone {
                    buffers,
                    bytes: achieved,
                });
                if let Some(manager) = holder_mgr.upgrade() {
                    if let Some(op) = manager.op_ref(op_id) {
                        manager.complete_op(&op, result);
                    }
                }
            });

            let batch = aio.submit(ops, notify)?;
            let _ = batch_cell.set(batch);
            Ok(ServiceOutcome::Continue)
        });

        let cancel: crate::mgmt::op::CancelFn = Box::new(move || {
            match cancel_cell.get() {
                Some(batch) => cancel_aio.cancel(*batch),
                None => Err(Error::NotFound),
            }
        });

        let target = self.post_target(coll);
        let (op_id, outcome) =
            self.manager
                .ctx_post(ctx, user_data, service, Some(cancel), HintBag::new(), target)?;
        Ok((op_id, outcome, slot))
    }

    // Completion testing ----------------------------------------------------

    pub fn test_op(&self, op_id: OpId, timeout: Duration) -> Result<crate::mgmt::context::Completion> {
        self.manager.test_op(op_id, timeout)
    }

    pub fn test_some(
        &self,
        ctx: &Arc<CompletionContext>,
        op_ids: &[OpId],
        timeout: Duration,
    ) -> Result<Vec<crate::mgmt::context::Completion>> {
        ctx.test_some(op_ids, timeout)
    }

    pub fn test_context(
        &self,
        ctx: &Arc<CompletionContext>,
        timeout: Duration,
    ) -> Result<Vec<crate::mgmt::context::Completion>> {
        self.manager.test_context(ctx, timeout)
    }

    pub fn wait_context(&self, ctx: &Arc<CompletionContext>, timeout: Duration) -> Result<()> {
        self.manager.wait_context(ctx, timeout)
    }

    pub fn cancel(&self, op_id: OpId) -> Result<()> {
        self.manager.cancel(op_id)
    }
}
