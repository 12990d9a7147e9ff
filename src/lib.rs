//! Stratum - operation management and storage engine core
//!
//! Stratum is the server-side core of a parallel filesystem: a generic
//! asynchronous operation manager that multiplexes typed units of work over
//! pluggable execution strategies, and the append-friendly storage engine it
//! drives (handle-addressed dataspaces, per-handle bytestreams, and an
//! ordered key-value store).
//!
//! # Architecture
//!
//! - **Op management**: managers, completion contexts, op queues, and six
//!   worker variants (blocking, per-op thread, cooperative queues, threaded
//!   queues, external, pool)
//! - **Storage engine**: collections, dataspaces with typed attribute
//!   records, sparse bytestreams with scatter-gather list I/O, and a
//!   (handle, type, key) ordered keyval store
//! - **Flow engine**: double-buffered streaming transfers between network,
//!   memory, and storage endpoints
//!
//! Callers post operations to an [`mgmt::OpManager`] and collect completions
//! through a [`mgmt::context::CompletionContext`]; the storage engine posts
//! its own I/O through the same machinery.

pub mod config;
pub mod error;
pub mod flow;
pub mod hints;
pub mod mgmt;
pub mod registry;
pub mod storage;

// Re-export commonly used types
pub use error::Error;
pub use hints::HintBag;
pub use mgmt::OpManager;
pub use storage::StorageSpace;

/// Result type used throughout Stratum
pub type Result<T> = std::result::Result<T, Error>;
