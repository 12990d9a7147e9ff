//! Configuration
//!
//! TOML-loadable tunables for the storage engine, the op manager's worker
//! defaults, and the flow engine. Every field has a default so an empty
//! config is valid; [`Config::validate`] rejects values that would
//! misbehave at runtime rather than letting them fail deep in the engine.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub workers: WorkerDefaults,
    #[serde(default)]
    pub flow: FlowConfig,
}

/// Metadata sync policy for a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Sync metadata tables on every completed write
    #[default]
    Always,
    /// Coalesce syncs between the low and high watermarks of queued writes
    Coalesce,
    /// Never sync implicitly; callers must flush
    Never,
}

/// Storage engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Seconds a freed handle stays in purgatory before reissue
    #[serde(default = "default_purgatory_secs")]
    pub handle_purgatory_secs: u64,

    /// Metadata sync policy applied to new collections
    #[serde(default)]
    pub sync_policy: SyncPolicy,

    /// Coalescing watermarks (pending metadata writes) for
    /// [`SyncPolicy::Coalesce`]
    #[serde(default = "default_low_watermark")]
    pub sync_low_watermark: usize,
    #[serde(default = "default_high_watermark")]
    pub sync_high_watermark: usize,

    /// Complete trivial metadata ops inline instead of queueing them
    #[serde(default)]
    pub immediate_completion: bool,

    /// Number of bstream hash buckets under each collection
    #[serde(default = "default_bstream_buckets")]
    pub bstream_buckets: u32,

    /// Maximum keyval key length in bytes
    #[serde(default = "default_key_max")]
    pub key_max: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            handle_purgatory_secs: default_purgatory_secs(),
            sync_policy: SyncPolicy::default(),
            sync_low_watermark: default_low_watermark(),
            sync_high_watermark: default_high_watermark(),
            immediate_completion: false,
            bstream_buckets: default_bstream_buckets(),
            key_max: default_key_max(),
        }
    }
}

/// Defaults applied when worker attributes leave fields unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDefaults {
    /// Threads for threaded-queues workers (0 = one per CPU)
    #[serde(default)]
    pub thread_count: usize,

    /// Ops pulled from a queue per servicing round
    #[serde(default = "default_ops_per_queue")]
    pub ops_per_queue: usize,

    /// Queue wait timeout in microseconds
    #[serde(default = "default_wait_timeout_us")]
    pub wait_timeout_us: u64,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        WorkerDefaults {
            thread_count: 0,
            ops_per_queue: default_ops_per_queue(),
            wait_timeout_us: default_wait_timeout_us(),
        }
    }
}

impl WorkerDefaults {
    /// Effective thread count (resolves 0 to the CPU count)
    pub fn effective_thread_count(&self) -> usize {
        if self.thread_count == 0 {
            num_cpus::get()
        } else {
            self.thread_count
        }
    }
}

/// Flow engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Size of each staging buffer in bytes
    #[serde(default = "default_flow_buffer_size")]
    pub buffer_size: usize,

    /// Buffer alignment (power of two; O_DIRECT-compatible)
    #[serde(default = "default_flow_alignment")]
    pub buffer_alignment: usize,

    /// Maximum scatter-gather segments per submission before the flow
    /// falls back to contiguous staging
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            buffer_size: default_flow_buffer_size(),
            buffer_alignment: default_flow_alignment(),
            max_segments: default_max_segments(),
        }
    }
}

fn default_purgatory_secs() -> u64 {
    2
}

fn default_low_watermark() -> usize {
    1
}

fn default_high_watermark() -> usize {
    8
}

fn default_bstream_buckets() -> u32 {
    64
}

fn default_key_max() -> usize {
    256
}

fn default_ops_per_queue() -> usize {
    8
}

fn default_wait_timeout_us() -> u64 {
    10_000
}

fn default_flow_buffer_size() -> usize {
    256 * 1024
}

fn default_flow_alignment() -> usize {
    4096
}

fn default_max_segments() -> usize {
    64
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| Error::InvalidArg(format!("config parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations that would misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        if self.storage.bstream_buckets == 0 {
            return Err(Error::InvalidArg("storage.bstream_buckets must be > 0".into()));
        }
        if self.storage.key_max == 0 {
            return Err(Error::InvalidArg("storage.key_max must be > 0".into()));
        }
        if self.storage.sync_low_watermark > self.storage.sync_high_watermark {
            return Err(Error::InvalidArg(
                "storage.sync_low_watermark exceeds sync_high_watermark".into(),
            ));
        }
        if self.workers.ops_per_queue == 0 {
            return Err(Error::InvalidArg("workers.ops_per_queue must be > 0".into()));
        }
        if self.flow.buffer_size == 0 {
            return Err(Error::InvalidArg("flow.buffer_size must be > 0".into()));
        }
        if !self.flow.buffer_alignment.is_power_of_two() {
            return Err(Error::InvalidArg(
                "flow.buffer_alignment must be a power of two".into(),
            ));
        }
        if self.flow.max_segments == 0 {
            return Err(Error::InvalidArg("flow.max_segments must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.handle_purgatory_secs, 2);
        assert_eq!(config.storage.bstream_buckets, 64);
        assert_eq!(config.workers.ops_per_queue, 8);
    }

    #[test]
    fn test_empty_toml() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.storage.key_max, 256);
    }

    #[test]
    fn test_parse_overrides() {
        let toml = r#"
            [storage]
            handle_purgatory_secs = 30
            sync_policy = "coalesce"

            [workers]
            thread_count = 4

            [flow]
            buffer_size = 65536
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.storage.handle_purgatory_secs, 30);
        assert_eq!(config.storage.sync_policy, SyncPolicy::Coalesce);
        assert_eq!(config.workers.thread_count, 4);
        assert_eq!(config.workers.effective_thread_count(), 4);
        assert_eq!(config.flow.buffer_size, 65536);
    }

    #[test]
    fn test_validate_rejects_bad_alignment() {
        let toml = r#"
            [flow]
            buffer_alignment = 1000
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let toml = r#"
            [storage]
            sync_low_watermark = 10
            sync_high_watermark = 2
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }
}
