use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::metrics::TxnMetrics;
use crate::types::{BasaltError, Result};

/// Default capacity of the preparing and commit queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default number of operations a pipeline worker drains per batch.
pub const DEFAULT_BATCH_SIZE: usize = 64;
/// Default resident capacity of the buffer pool.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024 * 1024;

/// Tuning for the transaction manager pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnOptions {
    /// Bound of the preparing queue; `commit`/`rollback` callers block when full.
    pub preparing_queue_capacity: usize,
    /// Bound of the commit queue between the two stages.
    pub commit_queue_capacity: usize,
    /// Maximum operations drained per worker wakeup.
    pub batch_size: usize,
    /// Upper bound on any wait for another transaction's outcome.
    /// `None` waits indefinitely.
    pub commit_wait_timeout: Option<Duration>,
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self {
            preparing_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            commit_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            commit_wait_timeout: None,
        }
    }
}

impl TxnOptions {
    /// Sets the preparing queue bound.
    pub fn preparing_queue_capacity(mut self, capacity: usize) -> Self {
        self.preparing_queue_capacity = capacity;
        self
    }

    /// Sets the commit queue bound.
    pub fn commit_queue_capacity(mut self, capacity: usize) -> Self {
        self.commit_queue_capacity = capacity;
        self
    }

    /// Sets the worker batch size.
    pub fn batch_size(mut self, batch: usize) -> Self {
        self.batch_size = batch;
        self
    }

    /// Bounds waits on in-flight commits.
    pub fn commit_wait_timeout(mut self, timeout: Duration) -> Self {
        self.commit_wait_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.preparing_queue_capacity == 0 || self.commit_queue_capacity == 0 {
            return Err(BasaltError::Invalid("queue capacity must be non-zero"));
        }
        if self.batch_size == 0 {
            return Err(BasaltError::Invalid("batch size must be non-zero"));
        }
        Ok(())
    }
}

/// Buffer pool sizing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferOptions {
    /// Resident bytes above which unpinned payloads are unloaded.
    pub capacity_bytes: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl BufferOptions {
    /// Sets the resident byte capacity.
    pub fn capacity_bytes(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }
}

/// Options supplied to [`crate::Engine::open`].
#[derive(Clone, Default)]
pub struct EngineOptions {
    /// Transaction pipeline tuning.
    pub txn: TxnOptions,
    /// Buffer pool sizing.
    pub buffer: BufferOptions,
    /// Directory for the update log; `None` keeps spilled payloads in memory.
    pub log_dir: Option<PathBuf>,
    /// Optional metrics sink.
    pub metrics: Option<Arc<dyn TxnMetrics>>,
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("txn", &self.txn)
            .field("buffer", &self.buffer)
            .field("log_dir", &self.log_dir)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl EngineOptions {
    /// Sets the transaction options.
    pub fn txn(mut self, txn: TxnOptions) -> Self {
        self.txn = txn;
        self
    }

    /// Sets the buffer options.
    pub fn buffer(mut self, buffer: BufferOptions) -> Self {
        self.buffer = buffer;
        self
    }

    /// Places the update log under `dir`.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Sets the metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn TxnMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Parses options from a TOML document, falling back to defaults for
    /// anything not present.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let raw: RawOptions =
            toml::from_str(src).map_err(|_| BasaltError::Invalid("malformed options document"))?;
        let opts = raw.into_options();
        opts.validate()?;
        Ok(opts)
    }

    /// Reads and parses a TOML options file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.txn.validate()?;
        if self.buffer.capacity_bytes == 0 {
            return Err(BasaltError::Invalid("buffer capacity must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    #[serde(default)]
    txn: RawTxnOptions,
    #[serde(default)]
    buffer: RawBufferOptions,
    #[serde(default)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTxnOptions {
    preparing_queue_capacity: Option<usize>,
    commit_queue_capacity: Option<usize>,
    batch_size: Option<usize>,
    commit_wait_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBufferOptions {
    capacity_bytes: Option<usize>,
}

impl RawOptions {
    fn into_options(self) -> EngineOptions {
        let defaults = TxnOptions::default();
        let txn = TxnOptions {
            preparing_queue_capacity: self
                .txn
                .preparing_queue_capacity
                .unwrap_or(defaults.preparing_queue_capacity),
            commit_queue_capacity: self
                .txn
                .commit_queue_capacity
                .unwrap_or(defaults.commit_queue_capacity),
            batch_size: self.txn.batch_size.unwrap_or(defaults.batch_size),
            commit_wait_timeout: self.txn.commit_wait_timeout_ms.map(Duration::from_millis),
        };
        let buffer = BufferOptions {
            capacity_bytes: self
                .buffer
                .capacity_bytes
                .unwrap_or(DEFAULT_BUFFER_CAPACITY),
        };
        EngineOptions {
            txn,
            buffer,
            log_dir: self.log_dir,
            metrics: None,
        }
    }
}
