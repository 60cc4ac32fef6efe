//! Basalt: a multi-version transactional catalog with per-block update chains.
//!
//! Transactions read a snapshot fixed at their start timestamp and commit
//! through a two-stage pipeline. Catalog objects (databases, tables, segments
//! and blocks) and block row updates share one version-chain and visibility
//! model.

#![warn(missing_docs)]

pub mod engine;
pub mod logging;
pub mod metrics;
pub mod options;
pub mod primitives;
pub mod storage;
pub mod txn;
pub mod types;

pub use engine::Engine;
pub use metrics::{CounterMetrics, NoopMetrics, TxnMetrics};
pub use options::{BufferOptions, EngineOptions, TxnOptions};
pub use storage::{Catalog, CatalogObject, EntityKind, NameScope, UpdateChain, UpdateView};
pub use txn::{Transaction, TxnCtx, TxnManager};
pub use types::{BasaltError, ObjectId, Result, Timestamp, TxnId, TxnState, UNCOMMIT_TS};
