//! Low-level primitives the transactional core is built on.
//!
//! Includes the completion latch used by the commit pipeline, the log device
//! contract, and the buffer/pin manager for evictable payloads.

/// Concurrency primitives and synchronization.
pub mod concurrency;

/// Buffer/pin manager controlling residency of large payloads.
pub mod pager;

/// Log device contract and implementations.
///
/// Durable append/load of opaque payloads grouped by stream.
pub mod wal;
