//! StrataCache - Multi-Tier Cache Coordination Engine
//!
//! A two-tier caching engine for service fleets: a bounded in-process tier
//! in front of a shared network store, coordinated so that independently
//! running processes agree on what is cached, what is invalid, and which
//! caller gets to recompute an expensive value when it goes cold.
//!
//! # Architecture
//!
//! ```text
//! caller → Coordinator → Local Tier (per process)
//!                      → Shared Store (Redis, fleet-wide)
//!                      ↔ Invalidation Broadcast (pub/sub)
//! ```
//!
//! # Features
//!
//! - Read-through two-tier lookup with TTL carry-over
//! - Stampede control: one computation per cold key, cluster-wide
//! - Stale-while-revalidate serving
//! - Tag, pattern, and full-namespace invalidation with cross-process
//!   eviction broadcast
//! - LZ4-compressed payload envelope
//! - Deterministic cache key builder
//! - Windowed metrics with sorted-sample percentiles
//!
//! # Modules
//!
//! - [`backend`] - Shared store port and its Redis/in-memory implementations
//! - [`codec`] - Serialization + compression payload envelope
//! - [`coordinator`] - The two-tier cache coordinator
//! - [`error`] - Error types
//! - [`invalidation`] - Broadcast message schema and listener
//! - [`key`] - Deterministic cache key builder and glob matching
//! - [`local`] - Bounded in-process tier with LRU batch eviction
//! - [`metrics`] - Counters, gauges, and latency windows
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stratacache::{CacheCoordinator, CacheOptions, RedisBackend};
//!
//! # async fn demo() -> stratacache::Result<()> {
//! let store = Arc::new(RedisBackend::connect("redis://127.0.0.1/").await?);
//! let cache = CacheCoordinator::new(store).await?;
//!
//! let report: Vec<u64> = cache
//!     .get_or_set(
//!         "report:2024",
//!         || async { Ok(expensive_report().await) },
//!         &CacheOptions::default(),
//!     )
//!     .await?;
//! # let _ = report;
//! # Ok(())
//! # }
//! # async fn expensive_report() -> Vec<u64> { Vec::new() }
//! ```

pub mod backend;
pub mod codec;
pub mod coordinator;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod local;
pub mod metrics;

// Re-export commonly used types
pub use backend::{InMemoryBackend, RedisBackend, StoreBackend};
pub use coordinator::{CacheConfig, CacheCoordinator, CacheOptions, WarmEntry};
pub use error::{Error, Result};
pub use key::KeyBuilder;
pub use metrics::CacheStats;
