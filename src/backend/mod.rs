//! Shared Store Backends
//!
//! The shared tier speaks to its store through the [`StoreBackend`] port:
//! a small key/value surface with TTLs, set membership for tag indexes,
//! cursor scans, the conditional primitives stampede control needs, and a
//! pub/sub channel for invalidation fan-out.
//!
//! Two implementations ship: a Redis-backed one for production and an
//! in-memory one with the same semantics for tests and single-process use.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

mod memory;
mod redis;

pub use memory::InMemoryBackend;
pub use redis::RedisBackend;

/// Buffer size of the channel handed out by [`StoreBackend::subscribe`]
pub(crate) const SUBSCRIBE_BUFFER: usize = 256;

/// Port to the shared store
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Get the payload stored under a key
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a payload under a key with a TTL
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Store a payload only if the key is absent; returns whether it was stored
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool>;

    /// Delete a key only if it still holds the expected payload, atomically;
    /// returns whether it was deleted
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// One page of a cursor scan over keys matching a glob pattern.
    /// A returned cursor of zero means the scan is complete.
    async fn scan(&self, cursor: u64, pattern: &str, page_size: usize)
        -> Result<(u64, Vec<String>)>;

    /// Add a member to the set stored under a key
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    /// All members of the set stored under a key
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Reset the TTL of an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Time until a key expires; `None` when the key is absent or unbounded
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Publish a payload to a broadcast channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a broadcast channel. Payloads arrive on the returned
    /// receiver until it is dropped; the feed survives store reconnects.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<()>;
}
