//! In-Memory Store Backend
//!
//! The Redis contract without a server: DashMap storage with lazy expiry,
//! keyset scan cursors that tolerate deletes between pages, and loopback
//! pub/sub channels. Backs tests and single-process deployments.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{StoreBackend, SUBSCRIBE_BUFFER};
use crate::error::Result;
use crate::key::pattern_matches;

struct StoredValue {
    bytes: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(bytes: Bytes, ttl: Duration) -> Self {
        Self {
            bytes,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct StoredSet {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

impl StoredSet {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

/// Abandoned scan cursors are dropped after this long
const SCAN_SESSION_TTL: Duration = Duration::from_secs(300);

/// Resume point of a paged scan, keyed by the cursor token handed out
/// with the previous page
struct ScanSession {
    resume_after: String,
    started: Instant,
}

/// In-memory shared store
///
/// Values and sets live in separate maps; callers keep them apart through
/// key prefixes, the way the coordinator does.
pub struct InMemoryBackend {
    entries: DashMap<String, StoredValue>,
    sets: DashMap<String, StoredSet>,
    subscribers: DashMap<String, Vec<mpsc::Sender<String>>>,
    scans: DashMap<u64, ScanSession>,
    next_scan_token: AtomicU64,
}

impl InMemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            sets: DashMap::new(),
            subscribers: DashMap::new(),
            scans: DashMap::new(),
            // 0 is the start-and-done sentinel, never a live token
            next_scan_token: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl StoreBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if let Some(value) = self.entries.get(key) {
            if !value.is_expired() {
                return Ok(Some(value.bytes.clone()));
            }
        }
        self.entries.remove_if(key, |_, v| v.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        // The entry guard holds the shard lock, making the check-and-insert atomic
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let removed = self
            .entries
            .remove_if(key, |_, v| !v.is_expired() && v.bytes.as_ref() == expected);
        Ok(removed.is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0u64;
        for key in keys {
            if let Some((_, value)) = self.entries.remove(key) {
                if !value.is_expired() {
                    removed += 1;
                }
                continue;
            }
            if let Some((_, set)) = self.sets.remove(key) {
                if !set.is_expired() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: usize,
    ) -> Result<(u64, Vec<String>)> {
        // Keyset cursor: each page resumes strictly after the last key the
        // previous page examined in sorted order, so deleting returned keys
        // between pages never shifts the window. Every key present for the
        // whole scan comes back exactly once; keys written mid-scan may be
        // missed, as with a server-side scan.
        let resume_after = if cursor == 0 {
            self.scans
                .retain(|_, session| session.started.elapsed() < SCAN_SESSION_TTL);
            None
        } else {
            match self.scans.remove(&cursor) {
                Some((_, session)) => Some(session.resume_after),
                // stale or unknown cursor: that scan has nothing left
                None => return Ok((0, Vec::new())),
            }
        };

        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        keys.extend(
            self.sets
                .iter()
                .filter(|e| !e.value().is_expired())
                .map(|e| e.key().clone()),
        );
        keys.sort();

        let page_size = page_size.max(1);
        let mut remaining: Vec<String> = keys
            .into_iter()
            .filter(|k| {
                resume_after
                    .as_deref()
                    .map_or(true, |last| k.as_str() > last)
            })
            .collect();
        let exhausted = remaining.len() <= page_size;
        remaining.truncate(page_size);

        let next = if exhausted {
            0
        } else {
            let token = self.next_scan_token.fetch_add(1, Ordering::Relaxed);
            self.scans.insert(
                token,
                ScanSession {
                    // non-empty here: truncate kept page_size >= 1 keys
                    resume_after: remaining.last().cloned().unwrap_or_default(),
                    started: Instant::now(),
                },
            );
            token
        };

        let page = remaining
            .into_iter()
            .filter(|k| pattern_matches(pattern, k))
            .collect();
        Ok((next, page))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut set = self.sets.entry(key.to_string()).or_default();
        if set.is_expired() {
            set.members.clear();
            set.expires_at = None;
        }
        set.members.insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        if let Some(set) = self.sets.get(key) {
            if !set.is_expired() {
                return Ok(set.members.iter().cloned().collect());
            }
        }
        self.sets.remove_if(key, |_, s| s.is_expired());
        Ok(Vec::new())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut value) = self.entries.get_mut(key) {
            if !value.is_expired() {
                value.expires_at = Some(Instant::now() + ttl);
                return Ok(());
            }
        }
        if let Some(mut set) = self.sets.get_mut(key) {
            if !set.is_expired() {
                set.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        if let Some(value) = self.entries.get(key) {
            if !value.is_expired() {
                return Ok(value
                    .expires_at
                    .map(|at| at.saturating_duration_since(Instant::now())));
            }
        }
        if let Some(set) = self.sets.get(key) {
            if !set.is_expired() {
                return Ok(set
                    .expires_at
                    .map(|at| at.saturating_duration_since(Instant::now())));
            }
        }
        Ok(None)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // Clone the sender list out so no map lock is held across an await
        let targets: Vec<mpsc::Sender<String>> = match self.subscribers.get(channel) {
            Some(list) => list.clone(),
            None => return Ok(()),
        };

        for tx in targets {
            let _ = tx.send(payload.to_string()).await;
        }

        if let Some(mut list) = self.subscribers.get_mut(channel) {
            list.retain(|tx| !tx.is_closed());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn make_backend() -> InMemoryBackend {
        InMemoryBackend::new()
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let backend = make_backend();

        backend
            .set("k", Bytes::from_static(b"data"), TTL)
            .await
            .unwrap();

        let result = backend.get("k").await.unwrap();
        assert_eq!(result, Some(Bytes::from_static(b"data")));
    }

    #[tokio::test]
    async fn test_get_expired_returns_none() {
        let backend = make_backend();

        backend
            .set("k", Bytes::from_static(b"data"), Duration::ZERO)
            .await
            .unwrap();

        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let backend = make_backend();

        assert!(backend
            .set_if_absent("lock", Bytes::from_static(b"a"), TTL)
            .await
            .unwrap());
        assert!(!backend
            .set_if_absent("lock", Bytes::from_static(b"b"), TTL)
            .await
            .unwrap());

        // Holder kept the first payload
        let held = backend.get("lock").await.unwrap();
        assert_eq!(held, Some(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn test_set_if_absent_after_expiry() {
        let backend = make_backend();

        backend
            .set_if_absent("lock", Bytes::from_static(b"a"), Duration::ZERO)
            .await
            .unwrap();

        assert!(backend
            .set_if_absent("lock", Bytes::from_static(b"b"), TTL)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let backend = make_backend();

        backend
            .set("lock", Bytes::from_static(b"owner-1"), TTL)
            .await
            .unwrap();

        assert!(!backend
            .compare_and_delete("lock", b"owner-2")
            .await
            .unwrap());
        assert!(backend.get("lock").await.unwrap().is_some());

        assert!(backend
            .compare_and_delete("lock", b"owner-1")
            .await
            .unwrap());
        assert!(backend.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_counts_existing() {
        let backend = make_backend();

        backend
            .set("k1", Bytes::from_static(b"1"), TTL)
            .await
            .unwrap();
        backend
            .set("k2", Bytes::from_static(b"2"), TTL)
            .await
            .unwrap();

        let keys = vec!["k1".to_string(), "k2".to_string(), "k3".to_string()];
        assert_eq!(backend.delete(&keys).await.unwrap(), 2);
        assert!(backend.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_nothing() {
        let backend = make_backend();
        assert_eq!(backend.delete(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scan_pages_through_matches() {
        let backend = make_backend();

        for key in ["user:1", "user:2", "order:1"] {
            backend
                .set(key, Bytes::from_static(b"x"), TTL)
                .await
                .unwrap();
        }

        let mut cursor = 0u64;
        let mut found = Vec::new();
        loop {
            let (next, page) = backend.scan(cursor, "user:*", 1).await.unwrap();
            found.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        found.sort();
        assert_eq!(found, vec!["user:1".to_string(), "user:2".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_pages_survive_deletes_between_pages() {
        let backend = make_backend();

        for i in 1..=6 {
            backend
                .set(&format!("user:{i}"), Bytes::from_static(b"x"), TTL)
                .await
                .unwrap();
        }

        let mut cursor = 0u64;
        let mut found = Vec::new();
        loop {
            let (next, page) = backend.scan(cursor, "user:*", 2).await.unwrap();
            // deleting the page must not shift what the next page sees
            backend.delete(&page).await.unwrap();
            found.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        found.sort();
        let expected: Vec<String> = (1..=6).map(|i| format!("user:{i}")).collect();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_scan_with_stale_cursor_is_done() {
        let backend = make_backend();
        backend.set("k", Bytes::from_static(b"x"), TTL).await.unwrap();

        let (next, page) = backend.scan(987, "*", 10).await.unwrap();
        assert_eq!(next, 0);
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_set_add_and_members() {
        let backend = make_backend();

        backend.set_add("tag:users", "user:1").await.unwrap();
        backend.set_add("tag:users", "user:1").await.unwrap();
        backend.set_add("tag:users", "user:2").await.unwrap();

        let mut members = backend.set_members("tag:users").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["user:1".to_string(), "user:2".to_string()]);
    }

    #[tokio::test]
    async fn test_expire_and_remaining_ttl() {
        let backend = make_backend();

        backend
            .set("k", Bytes::from_static(b"x"), Duration::from_secs(60))
            .await
            .unwrap();

        let remaining = backend.remaining_ttl("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));

        backend.expire("k", Duration::from_secs(5)).await.unwrap();
        let remaining = backend.remaining_ttl("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(5));

        assert!(backend.remaining_ttl("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_set_resets_on_add() {
        let backend = make_backend();

        backend.set_add("tag:t", "a").await.unwrap();
        backend.expire("tag:t", Duration::ZERO).await.unwrap();

        assert!(backend.set_members("tag:t").await.unwrap().is_empty());

        backend.set_add("tag:t", "b").await.unwrap();
        assert_eq!(backend.set_members("tag:t").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_publish_subscribe_loopback() {
        let backend = make_backend();

        let mut rx = backend.subscribe("bus").await.unwrap();
        backend.publish("bus", "hello").await.unwrap();

        assert_eq!(rx.recv().await, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let backend = make_backend();

        let mut rx1 = backend.subscribe("bus").await.unwrap();
        let mut rx2 = backend.subscribe("bus").await.unwrap();
        backend.publish("bus", "payload").await.unwrap();

        assert_eq!(rx1.recv().await, Some("payload".to_string()));
        assert_eq!(rx2.recv().await, Some("payload".to_string()));
    }

    #[tokio::test]
    async fn test_publish_after_subscriber_dropped() {
        let backend = make_backend();

        let rx = backend.subscribe("bus").await.unwrap();
        drop(rx);

        backend.publish("bus", "into the void").await.unwrap();
        backend.publish("bus", "still fine").await.unwrap();
    }

    #[tokio::test]
    async fn test_ping() {
        let backend = make_backend();
        backend.ping().await.unwrap();
    }
}
