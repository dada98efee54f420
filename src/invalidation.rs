//! Invalidation Broadcast
//!
//! Cross-process invalidation rides the shared store's pub/sub channel.
//! A coordinator that mutates shared state publishes a scope message; every
//! other coordinator evicts the matching LOCAL entries on receipt. The
//! consumer never touches the shared tier, the publisher already did.
//!
//! Messages carry the origin coordinator's id so a process can skip its own
//! broadcasts: it already evicted locally, synchronously, before publishing.
//!
//! Delivery is best effort. A process that misses a message keeps serving
//! its local copy for at most that entry's remaining local TTL, which is the
//! staleness bound of the whole scheme.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::local::LocalTier;

/// Broadcast channel name for a namespace
pub fn channel_for(namespace: &str) -> String {
    format!("{namespace}:invalidate")
}

// =============================================================================
// Message
// =============================================================================

/// What a broadcast message asks receivers to evict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationScope {
    /// One fully rendered key
    Key { key: String },
    /// Every key stored under a tag
    Tag { tag: String },
    /// Every key matching a glob pattern
    Pattern { pattern: String },
    /// Everything in the namespace
    Clear,
}

/// A single invalidation broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Coordinator instance that published the message
    pub origin: Uuid,
    /// What to evict
    #[serde(flatten)]
    pub scope: InvalidationScope,
}

impl InvalidationMessage {
    /// Message evicting one key
    pub fn key(origin: Uuid, key: impl Into<String>) -> Self {
        Self {
            origin,
            scope: InvalidationScope::Key { key: key.into() },
        }
    }

    /// Message evicting a tag's members
    pub fn tag(origin: Uuid, tag: impl Into<String>) -> Self {
        Self {
            origin,
            scope: InvalidationScope::Tag { tag: tag.into() },
        }
    }

    /// Message evicting keys matching a pattern
    pub fn pattern(origin: Uuid, pattern: impl Into<String>) -> Self {
        Self {
            origin,
            scope: InvalidationScope::Pattern {
                pattern: pattern.into(),
            },
        }
    }

    /// Message evicting the whole namespace
    pub fn clear(origin: Uuid) -> Self {
        Self {
            origin,
            scope: InvalidationScope::Clear,
        }
    }

    /// Scope name for logging
    pub fn kind(&self) -> &'static str {
        match self.scope {
            InvalidationScope::Key { .. } => "key",
            InvalidationScope::Tag { .. } => "tag",
            InvalidationScope::Pattern { .. } => "pattern",
            InvalidationScope::Clear => "clear",
        }
    }

    /// Render to the wire form
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Serialize)
    }

    /// Parse from the wire form
    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(Error::Deserialize)
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Apply a received scope to the local tier, returning how many entries went
pub(crate) fn apply_scope(local: &LocalTier, scope: &InvalidationScope) -> usize {
    match scope {
        InvalidationScope::Key { key } => usize::from(local.remove(key)),
        InvalidationScope::Tag { tag } => local.remove_by_tag(tag),
        InvalidationScope::Pattern { pattern } => local.remove_by_pattern(pattern),
        InvalidationScope::Clear => {
            let evicted = local.len();
            local.clear();
            evicted
        }
    }
}

/// Drain the broadcast feed, evicting local entries for every remote message.
///
/// Malformed payloads are logged and skipped; eviction must keep flowing.
/// Returns when the coordinator shuts down or the feed closes for good.
pub(crate) async fn run_listener(
    mut feed: mpsc::Receiver<String>,
    local: Arc<LocalTier>,
    origin: Uuid,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("invalidation listener stopped");
                return;
            }
            message = feed.recv() => {
                match message {
                    Some(payload) => handle_payload(&local, origin, &payload),
                    None => {
                        warn!("invalidation feed closed");
                        return;
                    }
                }
            }
        }
    }
}

fn handle_payload(local: &LocalTier, origin: Uuid, payload: &str) {
    let message = match InvalidationMessage::decode(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "ignoring malformed invalidation message");
            return;
        }
    };

    if message.origin == origin {
        return;
    }

    let evicted = apply_scope(local, &message.scope);
    debug!(kind = message.kind(), evicted, "applied remote invalidation");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    fn seed(local: &LocalTier) {
        local.insert(
            "user:1".into(),
            Bytes::from_static(b"1"),
            TTL,
            &["users".into()],
        );
        local.insert(
            "user:2".into(),
            Bytes::from_static(b"2"),
            TTL,
            &["users".into()],
        );
        local.insert("order:1".into(), Bytes::from_static(b"3"), TTL, &[]);
    }

    #[test]
    fn test_message_wire_shape() {
        let origin = Uuid::new_v4();
        let message = InvalidationMessage::key(origin, "user:1");

        let json = message.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        // Flat envelope: origin and scope fields side by side
        assert_eq!(value["type"], "key");
        assert_eq!(value["key"], "user:1");
        assert_eq!(value["origin"], origin.to_string());
    }

    #[test]
    fn test_message_round_trip() {
        let origin = Uuid::new_v4();
        for message in [
            InvalidationMessage::key(origin, "k"),
            InvalidationMessage::tag(origin, "t"),
            InvalidationMessage::pattern(origin, "user:*"),
            InvalidationMessage::clear(origin),
        ] {
            let decoded = InvalidationMessage::decode(&message.encode().unwrap()).unwrap();
            assert_eq!(decoded.origin, origin);
            assert_eq!(decoded.scope, message.scope);
        }
    }

    #[test]
    fn test_decode_malformed() {
        assert_matches!(
            InvalidationMessage::decode("not json"),
            Err(Error::Deserialize(_))
        );
        assert_matches!(
            InvalidationMessage::decode(r#"{"type":"warp","origin":"x"}"#),
            Err(Error::Deserialize(_))
        );
    }

    #[test]
    fn test_apply_scope_key() {
        let local = LocalTier::new();
        seed(&local);

        let evicted = apply_scope(&local, &InvalidationScope::Key { key: "user:1".into() });
        assert_eq!(evicted, 1);
        assert!(!local.contains("user:1"));
        assert!(local.contains("user:2"));
    }

    #[test]
    fn test_apply_scope_tag() {
        let local = LocalTier::new();
        seed(&local);

        let evicted = apply_scope(&local, &InvalidationScope::Tag { tag: "users".into() });
        assert_eq!(evicted, 2);
        assert!(local.contains("order:1"));
    }

    #[test]
    fn test_apply_scope_pattern() {
        let local = LocalTier::new();
        seed(&local);

        let evicted = apply_scope(
            &local,
            &InvalidationScope::Pattern {
                pattern: "user:*".into(),
            },
        );
        assert_eq!(evicted, 2);
        assert!(local.contains("order:1"));
    }

    #[test]
    fn test_apply_scope_clear() {
        let local = LocalTier::new();
        seed(&local);

        let evicted = apply_scope(&local, &InvalidationScope::Clear);
        assert_eq!(evicted, 3);
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_listener_applies_remote_messages() {
        let local = Arc::new(LocalTier::new());
        seed(&local);

        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let origin = Uuid::new_v4();
        let remote = Uuid::new_v4();

        let handle = tokio::spawn(run_listener(
            rx,
            Arc::clone(&local),
            origin,
            shutdown.clone(),
        ));

        tx.send(InvalidationMessage::key(remote, "user:1").encode().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!local.contains("user:1"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_skips_own_messages() {
        let local = Arc::new(LocalTier::new());
        seed(&local);

        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let origin = Uuid::new_v4();

        let handle = tokio::spawn(run_listener(
            rx,
            Arc::clone(&local),
            origin,
            shutdown.clone(),
        ));

        tx.send(InvalidationMessage::clear(origin).encode().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(local.len(), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_survives_malformed_payloads() {
        let local = Arc::new(LocalTier::new());
        seed(&local);

        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let remote = Uuid::new_v4();

        let handle = tokio::spawn(run_listener(
            rx,
            Arc::clone(&local),
            Uuid::new_v4(),
            shutdown.clone(),
        ));

        tx.send("garbage".to_string()).await.unwrap();
        tx.send(InvalidationMessage::key(remote, "order:1").encode().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The bad payload was skipped, the good one applied
        assert!(!local.contains("order:1"));
        assert!(local.contains("user:1"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_for("app"), "app:invalidate");
    }
}
