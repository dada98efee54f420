//! Redis Store Backend
//!
//! Shared store on Redis: a multiplexed command connection with automatic
//! reconnects, SCAN-based cursor paging, conditional primitives executed
//! server-side, and one dedicated pub/sub connection per subscription that
//! resubscribes with backoff when its stream drops.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{StoreBackend, SUBSCRIBE_BUFFER};
use crate::error::{Error, Result};

/// Deletes the key only while it still holds the caller's token
const COMPARE_AND_DELETE: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// First wait before a dropped pub/sub stream is reopened
const RESUBSCRIBE_BASE: Duration = Duration::from_secs(1);
/// Upper bound for the resubscribe backoff
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(60);

/// Redis-backed shared store
pub struct RedisBackend {
    manager: ConnectionManager,
    /// Kept for dedicated pub/sub connections; SUBSCRIBE cannot share the
    /// multiplexed command connection
    url: String,
    compare_and_delete: redis::Script,
}

impl RedisBackend {
    /// Connect to Redis and verify the connection with a ping
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let client = redis::Client::open(url.as_str())?;
        let manager = ConnectionManager::new(client).await?;

        let backend = Self {
            manager,
            url,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        };
        backend.ping().await?;

        info!("connected to redis shared store");
        Ok(backend)
    }

    /// Connection manager handles are cheap clones over one multiplexed link
    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn open_pubsub(url: &str, channel: &str) -> Result<redis::aio::PubSub> {
        let client = redis::Client::open(url)?;
        let mut pubsub =
            client
                .get_async_pubsub()
                .await
                .map_err(|e| Error::Subscribe {
                    channel: channel.to_string(),
                    reason: e.to_string(),
                })?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| Error::Subscribe {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        Ok(pubsub)
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn();
        let data: Option<Vec<u8>> = conn.get(key).await?;
        Ok(data.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: usize,
    ) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn();
        let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(page_size)
            .query_async(&mut conn)
            .await?;
        Ok((next, page))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn();
        // PTTL: -2 missing key, -1 no deadline
        let ms: i64 = conn.pttl(key).await?;
        if ms < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(ms as u64)))
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let url = self.url.clone();
        let channel = channel.to_string();

        // Fail fast if the first subscription cannot be established
        let mut pubsub = Self::open_pubsub(&url, &channel).await?;

        tokio::spawn(async move {
            let mut backoff = RESUBSCRIBE_BASE;
            loop {
                {
                    let mut stream = pubsub.on_message();
                    loop {
                        // a dropped receiver must end the feed even when the
                        // channel is quiet, or this task and its connection leak
                        let msg = tokio::select! {
                            maybe = stream.next() => match maybe {
                                Some(msg) => msg,
                                None => break,
                            },
                            _ = tx.closed() => {
                                debug!(channel = %channel, "subscriber dropped, stopping feed");
                                return;
                            }
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, channel = %channel, "unreadable pub/sub payload");
                                continue;
                            }
                        };
                        backoff = RESUBSCRIBE_BASE;
                        if tx.send(payload).await.is_err() {
                            debug!(channel = %channel, "subscriber dropped, stopping feed");
                            return;
                        }
                    }
                }

                // Stream ended; reopen while anyone is still listening
                loop {
                    if tx.is_closed() {
                        return;
                    }
                    warn!(
                        channel = %channel,
                        backoff_secs = backoff.as_secs(),
                        "pub/sub stream ended, resubscribing"
                    );
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = tx.closed() => return,
                    }
                    backoff = (backoff * 2).min(RESUBSCRIBE_MAX);
                    match Self::open_pubsub(&url, &channel).await {
                        Ok(fresh) => {
                            pubsub = fresh;
                            break;
                        }
                        Err(e) => warn!(error = %e, channel = %channel, "resubscribe failed"),
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
