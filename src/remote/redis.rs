//! Redis-backed remote tier.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisError, Value};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{RemoteError, RemoteTier};

/// Keys requested per SCAN step while clearing a prefix.
const SCAN_COUNT: usize = 500;

/// Remote tier over a Redis server.
///
/// The connection manager multiplexes every call over one connection and
/// reconnects on its own; cloning is cheap.
#[derive(Clone)]
pub struct RedisRemoteTier {
    conn: ConnectionManager,
}

impl RedisRemoteTier {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, RemoteError> {
        let client = Client::open(url).map_err(transport)?;
        let conn = client.get_connection_manager().await.map_err(transport)?;
        info!("Connected to Redis remote tier");
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn transport(err: RedisError) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Transport(format!("timed out: {err}"))
    } else {
        RemoteError::Transport(err.to_string())
    }
}

/// Longest `PX` accepted; Redis rejects deadlines past a signed 64-bit
/// millisecond clock.
const MAX_TTL_MILLIS: u64 = i64::MAX as u64 / 2;

/// Millisecond TTL for `PX`; Redis rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_TTL_MILLIS)
}

/// Escape glob metacharacters so a prefix matches literally in SCAN.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl RemoteTier for RedisRemoteTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(transport)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RemoteError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        conn.mget(keys).await.map_err(transport)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), RemoteError> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn put_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Duration,
    ) -> Result<(), RemoteError> {
        if entries.is_empty() {
            return Ok(());
        }

        let millis = ttl_millis(ttl);
        let mut pipe = ::redis::pipe();
        for (key, value) in &entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value.as_slice())
                .arg("PX")
                .arg(millis)
                .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(transport)?;
        debug!(count = entries.len(), "Pipelined remote writes");
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, RemoteError> {
        let mut conn = self.conn.clone();
        let reply: Value = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(transport)?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, RemoteError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.del(keys).await.map_err(transport)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;

            if !keys.is_empty() {
                let count: u64 = conn.del(&keys).await.map_err(transport)?;
                removed += count;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed, "Cleared remote prefix");
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisRemoteTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRemoteTier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
        assert_eq!(ttl_millis(Duration::MAX), MAX_TTL_MILLIS);
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("cache:orders:"), "cache:orders:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }
}
