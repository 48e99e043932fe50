//! Distributed counter store backed by Redis.
//!
//! Window counters are advanced with a Lua script so that the increment and
//! the expiry of a fresh window happen in one atomic round-trip.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, trace};

use super::{StoreBackend, WindowHit};
use crate::error::{Result, TollgateError};

/// Increment a window counter, starting its expiry on the first hit.
///
/// Returns `{count, pttl}`. A key that somehow lost its TTL gets one again,
/// otherwise it would never reset.
const INCREMENT_WINDOW: &str = r#"
local current = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if current == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

/// Keys fetched per SCAN step and deleted per DEL call.
const SCAN_BATCH: usize = 500;

/// Counter store shared by every instance through Redis.
///
/// The connection manager re-establishes a dropped connection in the
/// background; operations issued while it is down fail individually.
pub struct RedisStore {
    conn: ConnectionManager,
    increment_window: Script,
    probe_timeout: Duration,
}

impl RedisStore {
    /// Connect to `url`, giving up after `timeout`. The same timeout bounds
    /// every liveness probe.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                TollgateError::Store(format!(
                    "timed out after {}ms connecting to {}",
                    timeout.as_millis(),
                    url
                ))
            })??;

        debug!(url = %url, "Opened distributed store connection");

        Ok(Self {
            conn,
            increment_window: Script::new(INCREMENT_WINDOW),
            probe_timeout: timeout,
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn millis(duration: Duration) -> u64 {
    // Redis rejects a zero expiry
    (duration.as_millis() as u64).max(1)
}

fn ttl_from_pttl(pttl: i64) -> Option<Duration> {
    (pttl > 0).then(|| Duration::from_millis(pttl as u64))
}

#[async_trait]
impl StoreBackend for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowHit> {
        let mut conn = self.connection();
        let (count, pttl): (i64, i64) = self
            .increment_window
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, count = count, pttl = pttl, "Incremented distributed counter");

        Ok(WindowHit {
            count: count.max(0) as u64,
            remaining: ttl_from_pttl(pttl).unwrap_or(window),
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<WindowHit>> {
        let mut conn = self.connection();
        let (value, pttl): (Option<i64>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await?;

        Ok(value.map(|count| WindowHit {
            count: count.max(0) as u64,
            remaining: ttl_from_pttl(pttl).unwrap_or(Duration::ZERO),
        }))
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn.pset_ex(key, 1, millis(duration)).await?;
        Ok(())
    }

    async fn block_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection();
        let pttl: i64 = conn.pttl(key).await?;
        Ok(ttl_from_pttl(pttl))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection();
        match ttl {
            Some(ttl) => {
                let _: () = conn.pset_ex(key, value, millis(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connection();
        let mut cursor: u64 = 0;
        let mut matched: Vec<String> = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            matched.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once
        matched.sort_unstable();
        matched.dedup();

        let mut removed = 0u64;
        for chunk in matched.chunks(SCAN_BATCH) {
            let n: u64 = conn.del(chunk).await?;
            removed += n;
        }

        debug!(pattern = %pattern, removed = removed, "Deleted keys by pattern");
        Ok(removed)
    }

    async fn increment_by(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.connection();
        let value: i64 = conn.incr(key, by).await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn healthy(&self) -> bool {
        let mut conn = self.connection();
        let probe = async move {
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            pong
        };
        match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(pong)) => pong == "PONG",
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    //! Connection handling runs against an in-process RESP stub. Tests marked
    //! `#[ignore]` need a reachable Redis; run them with
    //! `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};

    async fn store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        RedisStore::connect(&url, Duration::from_secs(2)).await.unwrap()
    }

    fn unique(prefix: &str) -> String {
        format!("tollgate-test:{}:{}", prefix, rand::random::<u64>())
    }

    #[test]
    fn test_ttl_from_pttl() {
        assert_eq!(ttl_from_pttl(-2), None);
        assert_eq!(ttl_from_pttl(-1), None);
        assert_eq!(ttl_from_pttl(1500), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[tokio::test]
    #[ignore]
    async fn test_increment_sets_expiry_once() {
        let store = store().await;
        let key = unique("incr");

        let first = store.increment(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.count, 1);
        assert!(first.remaining <= Duration::from_secs(60));

        let second = store.increment(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(second.count, 2);
        assert!(second.remaining <= first.remaining);

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_block_and_pattern_delete() {
        let store = store().await;
        let prefix = unique("pattern");

        store.block(&format!("{}:block:a", prefix), Duration::from_secs(30)).await.unwrap();
        store.set(&format!("{}:x", prefix), "1", None).await.unwrap();
        assert!(store.is_blocked(&format!("{}:block:a", prefix)).await.unwrap());

        let removed = store.delete_pattern(&format!("{}:*", prefix)).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!store.is_blocked(&format!("{}:block:a", prefix)).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_healthy() {
        assert!(store().await.healthy().await);
    }

    /// Minimal RESP server for connection handling tests. Replies `+PONG` to
    /// PING and `+OK` to anything else. When `drop_first_after` is set, the
    /// first connection is closed after answering that many PINGs; when
    /// `answer_ping` is false, PINGs are read and never answered.
    /// Returns the URL and a count of accepted connections.
    async fn fake_redis(
        drop_first_after: Option<usize>,
        answer_ping: bool,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                let limit = if first { drop_first_after } else { None };
                tokio::spawn(serve_resp(socket, limit, answer_ping));
            }
        });

        (format!("redis://{}/", addr), accepted)
    }

    async fn serve_resp(socket: TcpStream, ping_limit: Option<usize>, answer_ping: bool) {
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read);
        let mut pings = 0;

        while let Some(command) = read_command(&mut lines).await {
            if command.eq_ignore_ascii_case("PING") {
                if !answer_ping {
                    continue;
                }
                if write.write_all(b"+PONG\r\n").await.is_err() {
                    return;
                }
                pings += 1;
                if ping_limit.is_some_and(|limit| pings >= limit) {
                    // dropping both halves closes the connection
                    return;
                }
            } else if write.write_all(b"+OK\r\n").await.is_err() {
                return;
            }
        }
    }

    /// Read one RESP array command and return its name.
    async fn read_command(lines: &mut BufReader<OwnedReadHalf>) -> Option<String> {
        let mut line = String::new();
        if lines.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let args: usize = line.trim().strip_prefix('*')?.parse().ok()?;

        let mut name = None;
        for _ in 0..args {
            line.clear();
            lines.read_line(&mut line).await.ok()?; // $len
            line.clear();
            lines.read_line(&mut line).await.ok()?;
            name.get_or_insert_with(|| line.trim().to_string());
        }
        name
    }

    #[tokio::test]
    async fn test_recovers_after_dropped_connection() {
        let (url, accepted) = fake_redis(Some(1), true).await;
        let store = RedisStore::connect(&url, Duration::from_secs(2)).await.unwrap();

        assert!(store.healthy().await);

        let mut recovered = false;
        for _ in 0..20 {
            if store.healthy().await {
                recovered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(recovered, "store did not reconnect after the connection dropped");
        assert!(accepted.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_probe_uses_connect_timeout() {
        let (url, _) = fake_redis(None, false).await;
        let store = RedisStore::connect(&url, Duration::from_millis(200)).await.unwrap();

        let started = std::time::Instant::now();
        assert!(!store.healthy().await);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_millis(900), "probe waited {:?}", waited);
    }
}
