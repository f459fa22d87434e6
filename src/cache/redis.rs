//! Redis-backed distributed store
//!
//! Provides the L2 tier for multi-process deployments.
//!
//! ## Features
//! - Native TTL via `SET .. PX`, read back with `PTTL` alongside `GET`
//! - Namespace isolation via key prefixing
//! - Cursor-based `SCAN` for prefix enumeration (never `KEYS`)
//! - One auto-reconnecting multiplexed handle shared by every caller

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::timeout;
use tracing::{info, warn};

use super::l2::{DistributedStore, L2Config};
use crate::error::{Error, Result};

/// Keys requested per SCAN round trip
const SCAN_BATCH: usize = 200;

/// Redis implementation of [`DistributedStore`]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connect and verify the server answers PING
    pub async fn connect(config: &L2Config) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Connecting to Redis L2 tier"
        );

        let client = Client::open(config.connection_url())
            .map_err(|e| Error::Config(format!("invalid redis url: {}", e)))?;

        let conn = timeout(config.timeout(), ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("connect to redis at {}:{}", config.host, config.port),
                millis: config.connect_timeout_ms,
            })??;

        let store = Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.timeout(),
            closed: AtomicBool::new(false),
        };
        store.ping().await?;

        info!("Redis connection established");
        Ok(store)
    }

    #[inline]
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Handle for one command; the manager multiplexes clones over one socket
    fn connection(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::l2_unavailable("redis store closed"));
        }
        Ok(self.conn.clone())
    }

    async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("Redis {} failed: {}", operation, e);
                Err(e.into())
            }
            Err(_) => Err(Error::Timeout {
                operation: format!("redis {}", operation),
                millis: self.command_timeout.as_millis() as u64,
            }),
        }
    }
}

/// Escape glob metacharacters so a prefix is matched literally by SCAN MATCH
fn escape_glob(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Interpret a PTTL reply: -1 means no expiry, -2 a key that just expired
fn remaining_ttl(pttl: i64) -> Option<Duration> {
    match pttl {
        -1 => None,
        ms => Some(Duration::from_millis(ms.max(0) as u64)),
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection()?;
        let full_key = self.full_key(key);
        let value: Option<Vec<u8>> = self
            .run("GET", redis::cmd("GET").arg(&full_key).query_async(&mut conn))
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        let mut conn = self.connection()?;
        let full_key = self.full_key(key);
        let (value, pttl): (Option<Vec<u8>>, i64) = self
            .run(
                "GET",
                redis::pipe()
                    .atomic()
                    .cmd("GET")
                    .arg(&full_key)
                    .cmd("PTTL")
                    .arg(&full_key)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(value.map(|value| (Bytes::from(value), remaining_ttl(pttl))))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.connection()?;
        let full_key = self.full_key(key);
        // PX rejects 0
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let _: () = self
            .run(
                "SET",
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(value.as_ref())
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let full_key = self.full_key(key);
        let removed: u64 = self
            .run("DEL", redis::cmd("DEL").arg(&full_key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection()?;
        let pattern = format!("{}*", escape_glob(&self.full_key(prefix)));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;

            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&self.key_prefix).map(str::to_string)),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let pong: String = self
            .run("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::l2_unavailable(format!(
                "unexpected PING reply: {}",
                pong
            )))
        }
    }

    async fn close(&self) -> Result<()> {
        // The manager drops its socket once the last clone is gone
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}
