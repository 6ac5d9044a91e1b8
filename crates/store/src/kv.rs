// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use redis::AsyncCommands;
use snafu::ResultExt;
use tracing::debug;

use crate::{
    connection::RedisHandle,
    error::{Result, StoreSnafu},
    keys::Keys,
};

/// Typed view over the hash tables and TTL'd string keys the broker owns.
///
/// Values are serialized JSON strings; the caller owns the schema. All keys
/// are namespaced by the configured prefix.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `field` in hash `table`.
    async fn hset(&self, table: &str, field: &str, value: &str) -> Result<()>;

    /// Read `field` from hash `table`.
    async fn hget(&self, table: &str, field: &str) -> Result<Option<String>>;

    /// Delete `field` from hash `table`; returns whether a field was removed.
    async fn hdel(&self, table: &str, field: &str) -> Result<bool>;

    /// All `(field, value)` pairs of hash `table`.
    async fn hgetall(&self, table: &str) -> Result<Vec<(String, String)>>;

    /// Set a plain string key.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Read a plain string key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a plain string key; returns whether a key was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Apply a TTL in seconds to an existing key.
    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()>;

    /// Atomically claim `key` with a millisecond TTL; returns whether the
    /// claim succeeded (SET NX PX semantics, used for the scheduler lease).
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    /// Whether the underlying connection has been established.
    fn connected(&self) -> bool;
}

/// [`KvStore`] over a shared Redis connection.
#[derive(Debug, Clone)]
pub struct RedisKv {
    handle: RedisHandle,
    keys:   Keys,
}

impl RedisKv {
    #[must_use]
    pub fn new(handle: RedisHandle, keys: Keys) -> Self { RedisKv { handle, keys } }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn hset(&self, table: &str, field: &str, value: &str) -> Result<()> {
        let key = self.keys.hash(table);
        debug!(table = %key, field, "HSET");
        let mut conn = self.handle.conn().await?;
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .context(StoreSnafu { op: "HSET" })?;
        Ok(())
    }

    async fn hget(&self, table: &str, field: &str) -> Result<Option<String>> {
        let key = self.keys.hash(table);
        debug!(table = %key, field, "HGET");
        let mut conn = self.handle.conn().await?;
        conn.hget::<_, _, Option<String>>(key, field)
            .await
            .context(StoreSnafu { op: "HGET" })
    }

    async fn hdel(&self, table: &str, field: &str) -> Result<bool> {
        let key = self.keys.hash(table);
        debug!(table = %key, field, "HDEL");
        let mut conn = self.handle.conn().await?;
        let removed: i64 = conn
            .hdel(key, field)
            .await
            .context(StoreSnafu { op: "HDEL" })?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, table: &str) -> Result<Vec<(String, String)>> {
        let key = self.keys.hash(table);
        let mut conn = self.handle.conn().await?;
        conn.hgetall::<_, Vec<(String, String)>>(key)
            .await
            .context(StoreSnafu { op: "HGETALL" })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = self.keys.plain(key);
        debug!(key = %key, "SET");
        let mut conn = self.handle.conn().await?;
        conn.set::<_, _, ()>(key, value)
            .await
            .context(StoreSnafu { op: "SET" })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.keys.plain(key);
        let mut conn = self.handle.conn().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .context(StoreSnafu { op: "GET" })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let key = self.keys.plain(key);
        debug!(key = %key, "DEL");
        let mut conn = self.handle.conn().await?;
        let removed: i64 = conn.del(key).await.context(StoreSnafu { op: "DEL" })?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        let key = self.keys.plain(key);
        debug!(key = %key, ttl_secs, "EXPIRE");
        let mut conn = self.handle.conn().await?;
        conn.expire::<_, i64>(key, ttl_secs)
            .await
            .context(StoreSnafu { op: "EXPIRE" })?;
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let key = self.keys.plain(key);
        let mut conn = self.handle.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .context(StoreSnafu { op: "SET NX PX" })?;
        Ok(reply.is_some())
    }

    fn connected(&self) -> bool { self.handle.connected() }
}
