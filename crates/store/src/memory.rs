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

//! In-memory store implementations for tests.
//!
//! Behaviorally equivalent to the Redis clients (canonical-member equality,
//! `DuplicateScheduled` on double scheduling, TTL bookkeeping) without a
//! running Redis. Inspection helpers expose internals the assertions need.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::{DuplicateScheduledSnafu, Result},
    kv::KvStore,
    queue::{DelayedItem, WorkQueue, delayed_member, parse_delayed_member, ready_member},
};

/// In-memory [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryKv {
    hashes: Mutex<HashMap<String, BTreeMap<String, String>>>,
    plain:  Mutex<HashMap<String, String>>,
    ttls:   Mutex<HashMap<String, i64>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// TTL recorded for `key` by `expire` / `set_nx_px`, in seconds.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<i64> { self.ttls.lock().unwrap().get(key).copied() }

    /// Number of fields in hash `table`.
    #[must_use]
    pub fn hash_len(&self, table: &str) -> usize {
        self.hashes
            .lock()
            .unwrap()
            .get(table)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn hset(&self, table: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, table: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(table)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, table: &str, field: &str) -> Result<bool> {
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get_mut(table)
            .is_some_and(|h| h.remove(field).is_some()))
    }

    async fn hgetall(&self, table: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(table)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.plain
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.plain.lock().unwrap().get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.ttls.lock().unwrap().remove(key);
        Ok(self.plain.lock().unwrap().remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        self.ttls.lock().unwrap().insert(key.to_string(), ttl_secs);
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut plain = self.plain.lock().unwrap();
        if plain.contains_key(key) {
            return Ok(false);
        }
        plain.insert(key.to_string(), value.to_string());
        self.ttls
            .lock()
            .unwrap()
            .insert(key.to_string(), i64::try_from(ttl_ms / 1000).unwrap_or(0));
        Ok(true)
    }

    fn connected(&self) -> bool { true }
}

/// In-memory [`WorkQueue`].
#[derive(Debug, Default)]
pub struct MemoryQueue {
    ready:   Mutex<HashMap<String, Vec<String>>>,
    delayed: Mutex<BTreeMap<String, i64>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Number of members in the delayed index.
    #[must_use]
    pub fn delayed_len(&self) -> usize { self.delayed.lock().unwrap().len() }

    /// Snapshot of the delayed index as `(item, fire_at_ms)` pairs.
    #[must_use]
    pub fn delayed_entries(&self) -> Vec<(DelayedItem, i64)> {
        self.delayed
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(member, score)| {
                parse_delayed_member(member).ok().map(|item| (item, *score))
            })
            .collect()
    }

    /// Raw members of a ready queue, in order.
    #[must_use]
    pub fn ready_items(&self, queue: &str) -> Vec<String> {
        self.ready
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, job_name: &str, args: &Value) -> Result<()> {
        let member = ready_member(job_name, args)?;
        self.ready
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push(member);
        Ok(())
    }

    async fn enqueue_at(
        &self,
        ts_ms: i64,
        queue: &str,
        job_name: &str,
        args: &Value,
    ) -> Result<()> {
        let member = delayed_member(queue, job_name, args)?;
        let mut delayed = self.delayed.lock().unwrap();
        if delayed.contains_key(&member) {
            return DuplicateScheduledSnafu { queue }.fail();
        }
        delayed.insert(member, ts_ms);
        Ok(())
    }

    async fn delete(&self, queue: &str, job_name: &str, args: &Value) -> Result<usize> {
        let member = ready_member(job_name, args)?;
        let mut ready = self.ready.lock().unwrap();
        let Some(items) = ready.get_mut(queue) else {
            return Ok(0);
        };
        let before = items.len();
        items.retain(|m| m != &member);
        Ok(before - items.len())
    }

    async fn delete_delayed(&self, queue: &str, job_name: &str, args: &Value) -> Result<usize> {
        let member = delayed_member(queue, job_name, args)?;
        let removed = self.delayed.lock().unwrap().remove(&member).is_some();
        Ok(usize::from(removed))
    }

    async fn pop_due(&self, now_ms: i64, queue: &str, limit: usize) -> Result<Vec<DelayedItem>> {
        let filter = format!("\"queue\":\"{queue}\"");
        let mut delayed = self.delayed.lock().unwrap();
        let due: Vec<String> = delayed
            .iter()
            .filter(|(member, score)| **score <= now_ms && member.contains(&filter))
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect();
        let mut items = Vec::with_capacity(due.len());
        for member in due {
            delayed.remove(&member);
            items.push(parse_delayed_member(&member)?);
        }
        Ok(items)
    }

    async fn length(&self, queue: &str) -> Result<usize> {
        Ok(self.ready.lock().unwrap().get(queue).map_or(0, Vec::len))
    }

    fn connected(&self) -> bool { true }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn double_schedule_is_duplicate() {
        let queue = MemoryQueue::new();
        let args = json!({"jobId": 1234});
        queue
            .enqueue_at(1000, "periodicBuilds", "startDelayed", &args)
            .await
            .unwrap();
        let err = queue
            .enqueue_at(1000, "periodicBuilds", "startDelayed", &args)
            .await
            .unwrap_err();
        assert!(err.is_duplicate_scheduled());
        assert_eq!(queue.delayed_len(), 1);
    }

    #[tokio::test]
    async fn pop_due_returns_matured_only() {
        let queue = MemoryQueue::new();
        queue
            .enqueue_at(1000, "periodicBuilds", "startDelayed", &json!({"jobId": 1}))
            .await
            .unwrap();
        queue
            .enqueue_at(5000, "frozenBuilds", "startFrozen", &json!({"jobId": 2}))
            .await
            .unwrap();

        let due = queue.pop_due(2000, "periodicBuilds", 16).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job_name, "startDelayed");
        assert_eq!(queue.delayed_len(), 1);

        // Matured but belonging to the other queue: untouched
        let none = queue.pop_due(10_000, "periodicBuilds", 16).await.unwrap();
        assert!(none.is_empty());
        let frozen = queue.pop_due(10_000, "frozenBuilds", 16).await.unwrap();
        assert_eq!(frozen.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_all_matching() {
        let queue = MemoryQueue::new();
        let args = json!({"buildId": 8609, "jobId": 777});
        queue.enqueue("builds", "start", &args).await.unwrap();
        queue.enqueue("builds", "start", &args).await.unwrap();
        assert_eq!(queue.delete("builds", "start", &args).await.unwrap(), 2);
        assert_eq!(queue.length("builds").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn kv_set_nx_px_claims_once() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_px("lease", "me", 3000).await.unwrap());
        assert!(!kv.set_nx_px("lease", "you", 3000).await.unwrap());
        assert_eq!(kv.ttl("lease"), Some(3));

        // Deleting the key frees it for the next claimant
        assert!(kv.del("lease").await.unwrap());
        assert!(!kv.del("lease").await.unwrap());
        assert!(kv.set_nx_px("lease", "you", 3000).await.unwrap());
    }
}
