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
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use tracing::debug;

use crate::{
    canonical::to_canonical_string,
    connection::RedisHandle,
    error::{DecodeSnafu, DuplicateScheduledSnafu, EncodeSnafu, QueueSnafu, Result},
    keys::Keys,
};

/// A matured entry popped from the delayed index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedItem {
    pub queue:    String,
    pub job_name: String,
    pub args:     Value,
}

/// Durable work-queue abstraction: ready lists plus one delayed index.
///
/// Items are identified by value: the canonical encoding of
/// `(queue, job_name, args)` is the list/set member, so `delete` needs only
/// the same triple. At-least-once delivery; consumers de-duplicate on their
/// own keys.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append an item to the tail of `queue`.
    async fn enqueue(&self, queue: &str, job_name: &str, args: &Value) -> Result<()>;

    /// Insert an item into the delayed index, firing at `ts_ms` (epoch
    /// milliseconds). Fails with `DuplicateScheduled` when the same triple is
    /// already scheduled; callers treat that as success.
    async fn enqueue_at(&self, ts_ms: i64, queue: &str, job_name: &str, args: &Value)
    -> Result<()>;

    /// Remove matching items from the ready queue; returns the count removed.
    async fn delete(&self, queue: &str, job_name: &str, args: &Value) -> Result<usize>;

    /// Remove a matching item from the delayed index; returns the count
    /// removed (0 or 1).
    async fn delete_delayed(&self, queue: &str, job_name: &str, args: &Value) -> Result<usize>;

    /// Atomically pop up to `limit` items of `queue` whose firing time is
    /// ≤ `now_ms`.
    ///
    /// Only the master scheduler calls this. The limit bounds the scan, not
    /// the match count; a short batch is made up on the next tick.
    async fn pop_due(&self, now_ms: i64, queue: &str, limit: usize) -> Result<Vec<DelayedItem>>;

    /// Number of items currently in the ready queue.
    async fn length(&self, queue: &str) -> Result<usize>;

    /// Whether the underlying connection has been established.
    fn connected(&self) -> bool;
}

/// Ready-list payload: `{"args":[...],"class":"<jobName>"}`.
#[derive(Serialize)]
struct ReadyPayload<'a> {
    args:  [&'a Value; 1],
    class: &'a str,
}

/// Delayed-index member additionally records the destination queue.
#[derive(Serialize)]
struct DelayedPayload<'a> {
    args:  [&'a Value; 1],
    class: &'a str,
    queue: &'a str,
}

#[derive(Deserialize)]
struct DelayedPayloadOwned {
    args:  Vec<Value>,
    class: String,
    queue: String,
}

pub(crate) fn ready_member(job_name: &str, args: &Value) -> Result<String> {
    let value = serde_json::to_value(ReadyPayload {
        args: [args],
        class: job_name,
    })
    .context(EncodeSnafu)?;
    Ok(to_canonical_string(&value))
}

pub(crate) fn delayed_member(queue: &str, job_name: &str, args: &Value) -> Result<String> {
    let value = serde_json::to_value(DelayedPayload {
        args: [args],
        class: job_name,
        queue,
    })
    .context(EncodeSnafu)?;
    Ok(to_canonical_string(&value))
}

pub(crate) fn parse_delayed_member(member: &str) -> Result<DelayedItem> {
    let payload: DelayedPayloadOwned = serde_json::from_str(member).context(DecodeSnafu {
        payload: member.to_string(),
    })?;
    Ok(DelayedItem {
        queue:    payload.queue,
        job_name: payload.class,
        args:     payload.args.into_iter().next().unwrap_or(Value::Null),
    })
}

/// [`WorkQueue`] over a shared Redis connection.
///
/// Ready queues are lists (`RPUSH`/`LREM`); the delayed index is one sorted
/// set scored by firing time. `ZADD NX` doubles as the de-duplication check.
#[derive(Debug, Clone)]
pub struct RedisQueue {
    handle: RedisHandle,
    keys:   Keys,
}

/// Pop script: collect matured members of one queue, remove them, return
/// them. Runs atomically so two masters racing a failover cannot double-fire
/// a job. The queue filter is a literal substring match against the
/// canonical member encoding.
const POP_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local popped = {}
for _, member in ipairs(due) do
    if string.find(member, ARGV[3], 1, true) then
        redis.call('ZREM', KEYS[1], member)
        table.insert(popped, member)
    end
end
return popped
"#;

impl RedisQueue {
    #[must_use]
    pub fn new(handle: RedisHandle, keys: Keys) -> Self { RedisQueue { handle, keys } }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn enqueue(&self, queue: &str, job_name: &str, args: &Value) -> Result<()> {
        let key = self.keys.queue(queue);
        let member = ready_member(job_name, args)?;
        debug!(queue = %key, job = job_name, "RPUSH");
        let mut conn = self.handle.conn().await?;
        conn.rpush::<_, _, i64>(key, member)
            .await
            .context(QueueSnafu { op: "RPUSH" })?;
        Ok(())
    }

    async fn enqueue_at(
        &self,
        ts_ms: i64,
        queue: &str,
        job_name: &str,
        args: &Value,
    ) -> Result<()> {
        let key = self.keys.delayed();
        let member = delayed_member(queue, job_name, args)?;
        debug!(queue, job = job_name, ts_ms, "ZADD NX");
        let mut conn = self.handle.conn().await?;
        let added: i64 = redis::cmd("ZADD")
            .arg(&key)
            .arg("NX")
            .arg(ts_ms)
            .arg(&member)
            .query_async(&mut conn)
            .await
            .context(QueueSnafu { op: "ZADD" })?;
        if added == 0 {
            return DuplicateScheduledSnafu { queue }.fail();
        }
        Ok(())
    }

    async fn delete(&self, queue: &str, job_name: &str, args: &Value) -> Result<usize> {
        let key = self.keys.queue(queue);
        let member = ready_member(job_name, args)?;
        debug!(queue = %key, job = job_name, "LREM");
        let mut conn = self.handle.conn().await?;
        let removed: i64 = conn
            .lrem(key, 0, member)
            .await
            .context(QueueSnafu { op: "LREM" })?;
        Ok(usize::try_from(removed).unwrap_or(0))
    }

    async fn delete_delayed(&self, queue: &str, job_name: &str, args: &Value) -> Result<usize> {
        let key = self.keys.delayed();
        let member = delayed_member(queue, job_name, args)?;
        debug!(queue, job = job_name, "ZREM");
        let mut conn = self.handle.conn().await?;
        let removed: i64 = conn
            .zrem(key, member)
            .await
            .context(QueueSnafu { op: "ZREM" })?;
        Ok(usize::try_from(removed).unwrap_or(0))
    }

    async fn pop_due(&self, now_ms: i64, queue: &str, limit: usize) -> Result<Vec<DelayedItem>> {
        let key = self.keys.delayed();
        let filter = format!("\"queue\":\"{queue}\"");
        let mut conn = self.handle.conn().await?;
        let members: Vec<String> = redis::Script::new(POP_DUE_SCRIPT)
            .key(key)
            .arg(now_ms)
            .arg(limit)
            .arg(filter)
            .invoke_async(&mut conn)
            .await
            .context(QueueSnafu { op: "POP_DUE" })?;
        members.iter().map(|m| parse_delayed_member(m)).collect()
    }

    async fn length(&self, queue: &str) -> Result<usize> {
        let key = self.keys.queue(queue);
        let mut conn = self.handle.conn().await?;
        let len: i64 = conn.llen(key).await.context(QueueSnafu { op: "LLEN" })?;
        Ok(usize::try_from(len).unwrap_or(0))
    }

    fn connected(&self) -> bool { self.handle.connected() }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ready_member_is_canonical() {
        let a = ready_member("start", &json!({"jobId": 777, "buildId": 8609})).unwrap();
        let b = ready_member("start", &json!({"buildId": 8609, "jobId": 777})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, r#"{"args":[{"buildId":8609,"jobId":777}],"class":"start"}"#);
    }

    #[test]
    fn delayed_member_roundtrips() {
        let member = delayed_member("periodicBuilds", "startDelayed", &json!({"jobId": 1234}))
            .unwrap();
        let item = parse_delayed_member(&member).unwrap();
        assert_eq!(item.queue, "periodicBuilds");
        assert_eq!(item.job_name, "startDelayed");
        assert_eq!(item.args, json!({"jobId": 1234}));
    }
}
