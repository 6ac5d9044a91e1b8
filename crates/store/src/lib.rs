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

//! Redis-backed storage layer for the sdq broker.
//!
//! Two client abstractions share one lazily-established connection:
//! - [`KvStore`]: hash tables and TTL'd string keys
//! - [`WorkQueue`]: ready queues (lists) plus a delayed index (sorted set)
//!
//! Queue items are compared by their canonical JSON encoding (sorted keys),
//! so deleting an item requires only reproducing its arguments. A generic
//! retrying [`CircuitBreaker`] wraps every outbound call the broker makes.

mod breaker;
mod canonical;
mod connection;
mod error;
mod keys;
mod kv;
mod queue;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use breaker::{BreakerConfig, BreakerError, BreakerStats, CircuitBreaker};
pub use canonical::to_canonical_string;
pub use connection::{RedisConnectionConfig, RedisHandle};
pub use error::{Error, Result};
pub use keys::Keys;
pub use kv::{KvStore, RedisKv};
pub use queue::{DelayedItem, RedisQueue, WorkQueue};
