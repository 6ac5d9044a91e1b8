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
use sdq_store::RedisConnectionConfig;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::error::{ConfigSnafu, Result};

/// Retry shape of the circuit breakers wrapping the store and queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct BreakerOptions {
    #[default = 3]
    #[builder(default = 3)]
    pub retries:           u32,
    /// Seconds between retries.
    #[default = 5]
    #[builder(default = 5)]
    pub retry_delay_secs:  u64,
    /// Per-attempt timeout, seconds.
    #[default = 10]
    #[builder(default = 10)]
    pub timeout_secs:      u64,
    /// Consecutive failed runs before the circuit opens.
    #[default = 5]
    #[builder(default = 5)]
    pub failure_threshold: u32,
    /// Seconds an open circuit rejects calls before a half-open probe.
    #[default = 60]
    #[builder(default = 60)]
    pub cooldown_secs:     u64,
}

impl BreakerOptions {
    #[must_use]
    pub fn to_breaker_config(&self) -> sdq_store::BreakerConfig {
        sdq_store::BreakerConfig::builder()
            .retries(self.retries)
            .retry_delay(std::time::Duration::from_secs(self.retry_delay_secs))
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .failure_threshold(self.failure_threshold)
            .cooldown(std::time::Duration::from_secs(self.cooldown_secs))
            .build()
    }
}

/// Broker construction options.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct BrokerConfig {
    /// Shared Redis instance. Required; an empty host is a construction
    /// error.
    #[builder(default)]
    pub redis: RedisConnectionConfig,

    /// Optional namespace prepended to every key.
    #[default = ""]
    #[builder(default)]
    pub prefix: String,

    #[builder(default)]
    pub breaker: BreakerOptions,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.redis.host.is_empty(),
            ConfigSnafu {
                message: "redis.host must not be empty"
            }
        );
        Ok(())
    }
}

/// First admin of a pipeline, whose identity signs scheduler-created events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineAdmin {
    pub username: String,
}

/// Required collaborator resolving pipeline admins.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn first_admin(&self, pipeline_id: u64) -> Result<PipelineAdmin>;
}

/// Signs API tokens for a given username.
///
/// Captured once, on the first `start_periodic` call that supplies one;
/// later attempts to swap it are ignored.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self, username: &str) -> Result<String>;
}
