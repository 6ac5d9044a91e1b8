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

use std::{fmt, sync::Arc};

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ResultExt;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::{ConnectSnafu, Result};

/// Connection parameters for the shared Redis instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct RedisConnectionConfig {
    #[default = "127.0.0.1"]
    #[builder(default = "127.0.0.1".to_string())]
    pub host:     String,
    #[default = 6379]
    #[builder(default = 6379)]
    pub port:     u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Redis logical database index.
    #[default = 0]
    #[builder(default)]
    pub database: i64,
    #[default = false]
    #[builder(default)]
    pub tls:      bool,
}

impl RedisConnectionConfig {
    fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let auth = self
            .password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        format!(
            "{scheme}://{auth}{}:{}/{}",
            self.host, self.port, self.database
        )
    }
}

/// Lazily-connected handle shared by the KV and queue clients.
///
/// The first command establishes the [`ConnectionManager`]; afterwards
/// `connected()` reports true and subsequent calls reuse the manager, which
/// reconnects internally on connection loss.
#[derive(Clone)]
pub struct RedisHandle {
    config:  RedisConnectionConfig,
    manager: Arc<OnceCell<ConnectionManager>>,
}

impl fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisHandle")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.connected())
            .finish()
    }
}

impl RedisHandle {
    #[must_use]
    pub fn new(config: RedisConnectionConfig) -> Self {
        RedisHandle {
            config,
            manager: Arc::new(OnceCell::new()),
        }
    }

    /// Whether a connection has already been established.
    #[must_use]
    pub fn connected(&self) -> bool { self.manager.initialized() }

    /// Establish the connection if absent, then return a cloned manager.
    pub async fn conn(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                info!(
                    host = %self.config.host,
                    port = self.config.port,
                    "Connecting to Redis"
                );
                let client = redis::Client::open(self.config.url()).context(ConnectSnafu {
                    host: self.config.host.clone(),
                    port: self.config.port,
                })?;
                let manager = ConnectionManager::new(client).await.context(ConnectSnafu {
                    host: self.config.host.clone(),
                    port: self.config.port,
                })?;
                info!("Connected to Redis");
                Ok(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_password_and_database() {
        let config = RedisConnectionConfig::builder()
            .host("redis.example.com".to_string())
            .port(6380)
            .password("s3cret".to_string())
            .database(2)
            .build();
        assert_eq!(config.url(), "redis://:s3cret@redis.example.com:6380/2");
    }

    #[test]
    fn url_uses_tls_scheme() {
        let config = RedisConnectionConfig {
            tls: true,
            ..Default::default()
        };
        assert_eq!(config.url(), "rediss://127.0.0.1:6379/0");
    }

    #[test]
    fn handle_starts_disconnected() {
        let handle = RedisHandle::new(RedisConnectionConfig::default());
        assert!(!handle.connected());
    }
}
