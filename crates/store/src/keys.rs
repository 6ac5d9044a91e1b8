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

//! Redis key layout.
//!
//! Every key the broker touches is optionally namespaced by a configured
//! prefix so multiple deployments can share one Redis instance.

/// Key builder carrying the configured prefix.
#[derive(Debug, Clone, Default)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Keys {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str { &self.prefix }

    /// Ready queue list: `{prefix}queue:{name}`.
    #[must_use]
    pub fn queue(&self, name: &str) -> String { format!("{}queue:{name}", self.prefix) }

    /// Delayed index sorted set: `{prefix}delayed`.
    #[must_use]
    pub fn delayed(&self) -> String { format!("{}delayed", self.prefix) }

    /// Hash table: `{prefix}{table}`.
    #[must_use]
    pub fn hash(&self, table: &str) -> String { format!("{}{table}", self.prefix) }

    /// Plain string key: `{prefix}{key}`.
    #[must_use]
    pub fn plain(&self, key: &str) -> String { format!("{}{key}", self.prefix) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_prefix() {
        let keys = Keys::new("sd_");
        assert_eq!(keys.queue("builds"), "sd_queue:builds");
        assert_eq!(keys.delayed(), "sd_delayed");
        assert_eq!(keys.hash("buildConfigs"), "sd_buildConfigs");
        assert_eq!(keys.plain("deleted_777_8609"), "sd_deleted_777_8609");
    }

    #[test]
    fn empty_prefix_is_identity() {
        let keys = Keys::default();
        assert_eq!(keys.queue("builds"), "queue:builds");
        assert_eq!(keys.hash("timeoutConfigs"), "timeoutConfigs");
    }
}
