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

//! Control-plane API client.
//!
//! Two endpoints, both retried with a fixed delay:
//! - `POST {apiUri}/v4/events` — create a build event; 201 is success and
//!   404 means "no job to start", which is terminal success too.
//! - `PUT {apiUri}/v4/builds/{buildId}` — update build status; 200 only.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    error::{ApiSnafu, Result},
    types::BuildStatus,
};

/// Fixed identity attached to every event the broker creates.
pub const CREATOR_NAME: &str = "Screwdriver scheduler";
pub const CREATOR_USERNAME: &str = "sd:scheduler";

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Body of `POST /v4/events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub pipeline_id: u64,
    pub start_from:  String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<u64>,
}

impl EventRequest {
    fn body(&self) -> serde_json::Value {
        let mut body = serde_json::to_value(self).unwrap_or_default();
        body["creator"] = json!({
            "name": CREATOR_NAME,
            "username": CREATOR_USERNAME,
        });
        body
    }
}

/// Outbound calls the broker makes against the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn post_event(&self, api_uri: &str, token: &str, event: &EventRequest) -> Result<()>;

    async fn update_build_status(
        &self,
        api_uri: &str,
        build_id: u64,
        token: &str,
        status: BuildStatus,
        message: &str,
    ) -> Result<()>;
}

/// Retrying reqwest-based [`ControlPlane`] implementation.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http:        reqwest::Client,
    retries:     u32,
    retry_delay: Duration,
}

impl Default for ApiClient {
    fn default() -> Self { ApiClient::new(DEFAULT_RETRIES, DEFAULT_RETRY_DELAY) }
}

impl ApiClient {
    #[must_use]
    pub fn new(retries: u32, retry_delay: Duration) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            retries,
            retry_delay,
        }
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn post_event(&self, api_uri: &str, token: &str, event: &EventRequest) -> Result<()> {
        let url = format!("{}/v4/events", api_uri.trim_end_matches('/'));
        let body = event.body();
        let mut last = String::new();

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self
                .http
                .post(&url)
                .bearer_auth(token)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status() == reqwest::StatusCode::CREATED => {
                    debug!(pipeline = event.pipeline_id, start_from = %event.start_from, "Event created");
                    return Ok(());
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    // No job to start; nothing to retry
                    debug!(pipeline = event.pipeline_id, "Event returned 404, treating as success");
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    warn!(%url, %status, attempt, "Event creation failed");
                    last = format!("{status}: {text}");
                }
                Err(e) => {
                    warn!(%url, error = %e, attempt, "Event request error");
                    last = e.to_string();
                }
            }
        }

        ApiSnafu {
            method: "POST",
            url,
            attempts: self.retries + 1,
            message: last,
        }
        .fail()
    }

    async fn update_build_status(
        &self,
        api_uri: &str,
        build_id: u64,
        token: &str,
        status: BuildStatus,
        message: &str,
    ) -> Result<()> {
        let url = format!("{}/v4/builds/{build_id}", api_uri.trim_end_matches('/'));
        let body = json!({
            "status": status,
            "statusMessage": message,
        });
        let mut last = String::new();

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self
                .http
                .put(&url)
                .bearer_auth(token)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    debug!(build_id, %status, "Build status updated");
                    return Ok(());
                }
                Ok(resp) => {
                    let code = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    warn!(%url, status = %code, attempt, "Build status update failed");
                    last = format!("{code}: {text}");
                }
                Err(e) => {
                    warn!(%url, error = %e, attempt, "Build status request error");
                    last = e.to_string();
                }
            }
        }

        ApiSnafu {
            method: "PUT",
            url,
            attempts: self.retries + 1,
            message: last,
        }
        .fail()
    }
}
