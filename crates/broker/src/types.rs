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

//! Command payloads and stored records.
//!
//! The control plane sends loosely-shaped JSON; the typed records below pin
//! down every field the broker interprets and carry the rest in a flattened
//! passthrough map so workers downstream see the full original payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hash tables, queues, and job names of the store layout.
pub mod names {
    pub const BUILD_CONFIGS: &str = "buildConfigs";
    pub const PERIODIC_BUILD_CONFIGS: &str = "periodicBuildConfigs";
    pub const FROZEN_BUILD_CONFIGS: &str = "frozenBuildConfigs";
    pub const TIMEOUT_CONFIGS: &str = "timeoutConfigs";

    pub const QUEUE_BUILDS: &str = "builds";
    pub const QUEUE_PERIODIC_BUILDS: &str = "periodicBuilds";
    pub const QUEUE_FROZEN_BUILDS: &str = "frozenBuilds";

    pub const JOB_START: &str = "start";
    pub const JOB_STOP: &str = "stop";
    pub const JOB_START_DELAYED: &str = "startDelayed";
    pub const JOB_START_FROZEN: &str = "startFrozen";

    pub const SCHEDULER_LEASE: &str = "scheduler_lease";
}

/// TTL of the abort marker written by `stop`, in seconds.
pub const ABORT_MARKER_TTL_SECS: i64 = 1800;

/// Annotation carrying a job's periodic-build cron expression.
pub const PERIODIC_ANNOTATION: &str = "screwdriver.cd/buildPeriodically";

/// Annotation overriding the default build timeout, in minutes.
pub const TIMEOUT_ANNOTATION: &str = "screwdriver.cd/timeout";

/// Default build timeout when the annotation is absent, in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 90;

/// Lifecycle state of a job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Enabled,
    Disabled,
}

/// Build status values exchanged with the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    #[display("QUEUED")]
    Queued,
    #[display("RUNNING")]
    Running,
    #[display("SUCCESS")]
    Success,
    #[display("FAILURE")]
    Failure,
    #[display("ABORTED")]
    Aborted,
    #[display("FROZEN")]
    Frozen,
    #[serde(other)]
    #[display("UNKNOWN")]
    Unknown,
}

/// A queued immediate build, as accepted by `start` and stored under
/// `buildConfigs` (and `frozenBuildConfigs` when deferred).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub build_id: u64,
    pub job_id:   u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name:    Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id:    Option<u64>,

    /// Jobs whose running builds block this one; always includes the job
    /// itself.
    #[serde(default)]
    pub blocked_by: Vec<u64>,

    /// Cron windows during which this job must not run.
    #[serde(default)]
    pub freeze_windows: Vec<String>,

    #[serde(default)]
    pub job_state:     JobState,
    #[serde(default)]
    pub job_archived:  bool,
    #[serde(default)]
    pub cause_message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    pub token:   String,
    pub api_uri: String,

    /// Set exactly once, at the instant of successful enqueue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueue_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub annotations: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BuildConfig {
    /// `blockedBy` as the comma-separated form queue items carry.
    #[must_use]
    pub fn blocked_by_csv(&self) -> String { csv(&self.blocked_by) }
}

/// Join ids into the comma-separated list used in queue item payloads.
#[must_use]
pub fn csv(ids: &[u64]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// `stop` command payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub build_id:   u64,
    pub job_id:     u64,
    #[serde(default)]
    pub blocked_by: Vec<u64>,
}

/// Pipeline reference inside a periodic-build definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicPipeline {
    pub id: u64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPermutation {
    #[serde(default)]
    pub annotations: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Job definition inside a periodic-build configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicJob {
    pub id:   u64,
    pub name: String,

    #[serde(default)]
    pub state:        JobState,
    #[serde(default)]
    pub archived:     bool,
    #[serde(default)]
    pub permutations: Vec<JobPermutation>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A periodic-build definition, stored under `periodicBuildConfigs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicConfig {
    pub pipeline: PeriodicPipeline,
    pub job:      PeriodicJob,
    pub api_uri:  String,

    #[serde(default)]
    pub is_update:     bool,
    #[serde(default)]
    pub trigger_build: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PeriodicConfig {
    /// The job's periodic-build cron annotation, if any.
    #[must_use]
    pub fn build_cron(&self) -> Option<&str> {
        self.job
            .permutations
            .first()?
            .annotations
            .get(PERIODIC_ANNOTATION)?
            .as_str()
    }
}

/// Declared max runtime of a running build, stored under `timeoutConfigs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutEntry {
    pub job_id:     u64,
    pub start_time: DateTime<Utc>,
    /// Minutes.
    pub timeout:    i64,
}

/// `startTimer` command payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerRequest {
    pub build_id:     u64,
    pub job_id:       u64,
    pub build_status: BuildStatus,
    pub start_time:   DateTime<Utc>,

    #[serde(default)]
    pub annotations: Map<String, Value>,
}

impl TimerRequest {
    /// Timeout in minutes: the annotation when present (number or numeric
    /// string), otherwise the default.
    #[must_use]
    pub fn timeout_minutes(&self) -> i64 {
        self.annotations
            .get(TIMEOUT_ANNOTATION)
            .and_then(|v| match v {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .unwrap_or(DEFAULT_TIMEOUT_MINUTES)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn build_config_keeps_unknown_fields() {
        let raw = json!({
            "buildId": 8609,
            "jobId": 777,
            "blockedBy": [777],
            "freezeWindows": ["* * * * *"],
            "causeMessage": "ad hoc",
            "jobState": "ENABLED",
            "jobArchived": false,
            "token": "t",
            "apiUri": "http://api",
            "provider": {"name": "sd"},
        });
        let cfg: BuildConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(cfg.build_id, 8609);
        assert_eq!(cfg.blocked_by_csv(), "777");
        assert_eq!(cfg.extra.get("provider"), Some(&json!({"name": "sd"})));

        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back.get("provider"), Some(&json!({"name": "sd"})));
    }

    #[test]
    fn periodic_config_reads_cron_annotation() {
        let raw = json!({
            "pipeline": {"id": 42},
            "job": {
                "id": 1234,
                "name": "main",
                "state": "ENABLED",
                "archived": false,
                "permutations": [
                    {"annotations": {"screwdriver.cd/buildPeriodically": "H * * * *"}}
                ],
            },
            "apiUri": "http://api",
            "triggerBuild": false,
            "isUpdate": false,
        });
        let cfg: PeriodicConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(cfg.build_cron(), Some("H * * * *"));
        assert_eq!(cfg.job.state, JobState::Enabled);
    }

    #[test]
    fn timer_timeout_reads_annotation_forms() {
        let mut req: TimerRequest = serde_json::from_value(json!({
            "buildId": 8609,
            "jobId": 777,
            "buildStatus": "RUNNING",
            "startTime": "2024-01-01T00:00:00Z",
            "annotations": {"screwdriver.cd/timeout": 120},
        }))
        .unwrap();
        assert_eq!(req.timeout_minutes(), 120);

        req.annotations
            .insert(TIMEOUT_ANNOTATION.to_string(), json!("45"));
        assert_eq!(req.timeout_minutes(), 45);

        req.annotations.remove(TIMEOUT_ANNOTATION);
        assert_eq!(req.timeout_minutes(), DEFAULT_TIMEOUT_MINUTES);
    }

    #[test]
    fn unknown_build_status_does_not_fail_decoding() {
        let req: TimerRequest = serde_json::from_value(json!({
            "buildId": 1,
            "jobId": 2,
            "buildStatus": "COLLAPSED",
            "startTime": "2024-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(req.build_status, BuildStatus::Unknown);
    }

    #[test]
    fn csv_joins_ids() {
        assert_eq!(csv(&[777]), "777");
        assert_eq!(csv(&[1, 2, 3]), "1,2,3");
        assert_eq!(csv(&[]), "");
    }
}
