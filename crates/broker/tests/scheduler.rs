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

//! Scheduler flows: matured delayed jobs fire through the broker, the
//! timeout sweeper fails overrunning builds.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sdq_broker::{
    BreakerOptions, BrokerConfig, BrokerCore, BuildConfig, BuildStatus, ControlPlane,
    EventRequest, PipelineAdmin, PipelineFactory, Scheduler, SchedulerConfig, TimeoutEntry,
};
use sdq_store::{
    KvStore, WorkQueue,
    memory::{MemoryKv, MemoryQueue},
};
use serde_json::json;
use tokio::time::{Duration, sleep};

#[derive(Default)]
struct RecordingApi {
    events:   Mutex<Vec<EventRequest>>,
    statuses: Mutex<Vec<(u64, BuildStatus, String)>>,
}

#[async_trait]
impl ControlPlane for RecordingApi {
    async fn post_event(
        &self,
        _api_uri: &str,
        _token: &str,
        event: &EventRequest,
    ) -> sdq_broker::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn update_build_status(
        &self,
        _api_uri: &str,
        build_id: u64,
        _token: &str,
        status: BuildStatus,
        message: &str,
    ) -> sdq_broker::Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((build_id, status, message.to_string()));
        Ok(())
    }
}

struct StaticPipelines;

#[async_trait]
impl PipelineFactory for StaticPipelines {
    async fn first_admin(&self, _pipeline_id: u64) -> sdq_broker::Result<PipelineAdmin> {
        Ok(PipelineAdmin {
            username: "alice".to_string(),
        })
    }
}

struct Fixture {
    kv:     Arc<MemoryKv>,
    queue:  Arc<MemoryQueue>,
    api:    Arc<RecordingApi>,
    broker: Arc<BrokerCore>,
}

fn fixture() -> Fixture {
    let kv = Arc::new(MemoryKv::new());
    let queue = Arc::new(MemoryQueue::new());
    let api = Arc::new(RecordingApi::default());
    let config = BrokerConfig::builder()
        .breaker(
            BreakerOptions::builder()
                .retries(0)
                .retry_delay_secs(0)
                .build(),
        )
        .build();
    let broker = BrokerCore::with_clients(
        &config,
        Arc::new(StaticPipelines),
        kv.clone(),
        queue.clone(),
        api.clone(),
    );
    Fixture {
        kv,
        queue,
        api,
        broker,
    }
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig::builder()
        .check_timeout_ms(50)
        .max_event_loop_delay_ms(1)
        .timeout_sweep_secs(1)
        .build()
}

fn start_scheduler(f: &Fixture) -> Scheduler {
    Scheduler::start(
        &scheduler_config(),
        f.kv.clone(),
        f.queue.clone(),
        f.api.clone(),
        f.broker.clone(),
        f.broker.clone(),
    )
}

#[tokio::test(start_paused = true)]
async fn matured_periodic_job_fires_and_reschedules() {
    let f = fixture();

    // A registered periodic job whose firing has matured
    let periodic = json!({
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
    f.kv.hset("periodicBuildConfigs", "1234", &periodic.to_string())
        .await
        .unwrap();
    let matured = (Utc::now() - ChronoDuration::minutes(1)).timestamp_millis();
    f.queue
        .enqueue_at(matured, "periodicBuilds", "startDelayed", &json!({"jobId": 1234}))
        .await
        .unwrap();

    let scheduler = start_scheduler(&f);
    sleep(Duration::from_millis(300)).await;
    scheduler.cleanup().await;

    // No token generator was ever cached, so the event post is skipped
    // after logging; the next firing must still be re-enqueued.
    let entries = f.queue.delayed_entries();
    assert_eq!(entries.len(), 1, "next firing re-enqueued");
    let (item, fire_at) = &entries[0];
    assert_eq!(item.queue, "periodicBuilds");
    assert_eq!(item.args, json!({"jobId": 1234}));
    assert!(*fire_at > Utc::now().timestamp_millis());

    // Graceful cleanup handed the master lease back
    assert!(f.kv.get("scheduler_lease").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn matured_frozen_job_posts_event() {
    let f = fixture();

    let frozen: BuildConfig = serde_json::from_value(json!({
        "buildId": 8609,
        "jobId": 777,
        "pipelineId": 42,
        "jobName": "main",
        "jobState": "ENABLED",
        "jobArchived": false,
        "token": "t",
        "apiUri": "http://api",
    }))
    .unwrap();
    f.kv.hset(
        "frozenBuildConfigs",
        "777",
        &serde_json::to_string(&frozen).unwrap(),
    )
    .await
    .unwrap();
    let matured = (Utc::now() - ChronoDuration::minutes(1)).timestamp_millis();
    f.queue
        .enqueue_at(matured, "frozenBuilds", "startFrozen", &json!({"jobId": 777}))
        .await
        .unwrap();

    let scheduler = start_scheduler(&f);
    sleep(Duration::from_millis(300)).await;
    scheduler.cleanup().await;

    let events = f.api.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].pipeline_id, 42);
    assert_eq!(events[0].start_from, "main");
    assert_eq!(
        events[0].cause_message.as_deref(),
        Some("Started by freeze window scheduler")
    );
    assert_eq!(f.queue.delayed_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn immature_jobs_stay_delayed() {
    let f = fixture();

    let future = (Utc::now() + ChronoDuration::hours(1)).timestamp_millis();
    f.queue
        .enqueue_at(future, "frozenBuilds", "startFrozen", &json!({"jobId": 777}))
        .await
        .unwrap();

    let scheduler = start_scheduler(&f);
    sleep(Duration::from_millis(300)).await;
    scheduler.cleanup().await;

    assert_eq!(f.queue.delayed_len(), 1);
    assert!(f.api.events.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timeout_sweeper_fails_overrunning_builds() {
    let f = fixture();

    let entry = TimeoutEntry {
        job_id:     777,
        start_time: Utc::now() - ChronoDuration::minutes(120),
        timeout:    90,
    };
    f.kv.hset(
        "timeoutConfigs",
        "8609",
        &serde_json::to_string(&entry).unwrap(),
    )
    .await
    .unwrap();
    let build = json!({
        "buildId": 8609,
        "jobId": 777,
        "token": "t",
        "apiUri": "http://api",
    });
    f.kv.hset("buildConfigs", "8609", &build.to_string())
        .await
        .unwrap();

    let scheduler = start_scheduler(&f);
    sleep(Duration::from_millis(2500)).await;
    scheduler.cleanup().await;

    let statuses = f.api.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].0, 8609);
    assert_eq!(statuses[0].1, BuildStatus::Failure);
    assert_eq!(statuses[0].2, "Build failed due to timeout");

    assert!(f.kv.hget("timeoutConfigs", "8609").await.unwrap().is_none());
    assert!(f.kv.hget("buildConfigs", "8609").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn timeout_sweeper_leaves_healthy_builds_alone() {
    let f = fixture();

    let entry = TimeoutEntry {
        job_id:     777,
        start_time: Utc::now() - ChronoDuration::minutes(10),
        timeout:    90,
    };
    f.kv.hset(
        "timeoutConfigs",
        "8609",
        &serde_json::to_string(&entry).unwrap(),
    )
    .await
    .unwrap();

    let scheduler = start_scheduler(&f);
    sleep(Duration::from_millis(2500)).await;
    scheduler.cleanup().await;

    assert!(f.api.statuses.lock().unwrap().is_empty());
    assert!(f.kv.hget("timeoutConfigs", "8609").await.unwrap().is_some());
}
