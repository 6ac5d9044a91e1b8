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

//! The broker command surface.
//!
//! [`BrokerCore`] turns build lifecycle commands into durable queue items
//! and hash entries. Every operation is idempotent on its declared keys;
//! the Redis connection is established lazily on first use. Store and queue
//! calls run through separate circuit breakers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use sdq_store::{
    BreakerStats, CircuitBreaker, Keys, KvStore, RedisHandle, RedisKv, RedisQueue, WorkQueue,
};
use serde_json::{Value, json};
use snafu::{OptionExt, ResultExt};
use tracing::{debug, error, info, warn};

use crate::{
    api::{ApiClient, ControlPlane, EventRequest},
    config::{BrokerConfig, PipelineFactory, TokenGenerator},
    cron,
    error::{
        DecodeConfigSnafu, EncodeConfigSnafu, Error, MissingFieldSnafu, Result,
        TokenGeneratorMissingSnafu,
    },
    freeze,
    scheduler::{FrozenRunner, PeriodicRunner},
    types::{
        ABORT_MARKER_TTL_SECS, BuildConfig, BuildStatus, JobState, PeriodicConfig, StopRequest,
        TimeoutEntry, TimerRequest, csv,
        names::{
            BUILD_CONFIGS, FROZEN_BUILD_CONFIGS, JOB_START, JOB_START_DELAYED, JOB_START_FROZEN,
            JOB_STOP, PERIODIC_BUILD_CONFIGS, QUEUE_BUILDS, QUEUE_FROZEN_BUILDS,
            QUEUE_PERIODIC_BUILDS, TIMEOUT_CONFIGS,
        },
    },
};

const PERIODIC_CAUSE: &str = "Started by periodic build scheduler";
const FROZEN_CAUSE: &str = "Started by freeze window scheduler";
const FORCE_START_MARKER: &str = "[force start]";

/// The build-queue broker.
pub struct BrokerCore {
    kv:            Arc<dyn KvStore>,
    queue:         Arc<dyn WorkQueue>,
    api:           Arc<dyn ControlPlane>,
    pipelines:     Arc<dyn PipelineFactory>,
    token_gen:     OnceCell<Arc<dyn TokenGenerator>>,
    store_breaker: CircuitBreaker,
    queue_breaker: CircuitBreaker,
}

impl BrokerCore {
    /// Build a broker over a fresh Redis connection.
    pub fn new(config: &BrokerConfig, pipelines: Arc<dyn PipelineFactory>) -> Result<Arc<Self>> {
        config.validate()?;
        let handle = RedisHandle::new(config.redis.clone());
        let keys = Keys::new(config.prefix.clone());
        let kv = Arc::new(RedisKv::new(handle.clone(), keys.clone()));
        let queue = Arc::new(RedisQueue::new(handle, keys));
        Ok(Self::with_clients(
            config,
            pipelines,
            kv,
            queue,
            Arc::new(ApiClient::default()),
        ))
    }

    /// Build a broker over caller-supplied clients (embedding, tests).
    pub fn with_clients(
        config: &BrokerConfig,
        pipelines: Arc<dyn PipelineFactory>,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn WorkQueue>,
        api: Arc<dyn ControlPlane>,
    ) -> Arc<Self> {
        let breaker = config.breaker.to_breaker_config();
        Arc::new(BrokerCore {
            kv,
            queue,
            api,
            pipelines,
            token_gen: OnceCell::new(),
            store_breaker: CircuitBreaker::new(breaker.clone()),
            queue_breaker: CircuitBreaker::new(breaker),
        })
    }

    /// Enqueue an immediate build, or defer it when a freeze window covers
    /// the current instant.
    pub async fn start(&self, cfg: BuildConfig) -> Result<()> {
        // Any stale frozen entry for this job is dropped first
        self.stop_frozen(cfg.job_id).await?;

        if cfg.job_state == JobState::Disabled || cfg.job_archived {
            debug!(job_id = cfg.job_id, "Job disabled or archived, nothing to start");
            return Ok(());
        }

        let now = Utc::now();
        let wake_at = freeze::time_out_of_windows(&cfg.freeze_windows, now)?;
        let force_start = cfg.cause_message.contains(FORCE_START_MARKER);

        if wake_at > now && !force_start {
            self.defer_frozen(cfg, wake_at).await
        } else {
            self.enqueue_ready(cfg, now).await
        }
    }

    async fn defer_frozen(&self, cfg: BuildConfig, wake_at: DateTime<Utc>) -> Result<()> {
        info!(
            build_id = cfg.build_id,
            job_id = cfg.job_id,
            wake_at = %wake_at,
            "Build falls inside a freeze window, deferring"
        );

        let message = format!(
            "Blocked by freeze window, re-enqueued to {}",
            wake_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if let Err(e) = self
            .api
            .update_build_status(
                &cfg.api_uri,
                cfg.build_id,
                &cfg.token,
                BuildStatus::Frozen,
                &message,
            )
            .await
        {
            warn!(build_id = cfg.build_id, error = %e, "Failed to mark build frozen");
        }

        let args = json!({"jobId": cfg.job_id});
        self.q_delete_delayed(QUEUE_FROZEN_BUILDS, JOB_START_FROZEN, &args)
            .await?;

        let raw = serde_json::to_string(&cfg).context(EncodeConfigSnafu {
            what: "frozen build config",
        })?;
        self.kv_hset(FROZEN_BUILD_CONFIGS, &cfg.job_id.to_string(), &raw)
            .await?;

        match self
            .q_enqueue_at(
                wake_at.timestamp_millis(),
                QUEUE_FROZEN_BUILDS,
                JOB_START_FROZEN,
                &args,
            )
            .await
        {
            Err(e) if e.is_duplicate_scheduled() => Ok(()),
            other => other,
        }
    }

    async fn enqueue_ready(&self, mut cfg: BuildConfig, now: DateTime<Utc>) -> Result<()> {
        cfg.enqueue_time = Some(now);

        // Callers tracking build.stats get the queue entry instant merged in
        if let Some(stats) = cfg
            .extra
            .get_mut("build")
            .and_then(|build| build.get_mut("stats"))
            .and_then(Value::as_object_mut)
        {
            stats.insert(
                "queueEnterTime".to_string(),
                json!(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }

        let raw = serde_json::to_string(&cfg).context(EncodeConfigSnafu {
            what: "build config",
        })?;
        self.kv_hset(BUILD_CONFIGS, &cfg.build_id.to_string(), &raw)
            .await?;

        let args = json!({
            "buildId": cfg.build_id,
            "jobId": cfg.job_id,
            "blockedBy": cfg.blocked_by_csv(),
        });
        self.q_enqueue(QUEUE_BUILDS, JOB_START, &args).await?;

        info!(build_id = cfg.build_id, job_id = cfg.job_id, "Build enqueued");
        Ok(())
    }

    /// Cancel a queued build, or request a stop of a running one.
    ///
    /// The stop item is enqueued unconditionally; its `started` flag tells
    /// workers whether the build ever left the queue.
    pub async fn stop(&self, req: StopRequest) -> Result<()> {
        let blocked_by = csv(&req.blocked_by);
        let start_args = json!({
            "buildId": req.build_id,
            "jobId": req.job_id,
            "blockedBy": blocked_by,
        });
        let num_deleted = self.q_delete(QUEUE_BUILDS, JOB_START, &start_args).await?;

        // The marker is written even when the item was still queued, so a
        // worker that already popped it can observe the abort.
        let marker = format!("deleted_{}_{}", req.job_id, req.build_id);
        self.kv_set(&marker, "").await?;
        self.kv_expire(&marker, ABORT_MARKER_TTL_SECS).await?;

        let started = num_deleted == 0;
        let stop_args = json!({
            "buildId": req.build_id,
            "jobId": req.job_id,
            "blockedBy": blocked_by,
            "started": started,
        });
        self.q_enqueue(QUEUE_BUILDS, JOB_STOP, &stop_args).await?;

        info!(build_id = req.build_id, started, "Stop requested");
        Ok(())
    }

    /// Register (or refresh) a periodic build and optionally fire it now.
    ///
    /// The token generator supplied on the first call is cached for the
    /// lifetime of the broker; later values are ignored.
    pub async fn start_periodic(
        &self,
        mut cfg: PeriodicConfig,
        token_gen: Option<Arc<dyn TokenGenerator>>,
    ) -> Result<()> {
        if let Some(generator) = token_gen
            && self.token_gen.set(generator).is_err()
        {
            debug!("Token generator already cached, ignoring replacement");
        }

        if cfg.is_update {
            self.stop_periodic(cfg.job.id).await?;
        }

        if cfg.trigger_build
            && let Err(e) = self.post_periodic_event(&cfg).await
        {
            warn!(job_id = cfg.job.id, error = %e, "Failed to post periodic build event");
        }

        let Some(expr) = cfg.build_cron().map(str::to_string) else {
            return Ok(());
        };
        if cfg.job.state != JobState::Enabled || cfg.job.archived {
            return Ok(());
        }

        let transformed = cron::transform(&expr, cfg.job.id)?;
        let next = cron::next(&transformed, Utc::now())?;

        cfg.is_update = false;
        cfg.trigger_build = false;
        let raw = serde_json::to_string(&cfg).context(EncodeConfigSnafu {
            what: "periodic build config",
        })?;
        self.kv_hset(PERIODIC_BUILD_CONFIGS, &cfg.job.id.to_string(), &raw)
            .await?;

        let args = json!({"jobId": cfg.job.id});
        let fire_at = next.timestamp_millis();
        match self
            .queue
            .enqueue_at(fire_at, QUEUE_PERIODIC_BUILDS, JOB_START_DELAYED, &args)
            .await
        {
            Ok(()) => {
                info!(job_id = cfg.job.id, next = %next, "Periodic build scheduled");
            }
            Err(e) if e.is_duplicate_scheduled() => {
                debug!(job_id = cfg.job.id, "Periodic build already scheduled");
            }
            Err(e) => {
                warn!(
                    job_id = cfg.job.id,
                    error = %e,
                    "Scheduling failed, retrying through the circuit breaker"
                );
                match self
                    .q_enqueue_at(fire_at, QUEUE_PERIODIC_BUILDS, JOB_START_DELAYED, &args)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_duplicate_scheduled() => {}
                    Err(e) => {
                        error!(job_id = cfg.job.id, error = %e, "Periodic build could not be scheduled");
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop a periodic-build registration and its pending firing.
    pub async fn stop_periodic(&self, job_id: u64) -> Result<()> {
        let args = json!({"jobId": job_id});
        self.q_delete_delayed(QUEUE_PERIODIC_BUILDS, JOB_START_DELAYED, &args)
            .await?;
        self.kv_hdel(PERIODIC_BUILD_CONFIGS, &job_id.to_string())
            .await?;
        Ok(())
    }

    /// Fire a build whose freeze window has reopened.
    pub async fn start_frozen(&self, cfg: BuildConfig) -> Result<()> {
        if cfg.job_state == JobState::Disabled || cfg.job_archived {
            debug!(job_id = cfg.job_id, "Job disabled or archived, dropping frozen build");
            return Ok(());
        }
        if let Err(e) = self.post_frozen_event(&cfg).await {
            warn!(job_id = cfg.job_id, error = %e, "Failed to post frozen build event");
        }
        Ok(())
    }

    /// Drop a deferred frozen build and its pending wake-up.
    pub async fn stop_frozen(&self, job_id: u64) -> Result<()> {
        let args = json!({"jobId": job_id});
        self.q_delete_delayed(QUEUE_FROZEN_BUILDS, JOB_START_FROZEN, &args)
            .await?;
        self.kv_hdel(FROZEN_BUILD_CONFIGS, &job_id.to_string())
            .await?;
        Ok(())
    }

    /// Record the declared max runtime of a running build.
    ///
    /// Best-effort bookkeeping: idempotent per build, every error is logged
    /// and swallowed.
    pub async fn start_timer(&self, req: TimerRequest) -> Result<()> {
        if let Err(e) = self.try_start_timer(&req).await {
            warn!(build_id = req.build_id, error = %e, "Timer registration failed");
        }
        Ok(())
    }

    async fn try_start_timer(&self, req: &TimerRequest) -> Result<()> {
        if req.build_status != BuildStatus::Running {
            return Ok(());
        }
        let field = req.build_id.to_string();
        if self.kv_hget(TIMEOUT_CONFIGS, &field).await?.is_some() {
            debug!(build_id = req.build_id, "Timeout entry already present");
            return Ok(());
        }
        let entry = TimeoutEntry {
            job_id:     req.job_id,
            start_time: req.start_time,
            timeout:    req.timeout_minutes(),
        };
        let raw = serde_json::to_string(&entry).context(EncodeConfigSnafu {
            what: "timeout entry",
        })?;
        self.kv_hset(TIMEOUT_CONFIGS, &field, &raw).await
    }

    /// Clear a build's timeout entry. Best-effort, like [`start_timer`]
    /// (Self::start_timer).
    pub async fn stop_timer(&self, build_id: u64) -> Result<()> {
        if let Err(e) = self.try_stop_timer(build_id).await {
            warn!(build_id, error = %e, "Timer removal failed");
        }
        Ok(())
    }

    async fn try_stop_timer(&self, build_id: u64) -> Result<()> {
        let field = build_id.to_string();
        if self.kv_hget(TIMEOUT_CONFIGS, &field).await?.is_none() {
            return Ok(());
        }
        self.kv_hdel(TIMEOUT_CONFIGS, &field).await?;
        Ok(())
    }

    /// Snapshot of the queue breaker's counters.
    #[must_use]
    pub fn stats(&self) -> BreakerStats { self.queue_breaker.stats() }

    async fn post_periodic_event(&self, cfg: &PeriodicConfig) -> Result<()> {
        let token = self.admin_token(cfg.pipeline.id).await?;
        let event = EventRequest {
            pipeline_id:     cfg.pipeline.id,
            start_from:      cfg.job.name.clone(),
            cause_message:   Some(PERIODIC_CAUSE.to_string()),
            parent_event_id: None,
            build_id:        None,
        };
        self.api.post_event(&cfg.api_uri, &token, &event).await
    }

    async fn post_frozen_event(&self, cfg: &BuildConfig) -> Result<()> {
        let pipeline_id = cfg.pipeline_id.context(MissingFieldSnafu {
            field: "pipelineId",
        })?;
        let start_from = cfg
            .job_name
            .clone()
            .context(MissingFieldSnafu { field: "jobName" })?;
        let token = match self.admin_token(pipeline_id).await {
            Ok(token) => token,
            // Frozen configs carry the original build token as a fallback
            Err(Error::TokenGeneratorMissing { .. }) => cfg.token.clone(),
            Err(e) => return Err(e),
        };
        let event = EventRequest {
            pipeline_id,
            start_from,
            cause_message: Some(FROZEN_CAUSE.to_string()),
            parent_event_id: cfg.event_id,
            build_id: None,
        };
        self.api.post_event(&cfg.api_uri, &token, &event).await
    }

    async fn admin_token(&self, pipeline_id: u64) -> Result<String> {
        let generator = self.token_gen.get().context(TokenGeneratorMissingSnafu)?;
        let admin = self.pipelines.first_admin(pipeline_id).await?;
        generator.generate(&admin.username)
    }

    // Breaker-wrapped store and queue calls

    async fn kv_hset(&self, table: &'static str, field: &str, value: &str) -> Result<()> {
        self.store_breaker
            .run(|| self.kv.hset(table, field, value))
            .await
            .map_err(Error::from_breaker)
    }

    async fn kv_hget(&self, table: &'static str, field: &str) -> Result<Option<String>> {
        self.store_breaker
            .run(|| self.kv.hget(table, field))
            .await
            .map_err(Error::from_breaker)
    }

    async fn kv_hdel(&self, table: &'static str, field: &str) -> Result<bool> {
        self.store_breaker
            .run(|| self.kv.hdel(table, field))
            .await
            .map_err(Error::from_breaker)
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.store_breaker
            .run(|| self.kv.set(key, value))
            .await
            .map_err(Error::from_breaker)
    }

    async fn kv_expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        self.store_breaker
            .run(|| self.kv.expire(key, ttl_secs))
            .await
            .map_err(Error::from_breaker)
    }

    async fn q_enqueue(&self, queue: &'static str, job: &'static str, args: &Value) -> Result<()> {
        self.queue_breaker
            .run(|| self.queue.enqueue(queue, job, args))
            .await
            .map_err(Error::from_breaker)
    }

    async fn q_enqueue_at(
        &self,
        ts_ms: i64,
        queue: &'static str,
        job: &'static str,
        args: &Value,
    ) -> Result<()> {
        self.queue_breaker
            .run(|| self.queue.enqueue_at(ts_ms, queue, job, args))
            .await
            .map_err(Error::from_breaker)
    }

    async fn q_delete(&self, queue: &'static str, job: &'static str, args: &Value) -> Result<usize> {
        self.queue_breaker
            .run(|| self.queue.delete(queue, job, args))
            .await
            .map_err(Error::from_breaker)
    }

    async fn q_delete_delayed(
        &self,
        queue: &'static str,
        job: &'static str,
        args: &Value,
    ) -> Result<usize> {
        self.queue_breaker
            .run(|| self.queue.delete_delayed(queue, job, args))
            .await
            .map_err(Error::from_breaker)
    }
}

#[async_trait]
impl PeriodicRunner for BrokerCore {
    async fn run_periodic(&self, job_id: u64) -> Result<()> {
        let Some(raw) = self
            .kv_hget(PERIODIC_BUILD_CONFIGS, &job_id.to_string())
            .await?
        else {
            warn!(job_id, "No periodic build config for matured job");
            return Ok(());
        };
        let mut cfg: PeriodicConfig = serde_json::from_str(&raw).context(DecodeConfigSnafu {
            what: "periodic build config",
        })?;
        cfg.trigger_build = true;
        cfg.is_update = false;
        self.start_periodic(cfg, None).await
    }
}

#[async_trait]
impl FrozenRunner for BrokerCore {
    async fn run_frozen(&self, job_id: u64) -> Result<()> {
        let Some(raw) = self
            .kv_hget(FROZEN_BUILD_CONFIGS, &job_id.to_string())
            .await?
        else {
            warn!(job_id, "No frozen build config for matured job");
            return Ok(());
        };
        let cfg: BuildConfig = serde_json::from_str(&raw).context(DecodeConfigSnafu {
            what: "frozen build config",
        })?;
        self.start_frozen(cfg).await
    }
}
