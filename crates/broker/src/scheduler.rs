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

//! Delay-queue schedulers.
//!
//! Three background workers run per broker process:
//! - the **periodic poller** fires matured `periodicBuilds/startDelayed`
//!   items by re-entering `start_periodic` with `trigger_build = true`,
//! - the **frozen poller** fires matured `frozenBuilds/startFrozen` items,
//! - the **timeout sweeper** fails builds that exceeded their declared
//!   runtime.
//!
//! Multiple processes may run pollers; a Redis lease elects one master per
//! tick, and only the master pops matured work. A handler failure
//! re-enqueues the item one tick out, so delivery stays at-least-once.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::{StreamExt, stream};
use sdq_common_worker::{
    Manager, Trigger, WorkResult, Worker, WorkerConfig, WorkerContext, WorkerHandle,
};
use sdq_store::{KvStore, WorkQueue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smart_default::SmartDefault;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    api::ControlPlane,
    error::Result,
    types::{
        BuildConfig, BuildStatus, TimeoutEntry,
        names::{
            BUILD_CONFIGS, JOB_START_DELAYED, JOB_START_FROZEN, QUEUE_FROZEN_BUILDS,
            QUEUE_PERIODIC_BUILDS, SCHEDULER_LEASE, TIMEOUT_CONFIGS,
        },
    },
};

/// Scheduler tuning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lower bound on concurrent handler executions per tick.
    #[default = 1]
    #[builder(default = 1)]
    pub min_task_processors: usize,
    /// Upper bound on concurrent handler executions, and the pop batch size.
    #[default = 10]
    #[builder(default = 10)]
    pub max_task_processors: usize,
    /// Delay-queue poll interval, milliseconds.
    #[default = 1000]
    #[builder(default = 1000)]
    pub check_timeout_ms:    u64,
    /// Pause between handled jobs so a large batch cannot monopolize the
    /// executor, milliseconds.
    #[default = 10]
    #[builder(default = 10)]
    pub max_event_loop_delay_ms: u64,
    /// Timeout sweep interval, seconds.
    #[default = 60]
    #[builder(default = 60)]
    pub timeout_sweep_secs:  u64,
}

/// Fires a matured periodic build. Implemented by the broker core; the
/// scheduler only sees this capability, which breaks the handler→core→
/// scheduler cycle.
#[async_trait]
pub trait PeriodicRunner: Send + Sync {
    async fn run_periodic(&self, job_id: u64) -> Result<()>;
}

/// Fires a build whose freeze window reopened.
#[async_trait]
pub trait FrozenRunner: Send + Sync {
    async fn run_frozen(&self, job_id: u64) -> Result<()>;
}

/// Single-master election over a Redis lease key.
///
/// The lease lives three poll intervals; every tick the holder refreshes it
/// and non-holders try to claim it, so a dead master is replaced within one
/// lease lifetime.
struct MasterLease {
    kv:       Arc<dyn KvStore>,
    id:       String,
    ttl_secs: i64,
}

impl MasterLease {
    fn new(kv: Arc<dyn KvStore>, check_interval: Duration) -> Self {
        MasterLease {
            kv,
            id: Uuid::new_v4().to_string(),
            ttl_secs: i64::try_from(check_interval.as_secs().max(1) * 3).unwrap_or(3),
        }
    }

    async fn ensure(&self) -> bool {
        match self.kv.get(SCHEDULER_LEASE).await {
            Ok(Some(holder)) if holder == self.id => {
                if let Err(e) = self.kv.expire(SCHEDULER_LEASE, self.ttl_secs).await {
                    warn!(error = %e, "Failed to refresh scheduler lease");
                    return false;
                }
                true
            }
            Ok(Some(_)) => false,
            Ok(None) => {
                let ttl_ms = u64::try_from(self.ttl_secs).unwrap_or(3) * 1000;
                match self.kv.set_nx_px(SCHEDULER_LEASE, &self.id, ttl_ms).await {
                    Ok(claimed) => {
                        if claimed {
                            info!(id = %self.id, "Claimed scheduler master lease");
                        }
                        claimed
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to claim scheduler lease");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read scheduler lease");
                false
            }
        }
    }

    /// Delete the lease if this instance still holds it, so a successor can
    /// claim mastership immediately instead of waiting out the TTL.
    async fn release(&self) {
        match self.kv.get(SCHEDULER_LEASE).await {
            Ok(Some(holder)) if holder == self.id => {
                if let Err(e) = self.kv.del(SCHEDULER_LEASE).await {
                    warn!(error = %e, "Failed to release scheduler lease");
                } else {
                    info!(id = %self.id, "Released scheduler master lease");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read scheduler lease during release");
            }
        }
    }
}

/// Per-queue dispatch target of a delayed poller.
#[async_trait]
trait DelayedHandler: Send + Sync {
    fn queue(&self) -> &'static str;
    fn job_name(&self) -> &'static str;
    async fn handle(&self, args: &Value) -> Result<()>;
}

struct PeriodicHandler {
    runner: Arc<dyn PeriodicRunner>,
}

#[async_trait]
impl DelayedHandler for PeriodicHandler {
    fn queue(&self) -> &'static str { QUEUE_PERIODIC_BUILDS }

    fn job_name(&self) -> &'static str { JOB_START_DELAYED }

    async fn handle(&self, args: &Value) -> Result<()> {
        let job_id = job_id_of(args);
        self.runner.run_periodic(job_id).await
    }
}

struct FrozenHandler {
    runner: Arc<dyn FrozenRunner>,
}

#[async_trait]
impl DelayedHandler for FrozenHandler {
    fn queue(&self) -> &'static str { QUEUE_FROZEN_BUILDS }

    fn job_name(&self) -> &'static str { JOB_START_FROZEN }

    async fn handle(&self, args: &Value) -> Result<()> {
        let job_id = job_id_of(args);
        self.runner.run_frozen(job_id).await
    }
}

fn job_id_of(args: &Value) -> u64 {
    args.get("jobId").and_then(Value::as_u64).unwrap_or(0)
}

/// Polls the delayed index for one sub-queue and fires matured items.
struct DelayedPoller {
    queue:       Arc<dyn WorkQueue>,
    lease:       Arc<MasterLease>,
    handler:     Arc<dyn DelayedHandler>,
    parallelism: usize,
    batch:       usize,
    job_delay:   Duration,
    retry_delay: ChronoDuration,
}

impl DelayedPoller {
    async fn fire(&self, args: Value) {
        info!(queue = self.handler.queue(), args = %args, "job");
        match self.handler.handle(&args).await {
            Ok(()) => {
                info!(queue = self.handler.queue(), args = %args, "success");
            }
            Err(e) => {
                error!(queue = self.handler.queue(), args = %args, error = %e, "failure");
                // At-least-once: push the item back one tick out
                let retry_at = (Utc::now() + self.retry_delay).timestamp_millis();
                match self
                    .queue
                    .enqueue_at(retry_at, self.handler.queue(), self.handler.job_name(), &args)
                    .await
                {
                    Ok(()) => warn!(queue = self.handler.queue(), args = %args, "reEnqueue"),
                    Err(e) if e.is_duplicate_scheduled() => {}
                    Err(e) => {
                        error!(queue = self.handler.queue(), args = %args, error = %e, "internalError");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Worker for DelayedPoller {
    async fn on_start(&mut self, ctx: &WorkerContext) -> WorkResult<()> {
        info!(worker = ctx.name(), queue = self.handler.queue(), "start");
        Ok(())
    }

    async fn work(&mut self, ctx: &WorkerContext) -> WorkResult<()> {
        if !self.lease.ensure().await {
            return Ok(());
        }

        let now_ms = Utc::now().timestamp_millis();
        let due = match self
            .queue
            .pop_due(now_ms, self.handler.queue(), self.batch)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(worker = ctx.name(), error = %e, "internalError");
                return Ok(());
            }
        };
        if due.is_empty() {
            return Ok(());
        }
        debug!(worker = ctx.name(), matured = due.len(), "Firing matured jobs");

        let this = &*self;
        stream::iter(due)
            .for_each_concurrent(this.parallelism, |item| async move {
                this.fire(item.args).await;
                tokio::time::sleep(this.job_delay).await;
            })
            .await;
        Ok(())
    }

    async fn on_shutdown(&mut self, ctx: &WorkerContext) -> WorkResult<()> {
        info!(worker = ctx.name(), "end");
        Ok(())
    }
}

/// Fails builds that exceeded their declared runtime and clears their
/// registry entries.
struct TimeoutSweeper {
    kv:  Arc<dyn KvStore>,
    api: Arc<dyn ControlPlane>,
}

impl TimeoutSweeper {
    async fn sweep(&self) {
        let entries = match self.kv.hgetall(TIMEOUT_CONFIGS).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to read timeout registry");
                return;
            }
        };
        let now = Utc::now();

        for (build_id, raw) in entries {
            let Ok(entry) = serde_json::from_str::<TimeoutEntry>(&raw) else {
                warn!(%build_id, "Dropping undecodable timeout entry");
                let _ = self.kv.hdel(TIMEOUT_CONFIGS, &build_id).await;
                continue;
            };
            let deadline = entry.start_time + ChronoDuration::minutes(entry.timeout);
            if now <= deadline {
                continue;
            }

            info!(%build_id, job_id = entry.job_id, timeout = entry.timeout, "Build timed out");
            self.fail_build(&build_id).await;
            if let Err(e) = self.kv.hdel(TIMEOUT_CONFIGS, &build_id).await {
                warn!(%build_id, error = %e, "Failed to clear timeout entry");
            }
        }
    }

    /// Mark the build failed through the control plane, using the
    /// credentials kept in its stored config.
    async fn fail_build(&self, build_id: &str) {
        let cfg = match self.kv.hget(BUILD_CONFIGS, build_id).await {
            Ok(Some(raw)) => serde_json::from_str::<BuildConfig>(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(%build_id, error = %e, "Failed to read build config for timed-out build");
                None
            }
        };
        let Some(cfg) = cfg else {
            debug!(%build_id, "No build config for timed-out build, registry entry dropped");
            return;
        };

        if let Err(e) = self
            .api
            .update_build_status(
                &cfg.api_uri,
                cfg.build_id,
                &cfg.token,
                BuildStatus::Failure,
                "Build failed due to timeout",
            )
            .await
        {
            warn!(%build_id, error = %e, "Failed to fail timed-out build");
        }
        if let Err(e) = self.kv.hdel(BUILD_CONFIGS, build_id).await {
            warn!(%build_id, error = %e, "Failed to clear config of timed-out build");
        }
    }
}

#[async_trait]
impl Worker for TimeoutSweeper {
    async fn work(&mut self, _ctx: &WorkerContext) -> WorkResult<()> {
        self.sweep().await;
        Ok(())
    }
}

/// The running scheduler: worker manager plus handles.
pub struct Scheduler {
    manager: Manager,
    lease:   Arc<MasterLease>,
    handles: Vec<WorkerHandle>,
}

impl Scheduler {
    /// Spawn the pollers and the sweeper.
    #[must_use]
    pub fn start(
        config: &SchedulerConfig,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn WorkQueue>,
        api: Arc<dyn ControlPlane>,
        periodic: Arc<dyn PeriodicRunner>,
        frozen: Arc<dyn FrozenRunner>,
    ) -> Self {
        let check_interval = Duration::from_millis(config.check_timeout_ms.max(1));
        let lease = Arc::new(MasterLease::new(kv.clone(), check_interval));
        let parallelism = config.max_task_processors.max(config.min_task_processors);
        let job_delay = Duration::from_millis(config.max_event_loop_delay_ms);
        let retry_delay =
            ChronoDuration::milliseconds(i64::try_from(config.check_timeout_ms).unwrap_or(1000));

        let mut manager = Manager::start(WorkerConfig::builder().build());
        let mut handles = Vec::new();

        handles.push(manager.register(
            DelayedPoller {
                queue: queue.clone(),
                lease: lease.clone(),
                handler: Arc::new(PeriodicHandler { runner: periodic }),
                parallelism,
                batch: config.max_task_processors,
                job_delay,
                retry_delay,
            },
            "periodic-poller",
            Trigger::Interval(check_interval),
        ));
        handles.push(manager.register(
            DelayedPoller {
                queue,
                lease: lease.clone(),
                handler: Arc::new(FrozenHandler { runner: frozen }),
                parallelism,
                batch: config.max_task_processors,
                job_delay,
                retry_delay,
            },
            "frozen-poller",
            Trigger::Interval(check_interval),
        ));
        handles.push(manager.register(
            TimeoutSweeper { kv, api },
            "timeout-sweeper",
            Trigger::Interval(Duration::from_secs(config.timeout_sweep_secs.max(1))),
        ));

        Scheduler {
            manager,
            lease,
            handles,
        }
    }

    /// Handles of the running workers, in registration order.
    #[must_use]
    pub fn handles(&self) -> &[WorkerHandle] { &self.handles }

    /// Stop the workers, release the master lease, then drop the scheduler
    /// state. The shared queue connection closes with its last owner.
    pub async fn cleanup(self) {
        info!("cleaning_worker");
        self.manager.shutdown().await;
        self.lease.release().await;
    }
}
