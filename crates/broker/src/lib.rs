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

//! Build-queue broker for Screwdriver CI.
//!
//! sdq sits between the Screwdriver API and a pool of build-executor
//! workers. It accepts build lifecycle commands, turns them into durable
//! work items on a Redis-backed queue, and runs the schedulers that
//! reinject periodic and freeze-deferred builds when they are due.
//!
//! # Architecture
//!
//! ```text
//! Screwdriver API ──commands──► BrokerCore ──items──► Redis queues ──► executor workers
//!                                   ▲   │
//!                      run_periodic │   │ events, status updates
//!                      run_frozen   │   ▼
//!                               Scheduler ──────► Screwdriver API (/v4)
//!                          (pollers + sweeper)
//! ```
//!
//! [`BrokerCore`] owns all writes to the hash tables and queues. The
//! [`Scheduler`] polls the delayed index and calls back into the core
//! through the [`PeriodicRunner`]/[`FrozenRunner`] capabilities.

pub mod api;
pub mod config;
pub mod core;
pub mod cron;
pub mod error;
pub mod freeze;
pub mod scheduler;
pub mod types;

pub use api::{ApiClient, ControlPlane, EventRequest};
pub use config::{BreakerOptions, BrokerConfig, PipelineAdmin, PipelineFactory, TokenGenerator};
pub use error::{Error, Result};
pub use self::core::BrokerCore;
pub use scheduler::{FrozenRunner, PeriodicRunner, Scheduler, SchedulerConfig};
pub use types::{
    BuildConfig, BuildStatus, JobState, PeriodicConfig, StopRequest, TimeoutEntry, TimerRequest,
};
