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

//! Worker abstraction for the sdq schedulers.
//!
//! The broker runs a small fixed set of long-lived background tasks (the
//! delay-queue pollers and the build-timeout sweeper). This crate provides
//! the plumbing they share:
//! - **Trigger types**: Once, Notify, Interval
//! - **Lifecycle hooks**: `on_start`, `work`, `on_shutdown`
//! - **Graceful shutdown**: coordinated cancellation with a deadline
//! - **Pause/Resume/Notify**: runtime control via [`WorkerHandle`]
//! - **Prometheus metrics** for every lifecycle transition
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use sdq_common_worker::{Manager, Trigger, Worker, WorkerConfig, WorkerContext, WorkResult};
//!
//! struct Poller;
//!
//! #[async_trait::async_trait]
//! impl Worker for Poller {
//!     async fn work(&mut self, ctx: &WorkerContext) -> WorkResult<()> {
//!         println!("tick");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut manager = Manager::start(WorkerConfig::builder().build());
//!     let handle = manager.register(Poller, "poller", Trigger::Interval(Duration::from_secs(1)));
//!
//!     handle.pause();
//!     handle.resume();
//!
//!     manager.shutdown().await;
//! }
//! ```

mod context;
mod err;
mod handle;
mod id;
mod manager;
mod metrics;
mod trigger;
mod worker;

pub use context::WorkerContext;
pub use err::{WorkError, WorkResult};
pub use handle::WorkerHandle;
pub use id::WorkerId;
pub use manager::{Manager, WorkerConfig};
pub use trigger::Trigger;
pub use worker::Worker;
