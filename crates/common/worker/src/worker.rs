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

use crate::{context::WorkerContext, err::WorkResult};

/// Core worker trait defining execution logic and lifecycle hooks.
///
/// Workers are stateful tasks that execute according to a trigger schedule.
/// Registration (name, trigger) is handled by [`Manager::register`]
/// (crate::Manager::register), not by trait methods.
///
/// # Lifecycle
///
/// 1. `on_start` - Called once before first work execution
/// 2. `work` - Called repeatedly according to trigger schedule
/// 3. `on_shutdown` - Called once during graceful shutdown
#[async_trait::async_trait]
pub trait Worker: Send + 'static {
    /// Called once when the worker starts, before the first work execution.
    ///
    /// A failure here aborts the worker before it enters the schedule loop.
    async fn on_start(&mut self, _ctx: &WorkerContext) -> WorkResult<()> { Ok(()) }

    /// Core work unit, called according to the trigger schedule.
    ///
    /// The work should be atomic or idempotent when possible. Use
    /// `ctx.is_cancelled()` to check for shutdown requests mid-flight.
    async fn work(&mut self, ctx: &WorkerContext) -> WorkResult<()>;

    /// Called once during graceful shutdown, after the last work execution.
    ///
    /// Runs even when the work loop exited with an error.
    async fn on_shutdown(&mut self, _ctx: &WorkerContext) -> WorkResult<()> { Ok(()) }
}
