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

use std::time::Duration;

/// Defines when and how a worker should be executed.
///
/// # Trigger Types
///
/// - **`Once`**: Runs immediately once at startup, then stops
/// - **`Notify`**: Runs only when explicitly triggered via handle
/// - **`Interval`**: Runs periodically at fixed intervals; `notify()` on the
///   handle additionally forces an immediate run without resetting the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Execute once immediately on startup, then stop.
    ///
    /// Useful for initialization tasks.
    Once,

    /// Execute only when explicitly notified via handle.
    ///
    /// Useful for event-driven or on-demand tasks.
    Notify,

    /// Execute at fixed intervals.
    ///
    /// The interval starts immediately and repeats continuously; missed
    /// ticks are skipped rather than bursted.
    Interval(Duration),
}
