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

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

use crate::{
    id::WorkerId,
    metrics::{WORKER_PAUSED, WORKER_RESUMED},
};

/// Handle for controlling a registered worker at runtime.
///
/// Pausing is soft: the trigger keeps advancing but `work()` calls are
/// skipped while paused. `notify()` wakes a `Notify`-triggered worker (and
/// is a no-op for purely interval-driven ones).
#[derive(Clone)]
pub struct WorkerHandle {
    id:     WorkerId,
    name:   &'static str,
    notify: Arc<Notify>,
    paused: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: WorkerId,
        name: &'static str,
        notify: Arc<Notify>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        WorkerHandle {
            id,
            name,
            notify,
            paused,
        }
    }

    #[must_use]
    pub const fn id(&self) -> WorkerId { self.id }

    #[must_use]
    pub const fn name(&self) -> &'static str { self.name }

    /// Skip subsequent executions until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        WORKER_PAUSED.with_label_values(&[self.name]).inc();
    }

    /// Resume executions after a [`pause`](Self::pause).
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        WORKER_RESUMED.with_label_values(&[self.name]).inc();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool { self.paused.load(Ordering::Acquire) }

    /// Trigger an immediate execution of a notify-driven worker.
    pub fn notify(&self) { self.notify.notify_one(); }
}
