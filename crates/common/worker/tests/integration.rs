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

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use sdq_common_worker::{Manager, Trigger, WorkResult, Worker, WorkerConfig, WorkerContext};
use tokio::time::sleep;

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init();
}

struct CounterWorker {
    counter: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Worker for CounterWorker {
    async fn work(&mut self, _ctx: &WorkerContext) -> WorkResult<()> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_interval_worker() {
    init_test_logging();

    let counter = Arc::new(AtomicU32::new(0));
    let mut manager = Manager::start(WorkerConfig::builder().build());

    let _handle = manager.register(
        CounterWorker {
            counter: counter.clone(),
        },
        "interval-worker",
        Trigger::Interval(Duration::from_millis(100)),
    );

    sleep(Duration::from_millis(550)).await;

    manager.shutdown().await;

    let final_count = counter.load(Ordering::SeqCst);
    assert!(
        (4..=7).contains(&final_count),
        "Expected 4-7 ticks, got {}",
        final_count
    );
}

#[tokio::test]
async fn test_notify_worker() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut manager = Manager::start(WorkerConfig::builder().build());

    let handle = manager.register(
        CounterWorker {
            counter: counter.clone(),
        },
        "notify-worker",
        Trigger::Notify,
    );

    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        counter.load(Ordering::SeqCst),
        0,
        "Should not execute without notification"
    );

    for _ in 0..3 {
        handle.notify();
        sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(
        counter.load(Ordering::SeqCst),
        3,
        "Should execute exactly 3 times"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_once_worker() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut manager = Manager::start(WorkerConfig::builder().build());

    let _handle = manager.register(
        CounterWorker {
            counter: counter.clone(),
        },
        "once-worker",
        Trigger::Once,
    );

    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        counter.load(Ordering::SeqCst),
        1,
        "Should execute exactly once"
    );

    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        counter.load(Ordering::SeqCst),
        1,
        "Should still be 1 after waiting"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_pause_skips_executions() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut manager = Manager::start(WorkerConfig::builder().build());

    let handle = manager.register(
        CounterWorker {
            counter: counter.clone(),
        },
        "pausable-worker",
        Trigger::Interval(Duration::from_millis(50)),
    );

    sleep(Duration::from_millis(120)).await;
    handle.pause();
    assert!(handle.is_paused());
    let paused_at = counter.load(Ordering::SeqCst);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        counter.load(Ordering::SeqCst),
        paused_at,
        "No executions while paused"
    );

    handle.resume();
    sleep(Duration::from_millis(150)).await;
    assert!(
        counter.load(Ordering::SeqCst) > paused_at,
        "Executions resume after resume()"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_notify_forces_interval_run() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut manager = Manager::start(WorkerConfig::builder().build());

    let handle = manager.register(
        CounterWorker {
            counter: counter.clone(),
        },
        "hybrid-worker",
        Trigger::Interval(Duration::from_secs(3600)),
    );

    // First tick fires immediately; drain it
    sleep(Duration::from_millis(100)).await;
    let base = counter.load(Ordering::SeqCst);

    handle.notify();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), base + 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_work_error_stops_the_worker() {
    struct FailingWorker {
        counter: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Worker for FailingWorker {
        async fn work(&mut self, _ctx: &WorkerContext) -> WorkResult<()> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            if n >= 1 {
                snafu::whatever!("backing store went away");
            }
            Ok(())
        }
    }

    let counter = Arc::new(AtomicU32::new(0));
    let mut manager = Manager::start(WorkerConfig::builder().build());

    let _handle = manager.register(
        FailingWorker {
            counter: counter.clone(),
        },
        "failing-worker",
        Trigger::Interval(Duration::from_millis(50)),
    );

    sleep(Duration::from_millis(400)).await;
    assert_eq!(
        counter.load(Ordering::SeqCst),
        2,
        "the loop ends on the first error"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_runs_hooks() {
    struct HookWorker {
        started:  Arc<AtomicU32>,
        finished: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Worker for HookWorker {
        async fn on_start(&mut self, _ctx: &WorkerContext) -> WorkResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn work(&mut self, _ctx: &WorkerContext) -> WorkResult<()> { Ok(()) }

        async fn on_shutdown(&mut self, _ctx: &WorkerContext) -> WorkResult<()> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let started = Arc::new(AtomicU32::new(0));
    let finished = Arc::new(AtomicU32::new(0));
    let mut manager = Manager::start(WorkerConfig::builder().build());

    let _handle = manager.register(
        HookWorker {
            started:  started.clone(),
            finished: finished.clone(),
        },
        "hook-worker",
        Trigger::Interval(Duration::from_millis(50)),
    );

    sleep(Duration::from_millis(100)).await;
    manager.shutdown().await;

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
