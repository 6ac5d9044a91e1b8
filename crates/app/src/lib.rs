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

//! Scheduler daemon lifecycle.
//!
//! Wires the Redis clients, the broker core, and the scheduler workers
//! together, installs telemetry, and handles graceful shutdown on signals.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use sdq_broker::{
    BrokerConfig, BrokerCore, PipelineAdmin, PipelineFactory, Scheduler, SchedulerConfig,
};
use sdq_common_telemetry as telemetry;
use sdq_store::{Keys, RedisHandle, RedisKv, RedisQueue};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, Whatever};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Placeholder pipeline lookup for deployments that never cache a token
/// generator; scheduler-created events then reuse the tokens carried in the
/// stored build configs.
pub struct NullPipelines;

#[async_trait]
impl PipelineFactory for NullPipelines {
    async fn first_admin(&self, _pipeline_id: u64) -> sdq_broker::Result<PipelineAdmin> {
        sdq_broker::error::MissingFieldSnafu {
            field: "pipelineFactory",
        }
        .fail()
    }
}

/// Represents the main application with lifecycle management
#[derive(SmartDefault)]
pub struct App {
    /// Application configuration
    pub config:             AppConfig,
    /// Controls if the application should continue running
    #[default(_code = "Arc::new(AtomicBool::new(false))")]
    pub running:            Arc<AtomicBool>,
    /// Cancellation token for graceful shutdown
    #[default(_code = "CancellationToken::new()")]
    pub cancellation_token: CancellationToken,
}

/// Configuration for the application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct AppConfig {
    /// Broker and Redis configuration
    #[builder(default)]
    pub broker:    BrokerConfig,
    /// Scheduler worker configuration
    #[builder(default)]
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    #[builder(default)]
    pub logging:   telemetry::logging::LoggingOptions,
    /// Whether to enable graceful shutdown on signals
    #[default = true]
    #[builder(default = true)]
    pub enable_graceful_shutdown: bool,
}

impl AppConfig {
    #[must_use]
    pub fn open(self) -> App {
        App {
            config: self,
            ..Default::default()
        }
    }
}

/// Handle for controlling a running application
pub struct AppHandle {
    /// Sender for triggering shutdown
    shutdown_tx:        Option<oneshot::Sender<()>>,
    /// Application running flag
    running:            Arc<AtomicBool>,
    /// Cancellation token
    cancellation_token: CancellationToken,
}

impl AppHandle {
    /// Gracefully shutdown the application
    pub fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");
        self.running.store(false, Ordering::SeqCst);

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Check if the application is still running
    #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    /// Wait for the application to shutdown
    pub async fn wait_for_shutdown(&self) { self.cancellation_token.cancelled().await; }
}

impl App {
    /// Start the scheduler daemon and return a handle for controlling it.
    async fn start(
        &self,
        pipelines: Arc<dyn PipelineFactory>,
    ) -> Result<AppHandle, Whatever> {
        let _guards = telemetry::logging::init_global_logging("sdq", &self.config.logging);
        telemetry::panic_hook::set_panic_hook();

        info!("Starting sdq scheduler");

        self.config
            .broker
            .validate()
            .whatever_context("Invalid broker configuration")?;

        // One lazily-connected Redis handle backs both clients
        let handle = RedisHandle::new(self.config.broker.redis.clone());
        let keys = Keys::new(self.config.broker.prefix.clone());
        let kv = Arc::new(RedisKv::new(handle.clone(), keys.clone()));
        let queue = Arc::new(RedisQueue::new(handle, keys));
        let api = Arc::new(sdq_broker::ApiClient::default());

        let broker = BrokerCore::with_clients(
            &self.config.broker,
            pipelines,
            kv.clone(),
            queue.clone(),
            api.clone(),
        );

        let scheduler = Scheduler::start(
            &self.config.scheduler,
            kv,
            queue,
            api,
            broker.clone(),
            broker,
        );

        self.running.store(true, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app_handle = AppHandle {
            shutdown_tx:        Some(shutdown_tx),
            running:            Arc::clone(&self.running),
            cancellation_token: self.cancellation_token.clone(),
        };

        info!("Scheduler started");

        let running = Arc::clone(&self.running);
        let cancellation_token = self.cancellation_token.clone();
        let enable_graceful_shutdown = self.config.enable_graceful_shutdown;

        tokio::spawn(async move {
            if enable_graceful_shutdown {
                shutdown_signal(shutdown_rx).await;
            } else {
                let _ = shutdown_rx.await;
            }

            running.store(false, Ordering::SeqCst);

            info!("Shutting down scheduler");
            scheduler.cleanup().await;
            cancellation_token.cancel();

            info!("Shutdown complete");
        });

        Ok(app_handle)
    }

    /// Run the application blocking until it's shut down
    pub async fn run(self, pipelines: Arc<dyn PipelineFactory>) -> Result<(), Whatever> {
        let handle = self.start(pipelines).await?;
        handle.wait_for_shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal(shutdown_rx: oneshot::Receiver<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal"); },
        () = terminate => { info!("Received terminate signal"); },
        _ = shutdown_rx => { info!("Received shutdown signal"); },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_creation() {
        let app = AppConfig::default().open();
        assert!(!app.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_app_start_and_shutdown() {
        let config = AppConfig::builder()
            .logging(
                telemetry::logging::LoggingOptions::builder()
                    .append_stdout(false)
                    .build(),
            )
            .enable_graceful_shutdown(false)
            .build();
        let app = config.open();

        let mut handle = app.start(Arc::new(NullPipelines)).await.unwrap();
        assert!(handle.is_running());

        handle.shutdown();
        handle.wait_for_shutdown().await;
        assert!(!handle.is_running());
    }
}
