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

use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use sdq_app::{AppConfig, NullPipelines};
use snafu::{ResultExt, Whatever};

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "sdq",
about = "sdq build-queue scheduler",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Scheduler(SchedulerArgs),
    CheckCron(CheckCronArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Starts the sdq scheduler daemon.
Examples:

sdq scheduler
sdq scheduler --config /etc/sdq/config.json

")]
struct SchedulerArgs {
    /// Path to a JSON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl SchedulerArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .whatever_context("Failed to read configuration file")?;
                serde_json::from_str::<AppConfig>(&raw)
                    .whatever_context("Failed to parse configuration file")?
            }
            None => AppConfig::default(),
        };
        let app = config.open();
        app.run(Arc::new(NullPipelines)).await
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Resolves the H placeholders of a hashed cron expression and prints the next
firing time.
Examples:

sdq check-cron 'H * * * *' --job-id 1234

")]
struct CheckCronArgs {
    /// 5-field cron expression, H placeholders allowed.
    expr: String,

    /// Job id the H placeholders hash over.
    #[arg(long, default_value_t = 0)]
    job_id: u64,
}

impl CheckCronArgs {
    fn run(&self) -> Result<(), Whatever> {
        let transformed = sdq_broker::cron::transform(&self.expr, self.job_id)
            .whatever_context("Invalid cron expression")?;
        let next = sdq_broker::cron::next(&transformed, chrono::Utc::now())
            .whatever_context("No future occurrence")?;
        println!("{transformed}");
        println!("next: {next}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Scheduler(sa) => sa.run().await,
        Commands::CheckCron(ca) => ca.run(),
    }
}
