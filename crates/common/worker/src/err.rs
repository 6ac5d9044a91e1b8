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

use snafu::Snafu;

/// Errors surfaced by worker lifecycle hooks.
///
/// Workers own their domain errors; this type only carries what the manager
/// needs for logging and metrics.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WorkError {
    #[snafu(display("Worker {worker} failed: {message}"))]
    Failed {
        worker: &'static str,
        message: String,
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type WorkResult<T> = std::result::Result<T, WorkError>;
