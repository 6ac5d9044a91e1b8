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

use std::any::Any;

use sdq_error::{ErrorExt, StackError, StatusCode};
use sdq_store::BreakerError;
use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid broker configuration: {message}"))]
    Config {
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("Cron expression {expr:?} must have exactly 5 fields"))]
    MalformedCron {
        expr: String,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },

    #[snafu(display("Hash range {lo}-{hi} is outside the valid {field} range {min}-{max}"))]
    InvalidRange {
        field: &'static str,
        lo:    u32,
        hi:    u32,
        min:   u32,
        max:   u32,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Cron expression {expr:?} has no future occurrence"))]
    NoNextOccurrence {
        expr:   String,
        #[snafu(source)]
        source: croner::errors::CronError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(transparent)]
    Store {
        source: sdq_store::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Circuit breaker is open"))]
    BreakerOpen {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Outbound call timed out after {millis}ms"))]
    Timeout {
        millis: u64,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("{method} {url} failed after {attempts} attempts: {message}"))]
    Api {
        method:   &'static str,
        url:      String,
        attempts: u32,
        message:  String,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    #[snafu(display("No token generator has been provided"))]
    TokenGeneratorMissing {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Failed to generate an API token for {username}"))]
    Token {
        username: String,
        message:  String,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    #[snafu(display("Configuration is missing required field {field}"))]
    MissingField {
        field: &'static str,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Failed to decode stored {what}"))]
    DecodeConfig {
        what:   &'static str,
        #[snafu(source)]
        source: serde_json::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to encode {what}"))]
    EncodeConfig {
        what:   &'static str,
        #[snafu(source)]
        source: serde_json::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

impl Error {
    /// Collapse a breaker outcome over a store call into a broker error.
    #[must_use]
    pub fn from_breaker(err: BreakerError<sdq_store::Error>) -> Self {
        match err {
            BreakerError::Open => BreakerOpenSnafu.build(),
            BreakerError::Timeout { millis } => TimeoutSnafu { millis }.build(),
            BreakerError::Inner(source) => Error::from(source),
        }
    }

    /// Whether the underlying cause is the delayed-index de-duplication
    /// signal.
    #[must_use]
    pub fn is_duplicate_scheduled(&self) -> bool {
        matches!(self, Error::Store { source, .. } if source.is_duplicate_scheduled())
    }
}

impl StackError for Error {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) {
        buf.push(format!("{layer}: {self}"))
    }

    fn next(&self) -> Option<&dyn StackError> {
        match self {
            Error::Store { source, .. } => Some(source),
            _ => None,
        }
    }

    fn transparent(&self) -> bool { matches!(self, Error::Store { .. }) }
}

impl ErrorExt for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Config { .. }
            | Error::MalformedCron { .. }
            | Error::InvalidRange { .. }
            | Error::NoNextOccurrence { .. }
            | Error::MissingField { .. } => StatusCode::InvalidArgument,
            Error::BreakerOpen { .. } | Error::Timeout { .. } | Error::Api { .. } => {
                StatusCode::Unavailable
            }
            Error::Store { source, .. } => source.status_code(),
            _ => StatusCode::Internal,
        }
    }

    fn as_any(&self) -> &dyn Any { self as _ }
}
