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
use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to connect to Redis at {host}:{port}"))]
    Connect {
        host:   String,
        port:   u16,
        #[snafu(source)]
        source: redis::RedisError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Store operation {op} failed"))]
    Store {
        op:     &'static str,
        #[snafu(source)]
        source: redis::RedisError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Queue operation {op} failed"))]
    Queue {
        op:     &'static str,
        #[snafu(source)]
        source: redis::RedisError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The de-duplication signal: the item is already present in the delayed
    /// index. Callers treat this as success, never as a user-visible error.
    #[snafu(display("Item already scheduled on {queue}"))]
    DuplicateScheduled {
        queue: String,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Circuit breaker is open"))]
    BreakerOpen {
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    #[snafu(display("Operation timed out after {millis}ms"))]
    Timeout {
        millis: u64,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to encode payload"))]
    Encode {
        #[snafu(source)]
        source: serde_json::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to decode payload: {payload}"))]
    Decode {
        payload: String,
        #[snafu(source)]
        source:  serde_json::Error,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },
}

impl Error {
    /// Whether this error is the delayed-index de-duplication signal.
    #[must_use]
    pub const fn is_duplicate_scheduled(&self) -> bool {
        matches!(self, Error::DuplicateScheduled { .. })
    }
}

impl StackError for Error {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) {
        buf.push(format!("{layer}: {self}"))
    }

    fn next(&self) -> Option<&dyn StackError> { None }
}

impl ErrorExt for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Connect { .. } | Error::BreakerOpen { .. } | Error::Timeout { .. } => {
                StatusCode::Unavailable
            }
            Error::DuplicateScheduled { .. } => StatusCode::Conflict,
            Error::Encode { .. } | Error::Decode { .. } => StatusCode::InvalidArgument,
            Error::Store { .. } | Error::Queue { .. } => StatusCode::Internal,
        }
    }

    fn as_any(&self) -> &dyn Any { self as _ }
}
