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

//! Shared error scaffolding for the sdq workspace.
//!
//! Broker commands surface a [`StatusCode`] so an embedding surface (HTTP or
//! in-process) can translate failures uniformly, and the
//! [`StackError`]/[`ErrorExt`] traits let layered snafu enums report their
//! full cause chain without leaking internals for `Internal`-class errors.

use std::{any::Any, error::Error as StdError, sync::Arc};

use http::StatusCode as HttpStatusCode;
use serde::Serialize;
use strum::EnumProperty;

/// Classification of a broker failure, shared across all sdq crates.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    strum_macros::EnumProperty,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusCode {
    /// Malformed input: bad cron expression, out-of-range hash window, bad
    /// command payload.
    #[strum(props(http_status = "400"))]
    InvalidArgument,
    #[strum(props(http_status = "404"))]
    NotFound,
    /// An item is already scheduled for the same instant.
    #[strum(props(http_status = "409"))]
    Conflict,
    /// The store, queue, or control-plane API is unreachable or the circuit
    /// breaker is open.
    #[strum(props(http_status = "503"))]
    Unavailable,
    #[strum(props(http_status = "500"))]
    Internal,
    #[strum(props(http_status = "500"))]
    Unknown,
}

impl StatusCode {
    pub fn http_status(self) -> HttpStatusCode {
        self.get_str("http_status")
            .and_then(|value| value.parse::<u16>().ok())
            .and_then(|value| HttpStatusCode::from_u16(value).ok())
            .unwrap_or(HttpStatusCode::INTERNAL_SERVER_ERROR)
    }
}

pub trait StackError: StdError {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>);

    fn next(&self) -> Option<&dyn StackError>;

    fn last(&self) -> &dyn StackError
    where
        Self: Sized,
    {
        let Some(mut result) = self.next() else {
            return self;
        };
        while let Some(err) = result.next() {
            result = err;
        }
        result
    }

    fn transparent(&self) -> bool { false }
}

pub trait ErrorExt: StackError {
    fn status_code(&self) -> StatusCode { StatusCode::Unknown }

    fn as_any(&self) -> &dyn Any;

    fn output_msg(&self) -> String
    where
        Self: Sized,
    {
        match self.status_code() {
            StatusCode::Unknown | StatusCode::Internal => {
                format!("Internal error: {}", self.status_code() as u32)
            }
            _ => {
                let error = self.last();
                if let Some(external_error) = error.source() {
                    let mut root = external_error;
                    while let Some(source) = root.source() {
                        root = source;
                    }
                    if error.transparent() {
                        format!("{root}")
                    } else {
                        format!("{error}: {root}")
                    }
                } else {
                    format!("{error}")
                }
            }
        }
    }

    fn root_cause(&self) -> Option<&dyn StdError>
    where
        Self: Sized,
    {
        let error = self.last();
        let mut source = error.source()?;
        while let Some(next) = source.source() {
            source = next;
        }
        Some(source)
    }
}

impl<T: ?Sized + StackError> StackError for Arc<T> {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) { self.as_ref().debug_fmt(layer, buf) }

    fn next(&self) -> Option<&dyn StackError> { self.as_ref().next() }
}

impl<T: StackError> StackError for Box<T> {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) { self.as_ref().debug_fmt(layer, buf) }

    fn next(&self) -> Option<&dyn StackError> { self.as_ref().next() }
}

#[cfg(test)]
mod tests {
    use snafu::Snafu;

    use super::*;

    #[derive(Snafu, Debug)]
    #[snafu(display("queue rejected item"))]
    struct QueueRejected;

    impl StackError for QueueRejected {
        fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) {
            buf.push(format!("{layer}: {self}"))
        }

        fn next(&self) -> Option<&dyn StackError> { None }
    }

    impl ErrorExt for QueueRejected {
        fn status_code(&self) -> StatusCode { StatusCode::Conflict }

        fn as_any(&self) -> &dyn Any { self as _ }
    }

    #[test]
    fn status_code_maps_to_http() {
        assert_eq!(StatusCode::Conflict.http_status(), HttpStatusCode::CONFLICT);
        assert_eq!(
            StatusCode::Unavailable.http_status(),
            HttpStatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            StatusCode::Unknown.http_status(),
            HttpStatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn output_msg_uses_leaf_error() {
        let err = QueueRejected;
        assert_eq!(err.output_msg(), "queue rejected item");
    }
}
