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

//! Hashed cron expressions.
//!
//! Periodic-build crons support the `H` placeholder, which spreads load by
//! resolving to a value derived from the job id rather than a fixed number.
//! `H * * * *` with 10k jobs fires spread across the hour instead of a
//! thundering herd at minute 0.
//!
//! Supported forms per field: `H`, `H/step`, `H(lo-hi)`, `H(lo-hi)/step`.
//! The resolved value is `crc32(jobId) % (hi - lo + 1) + lo`, which is
//! stable across processes and releases.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use snafu::{IntoError, ensure};

use crate::error::{
    InvalidRangeSnafu, MalformedCronSnafu, NoNextOccurrenceSnafu, Result,
};

/// Per-position `(name, lo, hi)` defaults. Day-of-month caps at 28 so hashed
/// values fire in every month.
const FIELD_RANGES: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 28),
    ("month", 1, 12),
    ("day-of-week", 0, 6),
];

/// Replace every `H` placeholder in a 5-field cron expression.
///
/// Deterministic in `(expr, job_id)`: re-running produces byte-identical
/// output. Fields without a leading `H` pass through untouched.
pub fn transform(expr: &str, job_id: u64) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    ensure!(fields.len() == 5, MalformedCronSnafu { expr });

    let hash = crc32fast::hash(job_id.to_string().as_bytes());
    let transformed = fields
        .iter()
        .zip(FIELD_RANGES)
        .map(|(field, (name, min, max))| transform_field(field, name, min, max, hash))
        .collect::<Result<Vec<_>>>()?;
    Ok(transformed.join(" "))
}

fn transform_field(field: &str, name: &'static str, min: u32, max: u32, hash: u32) -> Result<String> {
    // Only a leading `H` is a placeholder; values like `THU` pass through.
    let Some(rest) = field.strip_prefix('H') else {
        return Ok(field.to_string());
    };
    if !rest.is_empty() && !rest.starts_with('/') && !rest.starts_with('(') {
        return Ok(field.to_string());
    }

    let (lo, hi, suffix) = if let Some(inner) = rest.strip_prefix('(') {
        let Some((range, suffix)) = inner.split_once(')') else {
            return MalformedCronSnafu {
                expr: field.to_string(),
            }
            .fail();
        };
        let Some((lo, hi)) = range.split_once('-') else {
            return MalformedCronSnafu {
                expr: field.to_string(),
            }
            .fail();
        };
        let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) else {
            return MalformedCronSnafu {
                expr: field.to_string(),
            }
            .fail();
        };
        ensure!(
            lo >= min && hi <= max && lo <= hi,
            InvalidRangeSnafu {
                field: name,
                lo,
                hi,
                min,
                max
            }
        );
        (lo, hi, suffix)
    } else {
        (min, max, rest)
    };

    let value = hash % (hi - lo + 1) + lo;
    Ok(format!("{value}{suffix}"))
}

/// Earliest UTC instant strictly after `after` at which `expr` fires.
///
/// `expr` must already be transformed (no `H` placeholders left).
pub fn next(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    ensure!(fields.len() == 5, MalformedCronSnafu { expr });

    let cron = croner::Cron::from_str(expr)
        .map_err(|_| MalformedCronSnafu { expr }.build())?;
    cron.find_next_occurrence(&after, false).map_err(|source| {
        NoNextOccurrenceSnafu {
            expr: expr.to_string(),
        }
        .into_error(source)
    })
}
