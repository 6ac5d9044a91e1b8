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

//! Freeze-window evaluation.
//!
//! A freeze window is a cron expression read as the inclusive set of minutes
//! it matches. A build that arrives inside a window is deferred to the first
//! minute outside all of them.

use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Utc};
use snafu::ensure;
use tracing::warn;

use crate::error::{MalformedCronSnafu, Result};

/// Upper bound on the forward scan. A window set that never opens within
/// this horizon returns the reference instant instead of spinning.
const MAX_SCAN_MINUTES: i64 = 35 * 24 * 60;

/// First instant at or after `from` that lies outside every window.
///
/// Returns `from` unchanged when it is already outside all windows;
/// otherwise the result is aligned to the minute the windows reopen.
/// Deterministic in `from`: the current wall clock is never consulted.
pub fn time_out_of_windows(windows: &[String], from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let crons = windows
        .iter()
        .map(|w| {
            ensure!(
                w.split_whitespace().count() == 5,
                MalformedCronSnafu { expr: w.clone() }
            );
            croner::Cron::from_str(w).map_err(|_| MalformedCronSnafu { expr: w.clone() }.build())
        })
        .collect::<Result<Vec<_>>>()?;

    if !in_any_window(&crons, from) {
        return Ok(from);
    }

    let mut t = from
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(from);
    for _ in 0..MAX_SCAN_MINUTES {
        t += Duration::minutes(1);
        if !in_any_window(&crons, t) {
            return Ok(t);
        }
    }

    warn!(
        windows = ?windows,
        from = %from,
        "Freeze windows never reopen within the scan horizon"
    );
    Ok(from)
}

fn in_any_window(crons: &[croner::Cron], t: DateTime<Utc>) -> bool {
    crons
        .iter()
        .any(|cron| cron.is_time_matching(&t).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::error::Error;

    #[test]
    fn outside_all_windows_returns_input_unchanged() {
        // 10:37 is not minute 5
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 37, 21).unwrap();
        let out = time_out_of_windows(&["5 * * * *".to_string()], t).unwrap();
        assert_eq!(out, t);
    }

    #[test]
    fn no_windows_returns_input() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 37, 0).unwrap();
        assert_eq!(time_out_of_windows(&[], t).unwrap(), t);
    }

    #[test]
    fn inside_window_advances_to_first_open_minute() {
        // Frozen during minutes 0-30 of every hour; entering at 10:07
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 15).unwrap();
        let out = time_out_of_windows(&["0-30 * * * *".to_string()], t).unwrap();
        assert_eq!(out, Utc.with_ymd_and_hms(2024, 1, 1, 10, 31, 0).unwrap());
    }

    #[test]
    fn overlapping_windows_are_a_union() {
        // 0-30 and 25-45 together freeze 0-45
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 29, 0).unwrap();
        let windows = vec!["0-30 * * * *".to_string(), "25-45 * * * *".to_string()];
        let out = time_out_of_windows(&windows, t).unwrap();
        assert_eq!(out, Utc.with_ymd_and_hms(2024, 1, 1, 10, 46, 0).unwrap());
    }

    #[test]
    fn hour_long_window_reopens_next_hour() {
        // All of hour 10 frozen
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 59, 30).unwrap();
        let out = time_out_of_windows(&["* 10 * * *".to_string()], t).unwrap();
        assert_eq!(out, Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn always_matching_window_hits_the_scan_cap() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let out = time_out_of_windows(&["* * * * *".to_string()], t).unwrap();
        assert_eq!(out, t);
    }

    #[test]
    fn malformed_window_is_rejected() {
        let t = Utc::now();
        let err = time_out_of_windows(&["* * *".to_string()], t).unwrap_err();
        assert!(matches!(err, Error::MalformedCron { .. }));
    }
}
