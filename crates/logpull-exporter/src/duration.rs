// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus-model duration syntax (`30s`, `1m`, `2h30m`, `7d`), used for
//! the `EXPORTER_LOG_PERIOD` setting and the `period` metric label.

use std::time::Duration;

const MILLIS_PER_SECOND: u128 = 1_000;
const MILLIS_PER_MINUTE: u128 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u128 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u128 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: u128 = 7 * MILLIS_PER_DAY;

const UNITS: [(&str, u128); 6] = [
    ("w", MILLIS_PER_WEEK),
    ("d", MILLIS_PER_DAY),
    ("h", MILLIS_PER_HOUR),
    ("m", MILLIS_PER_MINUTE),
    ("s", MILLIS_PER_SECOND),
    ("ms", 1),
];

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {0:?}")]
pub struct ParseDurationError(pub String);

/// Formats a duration as a sequence of unit components, largest first, with
/// zero components omitted. Sub-millisecond precision is dropped.
pub fn format_duration(duration: Duration) -> String {
    let mut millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, unit_millis) in UNITS {
        let n = millis / unit_millis;
        if n > 0 {
            out.push_str(&n.to_string());
            out.push_str(unit);
            millis -= n * unit_millis;
        }
    }
    out
}

/// Parses a sequence of `<number><unit>` components in strictly decreasing
/// unit order, e.g. `1m`, `90s`, `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let err = || ParseDurationError(input.to_string());

    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(err());
    }

    let mut total_millis: u128 = 0;
    let mut previous_unit_millis = u128::MAX;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .filter(|&end| end > 0)
            .ok_or_else(err)?;
        let (digits, tail) = rest.split_at(digits_end);
        let n: u128 = digits.parse().map_err(|_| err())?;

        // "ms" must be recognized before "m".
        let (unit_millis, tail) = if let Some(tail) = tail.strip_prefix("ms") {
            (1, tail)
        } else if let Some(tail) = tail.strip_prefix('w') {
            (MILLIS_PER_WEEK, tail)
        } else if let Some(tail) = tail.strip_prefix('d') {
            (MILLIS_PER_DAY, tail)
        } else if let Some(tail) = tail.strip_prefix('h') {
            (MILLIS_PER_HOUR, tail)
        } else if let Some(tail) = tail.strip_prefix('m') {
            (MILLIS_PER_MINUTE, tail)
        } else if let Some(tail) = tail.strip_prefix('s') {
            (MILLIS_PER_SECOND, tail)
        } else {
            return Err(err());
        };

        if unit_millis >= previous_unit_millis {
            return Err(err());
        }
        previous_unit_millis = unit_millis;

        total_millis = total_millis
            .checked_add(n.checked_mul(unit_millis).ok_or_else(err)?)
            .ok_or_else(err)?;
        rest = tail;
    }

    let total_millis = u64::try_from(total_millis).map_err(|_| err())?;
    Ok(Duration::from_millis(total_millis))
}
