use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OtqError, Result};

/// Piped-language duration used when a lookback cannot be converted.
pub const DEFAULT_ESQL_DURATION: &str = "1 hour";

/// Longest relative lookback accepted, in seconds (about 10,000 years).
pub const MAX_LOOKBACK_SECS: i64 = 10_000 * 366 * 86_400;

/// Ascending auto-range candidates, counted from the narrowest window out.
pub const LOOKBACK_CANDIDATES: &[&str] = &[
    "now-5m", "now-15m", "now-1h", "now-6h", "now-24h", "now-7d", "now-30d", "all",
];

/// How far back a query reaches: an ES date-math expression such as
/// `now-15m`, or no lower bound at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lookback {
    Relative(String),
    AllTime,
}

impl Lookback {
    /// Accepts `all`/`all-time`, date math (`now-1h`) or a bare amount
    /// with a unit (`15m`, `7d`).
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        match input {
            "all" | "all-time" | "alltime" => return Ok(Self::AllTime),
            "" => return Err(OtqError::Parse("empty lookback".to_string())),
            _ => {}
        }

        let amount = input.strip_prefix("now-").unwrap_or(input);
        let Some((n, unit)) = split_amount(amount) else {
            return Err(OtqError::Parse(format!(
                "invalid lookback {input}: expected e.g. 15m, 1h, 7d or all"
            )));
        };
        if amount_seconds(n, unit).is_none_or(|secs| secs > MAX_LOOKBACK_SECS) {
            return Err(OtqError::Parse(format!(
                "lookback {input} is too long; use all for no lower bound"
            )));
        }
        Ok(Self::Relative(format!("now-{amount}")))
    }

    pub fn hours(n: u32) -> Self {
        Self::Relative(format!("now-{n}h"))
    }

    pub fn is_all_time(&self) -> bool {
        matches!(self, Self::AllTime)
    }

    /// Date math for the structured query, `None` for all time.
    pub fn as_date_math(&self) -> Option<&str> {
        match self {
            Self::Relative(expr) => Some(expr),
            Self::AllTime => None,
        }
    }

    /// Interval for `NOW() - <interval>` in a piped statement, `None` for
    /// all time.
    pub fn to_esql_duration(&self) -> Option<String> {
        self.as_date_math().map(esql_duration)
    }

    /// Lower bound relative to `now`; `None` for all time or a bound
    /// outside the representable range.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (n, unit) = split_amount(self.as_date_math()?.strip_prefix("now-")?)?;
        let delta = chrono::Duration::try_seconds(amount_seconds(n, unit)?)?;
        now.checked_sub_signed(delta)
    }
}

impl fmt::Display for Lookback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relative(expr) => f.write_str(expr.strip_prefix("now-").unwrap_or(expr)),
            Self::AllTime => f.write_str("all time"),
        }
    }
}

pub fn lookback_candidates() -> Vec<Lookback> {
    LOOKBACK_CANDIDATES
        .iter()
        .filter_map(|c| Lookback::parse(c).ok())
        .collect()
}

/// Convert date math (`now-1h`) into a piped-language interval
/// (`1 hour`). Days become hours and weeks become days, matching the
/// units the query language accepts in arithmetic on `NOW()`.
pub fn esql_duration(expr: &str) -> String {
    let Some((n, unit)) = expr.strip_prefix("now-").and_then(split_amount) else {
        return DEFAULT_ESQL_DURATION.to_string();
    };
    let converted = match unit {
        's' => Some((n, "second")),
        'm' => Some((n, "minute")),
        'h' => Some((n, "hour")),
        'd' => n.checked_mul(24).map(|n| (n, "hour")),
        'w' => n.checked_mul(7).map(|n| (n, "day")),
        _ => None,
    };
    let Some((n, word)) = converted else {
        return DEFAULT_ESQL_DURATION.to_string();
    };
    if n == 1 {
        format!("1 {word}")
    } else {
        format!("{n} {word}s")
    }
}

fn amount_seconds(n: i64, unit: char) -> Option<i64> {
    let per_unit = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return None,
    };
    n.checked_mul(per_unit)
}

fn split_amount(input: &str) -> Option<(i64, char)> {
    let unit = input.chars().last()?;
    if !matches!(unit, 's' | 'm' | 'h' | 'd' | 'w') {
        return None;
    }
    let digits = &input[..input.len() - 1];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n = digits.parse::<i64>().ok()?;
    (n > 0).then_some((n, unit))
}

pub fn parse_time_or_relative(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        let delta = chrono::Duration::from_std(duration).map_err(|e| {
            OtqError::Parse(format!("failed to parse duration to chrono: {e}"))
        })?;
        return Utc::now()
            .checked_sub_signed(delta)
            .ok_or_else(|| OtqError::Parse(format!("duration {input} is too long")));
    }

    Err(OtqError::Parse(format!(
        "expected RFC3339 time or duration, got {input}"
    )))
}

/// A positive duration such as `2s` or `500ms`.
pub fn parse_duration_str(input: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(input)
        .map_err(|e| OtqError::Parse(format!("invalid duration {input}: {e}")))?;
    if duration.is_zero() {
        return Err(OtqError::Parse(format!(
            "invalid duration {input}: must be greater than zero"
        )));
    }
    Ok(duration)
}
