//! Schedule expressions for agent wakes.
//!
//! An expression is either a cron pattern (5-field standard, or 6/7-field
//! with a seconds and optional years column) or a fixed-interval duration
//! literal (`15m`, `1h30m`, `500ms`). Parsing tries cron first, then the
//! duration form.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crewd_domain::Error;

/// A parsed schedule: computes the next wake instant after a given time.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Cron-driven: wakes at the expression's firing times.
    Cron {
        expr: String,
        inner: cron::Schedule,
    },
    /// Interval-driven: wakes `interval` after any reference instant.
    Every { expr: String, interval: Duration },
}

impl Schedule {
    /// Parse a schedule expression.
    ///
    /// Order: (1) cron — a 5-field expression is normalized by prepending a
    /// seconds column of `0`; (2) a `humantime` duration literal. Empty and
    /// unparsable input fail with `invalid_schedule`.
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidSchedule("empty expression".into()));
        }

        if let Some(inner) = parse_cron(trimmed) {
            return Ok(Schedule::Cron {
                expr: trimmed.to_string(),
                inner,
            });
        }

        match humantime::parse_duration(trimmed) {
            Ok(interval) if !interval.is_zero() => Ok(Schedule::Every {
                expr: trimmed.to_string(),
                interval,
            }),
            Ok(_) => Err(Error::InvalidSchedule(format!(
                "zero-length interval '{trimmed}'"
            ))),
            Err(_) => Err(Error::InvalidSchedule(format!(
                "'{trimmed}' is neither a cron expression nor a duration"
            ))),
        }
    }

    /// The next wake strictly after `from`.
    ///
    /// `None` only for cron expressions that never fire again (possible
    /// with an exhausted years column).
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { inner, .. } => inner.after(&from).next(),
            Schedule::Every { interval, .. } => {
                from.checked_add_signed(chrono::Duration::from_std(*interval).ok()?)
            }
        }
    }

    /// The original expression text.
    pub fn expression(&self) -> &str {
        match self {
            Schedule::Cron { expr, .. } => expr,
            Schedule::Every { expr, .. } => expr,
        }
    }
}

/// Try the expression as cron, normalizing the 5-field standard form to
/// the 6-field with-seconds form the parser expects.
fn parse_cron(expr: &str) -> Option<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let candidate = match fields {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        _ => return None,
    };
    cron::Schedule::from_str(&candidate).ok()
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.expression())
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

impl serde::Serialize for Schedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expression())
    }
}

impl<'de> serde::Deserialize<'de> for Schedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        Schedule::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
