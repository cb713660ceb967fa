//! Cron-like schedule expressions for registered pipelines.
//!
//! Supported forms:
//! - `@every <duration>` with `s`/`m`/`h` units, e.g. `@every 30s`
//! - `@hourly`, `@daily`
//! - a five-field cron subset where the day fields are `*` and the
//!   minute/hour fields are `*`, `*/n`, or a fixed value
//!
//! Invalid expressions are rejected at registration time.

use crate::errors::EtlError;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use std::time::Duration;

/// A parsed schedule, keeping the original expression for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    expression: String,
    kind: ScheduleKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScheduleKind {
    Every(Duration),
    Cron { minute: CronField, hour: CronField },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CronField {
    Any,
    Step(u32),
    At(u32),
}

impl CronField {
    fn matches(self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Step(step) => value % step == 0,
            Self::At(at) => value == at,
        }
    }

    fn parse(raw: &str, max: u32) -> Option<Self> {
        if raw == "*" {
            return Some(Self::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            let step: u32 = step.parse().ok()?;
            return (step > 0 && step <= max).then_some(Self::Step(step));
        }
        let at: u32 = raw.parse().ok()?;
        (at <= max).then_some(Self::At(at))
    }
}

impl Schedule {
    /// Parses a schedule expression.
    pub fn parse(expression: &str) -> Result<Self, EtlError> {
        let trimmed = expression.trim();
        let kind = Self::parse_kind(trimmed).ok_or_else(|| {
            EtlError::InvalidDefinition(format!("unrecognized schedule expression '{trimmed}'"))
        })?;
        Ok(Self {
            expression: trimmed.to_string(),
            kind,
        })
    }

    fn parse_kind(expr: &str) -> Option<ScheduleKind> {
        match expr {
            "@hourly" => return Some(ScheduleKind::Every(Duration::from_secs(60 * 60))),
            "@daily" => return Some(ScheduleKind::Every(Duration::from_secs(24 * 60 * 60))),
            _ => {}
        }

        if let Some(rest) = expr.strip_prefix("@every ") {
            return parse_duration(rest.trim()).map(ScheduleKind::Every);
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        // The day-of-month, month, and day-of-week fields are not
        // supported beyond "*".
        if fields[2] != "*" || fields[3] != "*" || fields[4] != "*" {
            return None;
        }
        let minute = CronField::parse(fields[0], 59)?;
        let hour = CronField::parse(fields[1], 23)?;
        Some(ScheduleKind::Cron { minute, hour })
    }

    /// The original expression.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match &self.kind {
            ScheduleKind::Every(interval) => {
                let interval = ChronoDuration::from_std(*interval)
                    .unwrap_or_else(|_| ChronoDuration::seconds(60));
                after + interval
            }
            ScheduleKind::Cron { minute, hour } => {
                let mut candidate = after
                    .duration_trunc(ChronoDuration::minutes(1))
                    .unwrap_or(after)
                    + ChronoDuration::minutes(1);
                // Day fields are always "*", so a match is guaranteed
                // within 24 hours.
                for _ in 0..(24 * 60 + 1) {
                    if minute.matches(candidate.minute()) && hour.matches(candidate.hour()) {
                        return candidate;
                    }
                    candidate += ChronoDuration::minutes(1);
                }
                candidate
            }
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

fn parse_duration(raw: &str) -> Option<Duration> {
    let unit = raw.chars().last()?;
    let value: u64 = raw.get(..raw.len() - 1)?.parse().ok()?;
    if value == 0 {
        return None;
    }
    match unit {
        's' => Some(Duration::from_secs(value)),
        'm' => Some(Duration::from_secs(value * 60)),
        'h' => Some(Duration::from_secs(value * 60 * 60)),
        _ => None,
    }
}
