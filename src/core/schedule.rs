//! Schedule parsing and next occurrence calculation.
//!
//! Supports standard cron expressions, extended 6-field cron (with seconds),
//! shortcuts (@daily, @hourly, etc.), and interval expressions (@every).
//! Also home of the duration parser shared with configuration loading.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// A schedule for job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// The original expression string.
    expression: String,
    /// The timezone for this schedule.
    timezone: String,
    /// Parsed schedule type.
    #[serde(skip)]
    schedule_type: ScheduleType,
}

#[derive(Debug, Clone, Default)]
enum ScheduleType {
    /// Standard cron schedule.
    Cron(Box<CronSchedule>),
    /// Interval-based schedule (e.g., @every 5m).
    Interval(std::time::Duration),
    /// Not yet parsed.
    #[default]
    Unparsed,
}

impl Schedule {
    /// Create a new schedule from a cron expression.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    /// - Intervals: `@every 5m`, `@every 1h30m`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Create a fixed-interval schedule.
    ///
    /// Sub-second intervals are rounded up to whole milliseconds.
    pub fn every(interval: Duration) -> Result<Self, ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::InvalidInterval("0s".into()));
        }
        Self::new(format!("@every {}", format_duration(interval)))
    }

    /// Create a new schedule with a specific timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone = timezone.into();

        // Validate timezone
        timezone
            .parse::<Tz>()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.clone()))?;

        let schedule_type = Self::parse_expression(&expression)?;

        Ok(Self {
            expression,
            timezone,
            schedule_type,
        })
    }

    /// Parse the expression into a schedule type.
    fn parse_expression(expression: &str) -> Result<ScheduleType, ScheduleError> {
        let trimmed = expression.trim();

        // Handle shortcuts
        if trimmed.starts_with('@') {
            return Self::parse_shortcut(trimmed);
        }

        // Try to parse as cron expression
        Self::parse_cron(trimmed)
    }

    /// Parse a shortcut expression (@daily, @every, etc.).
    fn parse_shortcut(expression: &str) -> Result<ScheduleType, ScheduleError> {
        match expression.to_lowercase().as_str() {
            "@yearly" | "@annually" => Self::parse_cron("0 0 1 1 *"),
            "@monthly" => Self::parse_cron("0 0 1 * *"),
            "@weekly" => Self::parse_cron("0 0 * * SUN"),
            "@daily" | "@midnight" => Self::parse_cron("0 0 * * *"),
            "@hourly" => Self::parse_cron("0 * * * *"),
            s if s.starts_with("@every ") => Self::parse_interval(&s[7..]),
            _ => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        }
    }

    /// Parse an interval expression (e.g., "5m", "1h30m").
    fn parse_interval(interval: &str) -> Result<ScheduleType, ScheduleError> {
        let duration = parse_duration(interval.trim())?;
        Ok(ScheduleType::Interval(duration))
    }

    /// Parse a cron expression.
    fn parse_cron(expression: &str) -> Result<ScheduleType, ScheduleError> {
        // Count fields to determine if it's 5-field or 6-field cron
        let fields: Vec<&str> = expression.split_whitespace().collect();

        let cron_expr = match fields.len() {
            5 => {
                // Standard 5-field cron, add seconds field
                format!("0 {}", expression)
            }
            6 => {
                // Extended 6-field cron with seconds
                expression.to_string()
            }
            _ => {
                return Err(ScheduleError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {}",
                    fields.len()
                )));
            }
        };

        let schedule = CronSchedule::from_str(&cron_expr)
            .map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;

        Ok(ScheduleType::Cron(Box::new(schedule)))
    }

    /// Get the next occurrence after the given time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let tz: Tz = self
            .timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(self.timezone.clone()))?;

        match &self.schedule_type {
            ScheduleType::Cron(schedule) => {
                // Convert to timezone, find next, convert back to UTC
                let local_time = after.with_timezone(&tz);
                schedule
                    .after(&local_time)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok_or(ScheduleError::NoMoreOccurrences)
            }
            ScheduleType::Interval(duration) => {
                // For intervals, just add the duration
                Ok(after + to_chrono(*duration)?)
            }
            ScheduleType::Unparsed => Err(ScheduleError::InvalidCron("schedule not parsed".into())),
        }
    }

    /// Get the next occurrence from now.
    pub fn next(&self) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
    }

    /// Get the next N occurrences after the given time.
    pub fn next_n_after(
        &self,
        after: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let tz: Tz = self
            .timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(self.timezone.clone()))?;

        match &self.schedule_type {
            ScheduleType::Cron(schedule) => {
                let local_time = after.with_timezone(&tz);
                Ok(schedule
                    .after(&local_time)
                    .take(n)
                    .map(|dt| dt.with_timezone(&Utc))
                    .collect())
            }
            ScheduleType::Interval(duration) => {
                let chrono_duration = to_chrono(*duration)?;
                let mut results = Vec::with_capacity(n);
                let mut current = after;
                for _ in 0..n {
                    current += chrono_duration;
                    results.push(current);
                }
                Ok(results)
            }
            ScheduleType::Unparsed => Err(ScheduleError::InvalidCron("schedule not parsed".into())),
        }
    }

    /// Get the next N occurrences from now.
    pub fn next_n(&self, n: usize) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        self.next_n_after(Utc::now(), n)
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Get the timezone.
    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    /// The fixed interval, if this is an `@every` schedule.
    pub fn interval(&self) -> Option<Duration> {
        match &self.schedule_type {
            ScheduleType::Interval(duration) => Some(*duration),
            _ => None,
        }
    }

    /// Re-parse after deserialization.
    pub fn reparse(self) -> Result<Self, ScheduleError> {
        Self::with_timezone(self.expression, self.timezone)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, ScheduleError> {
    chrono::Duration::from_std(duration)
        .map_err(|_| ScheduleError::InvalidInterval(format!("{:?}", duration)))
}

/// Parse a duration string like "500ms", "5m", "1h", "1h30m", "30s", "2d".
pub fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(s.to_string());
    let mut total = Duration::ZERO;
    let mut current_num = String::new();
    let mut chars = s.trim().chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }

        let num: u64 = current_num.parse().map_err(|_| invalid())?;
        current_num.clear();

        let unit = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(num)
            }
            's' => Duration::from_secs(num),
            'm' => Duration::from_secs(num.saturating_mul(60)),
            'h' => Duration::from_secs(num.saturating_mul(3600)),
            'd' => Duration::from_secs(num.saturating_mul(86400)),
            _ => return Err(invalid()),
        };
        total = total.saturating_add(unit);
    }

    // Trailing digits without a unit
    if !current_num.is_empty() || total.is_zero() {
        return Err(invalid());
    }

    Ok(total)
}

/// Format a duration in the syntax accepted by [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 || millis == 0 {
        return format!("{}ms", millis.max(1));
    }
    let mut secs = duration.as_secs();
    let mut out = String::new();
    for (unit, size) in [("d", 86400), ("h", 3600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    out
}

// Custom deserialization to re-parse the schedule after loading
impl<'de> Deserialize<'de> for ScheduleType {
    fn deserialize<D>(_deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Always deserialize as Unparsed; the Schedule will re-parse
        Ok(ScheduleType::Unparsed)
    }
}

impl Serialize for ScheduleType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Serialize as unit (nothing)
        serializer.serialize_unit()
    }
}
