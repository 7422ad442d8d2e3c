//! Server timestamp normalization.
//!
//! The remote service sometimes returns timestamps without an offset marker,
//! and some deployments emit server-local wall time while claiming UTC. A
//! timer that started a minute ago can then appear to have started nine hours
//! ago (or in the future). [`ClockNormalizer`] turns such a value back into a
//! trustworthy instant.
//!
//! # Rules
//!
//! 1. No offset marker → the value is read as UTC.
//! 2. `delta = parsed - now`. Within the skew threshold the literal value is
//!    trusted.
//! 3. Beyond the threshold the value is a clock/timezone defect:
//!    - [`SkewMode::Rebase`]: subtract the whole-hour offset nearest to `delta`.
//!    - [`SkewMode::ClampFuture`]: future values clamp to `now`; past values
//!      are trusted.
//!
//! Elapsed time derived from an adjusted value is never negative.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClockError;

pub const DEFAULT_SKEW_THRESHOLD_HOURS: i64 = 7;

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkewMode {
    #[default]
    Rebase,
    ClampFuture,
}

#[derive(Debug, Clone, Copy)]
pub struct ClockNormalizer {
    threshold: Duration,
    mode: SkewMode,
}

impl Default for ClockNormalizer {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_SKEW_THRESHOLD_HOURS), SkewMode::Rebase)
    }
}

impl ClockNormalizer {
    pub fn new(threshold: Duration, mode: SkewMode) -> Self {
        Self {
            threshold: threshold.abs(),
            mode,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn mode(&self) -> SkewMode {
        self.mode
    }

    /// Parses a server timestamp, treating values without an offset as UTC.
    pub fn parse(raw: &str) -> Result<DateTime<Utc>, ClockError> {
        let trimmed = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(parsed.with_timezone(&Utc));
        }
        if let Ok(parsed) = DateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f%z") {
            return Ok(parsed.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
            .map(|naive| naive.and_utc())
            .ok_or_else(|| ClockError::Unparseable(raw.to_string()))
    }

    pub fn adjust(&self, raw: &str) -> Result<DateTime<Utc>, ClockError> {
        self.adjust_at(raw, Utc::now())
    }

    pub fn adjust_at(&self, raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
        Ok(self.normalize(Self::parse(raw)?, now))
    }

    /// Applies the skew rules to an already parsed instant.
    pub fn normalize(&self, parsed: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let delta = parsed.signed_duration_since(now);
        if delta.abs() <= self.threshold {
            return parsed;
        }

        match self.mode {
            SkewMode::Rebase => {
                let hours = nearest_whole_hours(delta);
                let rebased = parsed - Duration::hours(hours);
                tracing::debug!(
                    parsed = %parsed,
                    offset_hours = hours,
                    rebased = %rebased,
                    "Rebased skewed server timestamp"
                );
                rebased
            }
            SkewMode::ClampFuture if delta > Duration::zero() => {
                tracing::debug!(parsed = %parsed, "Clamped future server timestamp");
                now
            }
            SkewMode::ClampFuture => parsed,
        }
    }

    pub fn elapsed_seconds(&self, raw: &str) -> Result<u64, ClockError> {
        self.elapsed_seconds_at(raw, Utc::now())
    }

    pub fn elapsed_seconds_at(&self, raw: &str, now: DateTime<Utc>) -> Result<u64, ClockError> {
        let adjusted = self.adjust_at(raw, now)?;
        Ok(elapsed_between(adjusted, now))
    }
}

/// Whole seconds from `start` to `now`, floored and never negative.
pub fn elapsed_between(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = now.signed_duration_since(start).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis / 1000) as u64
    }
}

fn nearest_whole_hours(delta: Duration) -> i64 {
    let secs = delta.num_seconds();
    let half_hour = 1800;
    if secs >= 0 {
        (secs + half_hour) / 3600
    } else {
        -((-secs + half_hour) / 3600)
    }
}
