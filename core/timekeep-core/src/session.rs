//! The running time entry shown in the UI.
//!
//! The timer starts counting from the moment the user clicks start, before
//! the server has answered. When the server's start time arrives it replaces
//! the local one only if the two agree within the confirmation tolerance;
//! otherwise the local start stays the display basis until the session ends,
//! so the visible timer never jumps.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::{elapsed_between, ClockNormalizer};
use crate::error::ClockError;
use crate::models::TimeEntry;

pub const DEFAULT_CONFIRM_TOLERANCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBasis {
    /// Local click time; used until (and unless) the server agrees.
    Optimistic,
    Server,
}

#[derive(Debug, Clone)]
pub struct ActiveSession {
    id: Option<String>,
    local_start: DateTime<Utc>,
    server_start: Option<DateTime<Utc>>,
    basis: StartBasis,
    confirmed: bool,
    is_active: bool,
    duration: Option<u64>,
    tolerance: chrono::Duration,
    clock: ClockNormalizer,
}

impl ActiveSession {
    /// Starts an optimistic session at `local_start`.
    pub fn begin(local_start: DateTime<Utc>, clock: ClockNormalizer, tolerance: Duration) -> Self {
        Self {
            id: None,
            local_start,
            server_start: None,
            basis: StartBasis::Optimistic,
            confirmed: false,
            is_active: true,
            duration: None,
            tolerance: chrono::Duration::from_std(tolerance)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            clock,
        }
    }

    /// Rebuilds a session the server already knows about (e.g. after a
    /// restart). The server start is the basis from the outset.
    pub fn resume(
        entry: &TimeEntry,
        clock: ClockNormalizer,
        tolerance: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, ClockError> {
        let raw = entry
            .start_time
            .as_deref()
            .ok_or_else(|| ClockError::Unparseable(String::new()))?;
        let start = clock.adjust_at(raw, now)?;
        let mut session = Self::begin(start, clock, tolerance);
        session.id = Some(entry.id.clone());
        session.server_start = Some(start);
        session.basis = StartBasis::Server;
        session.confirmed = true;
        session.is_active = entry.is_active || entry.end_time.is_none();
        if !session.is_active {
            session.duration = entry.duration;
        }
        Ok(session)
    }

    /// Records the server's start for this session and decides the display
    /// basis. Only the first confirmation counts.
    pub fn confirm_start(
        &mut self,
        id: impl Into<String>,
        raw_server_start: &str,
        now: DateTime<Utc>,
    ) -> Result<StartBasis, ClockError> {
        if self.confirmed {
            return Ok(self.basis);
        }
        let server_start = self.clock.adjust_at(raw_server_start, now)?;
        self.id = Some(id.into());
        self.server_start = Some(server_start);
        self.confirmed = true;

        let drift = server_start.signed_duration_since(self.local_start).abs();
        if drift <= self.tolerance {
            self.basis = StartBasis::Server;
            debug!(drift_ms = drift.num_milliseconds(), "Adopted server start time");
        } else {
            warn!(
                drift_secs = drift.num_seconds(),
                "Server start disagrees with local start; keeping local basis"
            );
        }
        Ok(self.basis)
    }

    /// [`confirm_start`](Self::confirm_start) from the entry returned by the
    /// start endpoint.
    pub fn confirm_entry(
        &mut self,
        entry: &TimeEntry,
        now: DateTime<Utc>,
    ) -> Result<StartBasis, ClockError> {
        let raw = entry
            .start_time
            .as_deref()
            .ok_or_else(|| ClockError::Unparseable(String::new()))?;
        self.confirm_start(entry.id.clone(), raw, now)
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn basis(&self) -> StartBasis {
        self.basis
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn local_start(&self) -> DateTime<Utc> {
        self.local_start
    }

    pub fn server_start(&self) -> Option<DateTime<Utc>> {
        self.server_start
    }

    pub fn display_start(&self) -> DateTime<Utc> {
        match (self.basis, self.server_start) {
            (StartBasis::Server, Some(start)) => start,
            _ => self.local_start,
        }
    }

    pub fn elapsed_seconds_at(&self, now: DateTime<Utc>) -> u64 {
        match self.duration {
            Some(duration) if !self.is_active => duration,
            _ => elapsed_between(self.display_start(), now),
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds_at(Utc::now())
    }

    /// Freezes the displayed duration when the user stops the timer.
    pub fn stop_requested(&mut self, now: DateTime<Utc>) -> u64 {
        let duration = self.elapsed_seconds_at(now);
        self.duration = Some(duration);
        self.is_active = false;
        duration
    }

    /// The server acknowledged the stop. Its duration wins when present.
    pub fn stop_confirmed(&mut self, server_duration: Option<u64>, now: DateTime<Utc>) -> u64 {
        let duration = match (server_duration, self.duration) {
            (Some(server), _) => server,
            (None, Some(local)) => local,
            (None, None) => self.elapsed_seconds_at(now),
        };
        self.duration = Some(duration);
        self.is_active = false;
        duration
    }

    pub fn duration(&self) -> Option<u64> {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, SecondsFormat};

    fn rfc3339(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    #[test]
    fn server_start_within_tolerance_is_adopted() {
        let now = Utc::now();
        let local = now - ChronoDuration::seconds(10);
        let mut session =
            ActiveSession::begin(local, ClockNormalizer::default(), DEFAULT_CONFIRM_TOLERANCE);
        assert_eq!(session.basis(), StartBasis::Optimistic);

        let server = local + ChronoDuration::seconds(2);
        let basis = session
            .confirm_start("e1", &rfc3339(server), now)
            .expect("confirm");
        assert_eq!(basis, StartBasis::Server);
        assert_eq!(session.display_start().timestamp(), server.timestamp());
        assert_eq!(session.id(), Some("e1"));
    }

    #[test]
    fn disagreeing_server_start_keeps_local_basis_for_life() {
        let now = Utc::now();
        let local = now - ChronoDuration::seconds(10);
        let mut session =
            ActiveSession::begin(local, ClockNormalizer::default(), DEFAULT_CONFIRM_TOLERANCE);

        let far = local - ChronoDuration::minutes(3);
        assert_eq!(
            session.confirm_start("e1", &rfc3339(far), now).expect("confirm"),
            StartBasis::Optimistic
        );
        // A later, agreeing confirmation does not switch the basis.
        assert_eq!(
            session.confirm_start("e1", &rfc3339(local), now).expect("confirm"),
            StartBasis::Optimistic
        );
        assert_eq!(session.display_start(), local);
    }

    #[test]
    fn skewed_server_start_is_normalized_before_comparison() {
        let now = Utc::now();
        let local = now - ChronoDuration::seconds(4);
        let mut session =
            ActiveSession::begin(local, ClockNormalizer::default(), DEFAULT_CONFIRM_TOLERANCE);

        // Server wrote its local wall-clock (UTC-9) without an offset marker.
        let skewed = (local - ChronoDuration::hours(9))
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let basis = session.confirm_start("e1", &skewed, now).expect("confirm");
        assert_eq!(basis, StartBasis::Server);
        assert!(session.elapsed_seconds_at(now) <= 6);
    }

    #[test]
    fn stop_freezes_duration() {
        let start = Utc::now() - ChronoDuration::seconds(90);
        let mut session =
            ActiveSession::begin(start, ClockNormalizer::default(), DEFAULT_CONFIRM_TOLERANCE);
        let stopped_at = start + ChronoDuration::seconds(60);
        assert_eq!(session.stop_requested(stopped_at), 60);
        assert!(!session.is_active());
        assert_eq!(session.elapsed_seconds_at(stopped_at + ChronoDuration::hours(1)), 60);
        assert_eq!(session.stop_confirmed(Some(61), stopped_at), 61);
    }

    #[test]
    fn elapsed_is_never_negative_for_future_start() {
        let now = Utc::now();
        let session = ActiveSession::begin(
            now + ChronoDuration::seconds(30),
            ClockNormalizer::default(),
            DEFAULT_CONFIRM_TOLERANCE,
        );
        assert_eq!(session.elapsed_seconds_at(now), 0);
    }

    #[test]
    fn resume_uses_server_basis() {
        let now = Utc::now();
        let entry: TimeEntry = serde_json::from_value(serde_json::json!({
            "id": 12,
            "start_time": rfc3339(now - ChronoDuration::minutes(5)),
            "is_active": true
        }))
        .expect("entry");
        let session = ActiveSession::resume(
            &entry,
            ClockNormalizer::default(),
            DEFAULT_CONFIRM_TOLERANCE,
            now,
        )
        .expect("resume");
        assert_eq!(session.basis(), StartBasis::Server);
        assert_eq!(session.elapsed_seconds_at(now), 300);
    }
}
