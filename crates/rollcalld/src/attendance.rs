//! Attendance cooldown.
//!
//! A matched identity may be marked once per cooldown window. The window is
//! keyed either by `(name, group)` or, for compatibility with older
//! deployments that only ever stored names, by name alone.

use chrono::{DateTime, Duration, Utc};
use rollcall_core::{AttendanceEvent, IdentityKey};
use rollcall_store::{AttendanceKey, FaceStore, StoreError};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThrottleKeyMode {
    NameAndGroup,
    NameOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Throttled {
        last: DateTime<Utc>,
        next_allowed_attempt: DateTime<Utc>,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceThrottler {
    mode: ThrottleKeyMode,
    cooldown: Duration,
}

impl AttendanceThrottler {
    pub fn new(mode: ThrottleKeyMode, cooldown: Duration) -> Self {
        Self { mode, cooldown }
    }

    fn lookup<'k>(&self, key: &'k IdentityKey) -> AttendanceKey<'k> {
        match self.mode {
            ThrottleKeyMode::NameAndGroup => AttendanceKey::NameAndGroup(&key.name, &key.group),
            ThrottleKeyMode::NameOnly => AttendanceKey::Name(&key.name),
        }
    }

    /// Decide whether `key` may be marked at `now`, without recording anything.
    pub fn check(
        &self,
        store: &dyn FaceStore,
        key: &IdentityKey,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let Some(last) = store.latest_attendance(self.lookup(key))? else {
            return Ok(Decision::Allowed);
        };
        Ok(self.decide(last.timestamp, now))
    }

    /// Append an event stamped `now` unless `key` is inside its cooldown.
    ///
    /// The check and the append are one store operation, so concurrent marks
    /// of one identity record at most one event per window.
    pub fn admit(
        &self,
        store: &dyn FaceStore,
        key: &IdentityKey,
        attended: bool,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let event = AttendanceEvent {
            name: key.name.clone(),
            group: key.group.clone(),
            timestamp: now,
            attended,
        };
        match store.append_attendance_if_clear(&event, self.lookup(key), self.cooldown)? {
            None => {
                tracing::info!(identity = %key, attended, "attendance recorded");
                Ok(Decision::Allowed)
            }
            Some(last) => {
                tracing::debug!(identity = %key, "attendance throttled");
                Ok(self.decide(last.timestamp, now))
            }
        }
    }

    fn decide(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> Decision {
        if now - last < self.cooldown {
            Decision::Throttled {
                last,
                next_allowed_attempt: last + self.cooldown,
            }
        } else {
            Decision::Allowed
        }
    }
}
