//! Time-gated scheduling of etcd backup requests
//!
//! The backup resource model is "one request object represents one completed
//! or in-flight attempt", not a queue. Re-issuing a backup therefore means
//! deleting the stale request and creating a fresh one; the platform
//! garbage-collects the corresponding artifact separately.

use chrono::{DateTime, Duration, Utc};

use super::probes::BackupState;
use crate::BACKUP_INTERVAL;

/// What the scheduler decided to do with the backup request this pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupDecision {
    /// A request exists and is younger than the minimum interval; leave it
    NotDue,
    /// A request exists but the interval has elapsed; delete it and issue a
    /// fresh one
    Rotate,
    /// No request exists; issue one
    Create,
}

/// Decide whether a backup is due, given the observed request state
pub fn decision(state: Option<&BackupState>, now: DateTime<Utc>) -> BackupDecision {
    let Some(state) = state else {
        return BackupDecision::Create;
    };
    match state.created_at {
        // A request the API server never stamped cannot be age-gated; replace it.
        None => BackupDecision::Rotate,
        Some(created_at) => {
            let age = now.signed_duration_since(created_at);
            if age < Duration::seconds(BACKUP_INTERVAL.as_secs() as i64) {
                BackupDecision::NotDue
            } else {
                BackupDecision::Rotate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(age_secs: i64, succeeded: bool) -> BackupState {
        BackupState {
            created_at: Some(Utc::now() - Duration::seconds(age_secs)),
            succeeded,
        }
    }

    /// No request on record means one is due immediately.
    #[test]
    fn absent_request_is_created() {
        assert_eq!(decision(None, Utc::now()), BackupDecision::Create);
    }

    /// A request younger than the interval is left alone regardless of
    /// whether it already succeeded.
    #[test]
    fn young_request_is_not_due() {
        let now = Utc::now();
        assert_eq!(
            decision(Some(&state(60, false)), now),
            BackupDecision::NotDue
        );
        assert_eq!(
            decision(Some(&state(60, true)), now),
            BackupDecision::NotDue
        );
    }

    /// Once the interval has elapsed the stale request is rotated out.
    #[test]
    fn stale_request_is_rotated() {
        let now = Utc::now();
        assert_eq!(
            decision(Some(&state(6 * 60, true)), now),
            BackupDecision::Rotate
        );
        // Exactly at the interval counts as elapsed
        assert_eq!(
            decision(Some(&state(5 * 60, false)), now),
            BackupDecision::Rotate
        );
    }

    /// A request without a creation timestamp cannot be age-gated and gets
    /// replaced.
    #[test]
    fn unstamped_request_is_rotated() {
        let unstamped = BackupState {
            created_at: None,
            succeeded: false,
        };
        assert_eq!(
            decision(Some(&unstamped), Utc::now()),
            BackupDecision::Rotate
        );
    }
}
