use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::models::TicketStatus;

/// Longest configurable window: ten years.
pub const MAX_RETENTION_MINUTES: i64 = 10 * 365 * 24 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("retention window for {status} tickets must be 0..={max} minutes, got {minutes}", max = MAX_RETENTION_MINUTES)]
pub struct RetentionError {
    pub status: TicketStatus,
    pub minutes: i64,
}

/// How long terminal tickets stay on the active display feed.
///
/// Nothing is deleted: tickets outside the window are only filtered out of
/// the feed at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub cancelled: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Duration::hours(2),
            cancelled: Duration::minutes(5),
        }
    }
}

impl RetentionPolicy {
    pub fn from_minutes(completed_minutes: i64, cancelled_minutes: i64) -> Result<Self, RetentionError> {
        Ok(Self {
            completed: window(TicketStatus::Completed, completed_minutes)?,
            cancelled: window(TicketStatus::Cancelled, cancelled_minutes)?,
        })
    }

    /// Completed tickets last updated before this instant are hidden.
    pub fn completed_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.completed)
    }

    /// Cancelled tickets last updated before this instant are hidden.
    pub fn cancelled_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.cancelled)
    }

    pub fn is_visible(&self, status: TicketStatus, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match status {
            TicketStatus::Completed => updated_at >= self.completed_cutoff(now),
            TicketStatus::Cancelled => updated_at >= self.cancelled_cutoff(now),
            TicketStatus::New | TicketStatus::InProgress | TicketStatus::Recalled => true,
        }
    }
}

fn window(status: TicketStatus, minutes: i64) -> Result<Duration, RetentionError> {
    if !(0..=MAX_RETENTION_MINUTES).contains(&minutes) {
        return Err(RetentionError { status, minutes });
    }
    Duration::try_minutes(minutes).ok_or(RetentionError { status, minutes })
}

/// A window reaching past the earliest representable instant hides nothing.
fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ago(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
        now - d
    }

    #[test]
    fn test_completed_window_is_two_hours() {
        let policy = RetentionPolicy::default();
        let now = Utc::now();
        let stale = ago(now, Duration::hours(2) + Duration::minutes(1));
        let fresh = ago(now, Duration::hours(1) + Duration::minutes(59));
        assert!(!policy.is_visible(TicketStatus::Completed, stale, now));
        assert!(policy.is_visible(TicketStatus::Completed, fresh, now));
    }

    #[test]
    fn test_cancelled_window_is_five_minutes() {
        let policy = RetentionPolicy::default();
        let now = Utc::now();
        let stale = ago(now, Duration::minutes(5) + Duration::seconds(1));
        let fresh = ago(now, Duration::minutes(4) + Duration::seconds(59));
        assert!(!policy.is_visible(TicketStatus::Cancelled, stale, now));
        assert!(policy.is_visible(TicketStatus::Cancelled, fresh, now));
    }

    #[test]
    fn test_exact_boundary_is_still_visible() {
        let policy = RetentionPolicy::default();
        let now = Utc::now();
        assert!(policy.is_visible(TicketStatus::Completed, ago(now, Duration::hours(2)), now));
    }

    #[test]
    fn test_open_tickets_are_always_visible() {
        let policy = RetentionPolicy::default();
        let now = Utc::now();
        let ancient = ago(now, Duration::days(30));
        for status in [TicketStatus::New, TicketStatus::InProgress, TicketStatus::Recalled] {
            assert!(policy.is_visible(status, ancient, now));
        }
    }

    #[test]
    fn test_from_minutes() {
        let policy = RetentionPolicy::from_minutes(30, 1).unwrap();
        assert_eq!(policy.completed, Duration::minutes(30));
        assert_eq!(policy.cancelled, Duration::minutes(1));
        assert!(RetentionPolicy::from_minutes(0, MAX_RETENTION_MINUTES).is_ok());
    }

    #[test]
    fn test_out_of_range_windows_are_errors() {
        assert_eq!(
            RetentionPolicy::from_minutes(i64::MAX, 5),
            Err(RetentionError {
                status: TicketStatus::Completed,
                minutes: i64::MAX
            })
        );
        assert_eq!(
            RetentionPolicy::from_minutes(120, -1),
            Err(RetentionError {
                status: TicketStatus::Cancelled,
                minutes: -1
            })
        );
        let err = RetentionPolicy::from_minutes(MAX_RETENTION_MINUTES + 1, 5).unwrap_err();
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_cutoff_saturates_instead_of_overflowing() {
        let policy = RetentionPolicy {
            completed: Duration::MAX,
            cancelled: Duration::minutes(5),
        };
        let now = Utc::now();
        assert_eq!(policy.completed_cutoff(now), DateTime::<Utc>::MIN_UTC);
        assert!(policy.is_visible(TicketStatus::Completed, now - Duration::days(3650), now));
    }
}
