use time::PrimitiveDateTime;

use crate::db::models::ExamSession;

/// Server-side countdown for one attempt. Recomputed from the stored start time on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeLeft {
    pub(crate) remaining_seconds: i64,
}

impl TimeLeft {
    pub(crate) fn expired(self) -> bool {
        self.remaining_seconds <= 0
    }
}

/// `max(0, duration * 60 - elapsed)` in whole seconds. A clock running behind the start time
/// counts as zero elapsed.
pub(crate) fn remaining_seconds(
    start_time: PrimitiveDateTime,
    duration_minutes: i32,
    now: PrimitiveDateTime,
) -> i64 {
    let allowed = i64::from(duration_minutes.max(0)) * 60;
    let elapsed = (now - start_time).whole_seconds().max(0);
    (allowed - elapsed).max(0)
}

pub(crate) fn time_left(
    session: &ExamSession,
    duration_minutes: i32,
    now: PrimitiveDateTime,
) -> TimeLeft {
    TimeLeft { remaining_seconds: remaining_seconds(session.start_time, duration_minutes, now) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    #[test]
    fn counts_down_from_the_full_duration() {
        let start = datetime!(2025-03-01 09:00:00);
        assert_eq!(remaining_seconds(start, 10, start), 600);
        assert_eq!(remaining_seconds(start, 10, start + Duration::seconds(61)), 539);
    }

    #[test]
    fn never_goes_negative() {
        let start = datetime!(2025-03-01 09:00:00);
        assert_eq!(remaining_seconds(start, 10, start + Duration::minutes(10)), 0);
        assert_eq!(remaining_seconds(start, 10, start + Duration::hours(3)), 0);
    }

    #[test]
    fn partial_seconds_do_not_count_as_elapsed() {
        let start = datetime!(2025-03-01 09:00:00);
        let now = start + Duration::milliseconds(999);
        assert_eq!(remaining_seconds(start, 1, now), 60);
    }

    #[test]
    fn clock_behind_start_keeps_full_budget() {
        let start = datetime!(2025-03-01 09:00:00);
        assert_eq!(remaining_seconds(start, 5, start - Duration::seconds(30)), 300);
    }

    #[test]
    fn expiry_starts_exactly_at_the_duration() {
        let start = datetime!(2025-03-01 09:00:00);
        let deadline = datetime!(2025-03-01 09:45:00);
        assert!(TimeLeft { remaining_seconds: remaining_seconds(start, 45, deadline) }.expired());
        let just_before = deadline - Duration::seconds(1);
        let left = TimeLeft { remaining_seconds: remaining_seconds(start, 45, just_before) };
        assert!(!left.expired());
        assert!(!TimeLeft { remaining_seconds: 1 }.expired());
    }
}
