//! Browser-side view of the exam clock and answer autosave.
//!
//! Nothing here is authoritative. The countdown ticks locally for display and is overwritten by
//! every server sync; the debouncer only decides when to send answers.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::services::answer_codec::AnswerValue;

pub(crate) const WARNING_SECONDS: i64 = 300;
pub(crate) const DANGER_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Urgency {
    Normal,
    Warning,
    Danger,
}

impl Urgency {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Urgency::Normal => "normal",
            Urgency::Warning => "warning",
            Urgency::Danger => "danger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Countdown {
    remaining_seconds: i64,
    expiry_fired: bool,
}

impl Countdown {
    pub(crate) fn new(remaining_seconds: i64) -> Self {
        Self { remaining_seconds: remaining_seconds.max(0), expiry_fired: false }
    }

    pub(crate) fn remaining_seconds(&self) -> i64 {
        self.remaining_seconds
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.remaining_seconds <= 0
    }

    /// One local second. Returns `true` on the single tick that should trigger auto-submit.
    pub(crate) fn tick(&mut self) -> bool {
        self.remaining_seconds = (self.remaining_seconds - 1).max(0);
        self.take_expiry()
    }

    /// Replaces the local value with the server's. Same return contract as [`Countdown::tick`].
    pub(crate) fn sync(&mut self, server_remaining_seconds: i64) -> bool {
        self.remaining_seconds = server_remaining_seconds.max(0);
        self.take_expiry()
    }

    fn take_expiry(&mut self) -> bool {
        if self.is_expired() && !self.expiry_fired {
            self.expiry_fired = true;
            return true;
        }
        false
    }

    /// `MM:SS`. Minutes are not wrapped into hours.
    pub(crate) fn display(&self) -> String {
        format!("{:02}:{:02}", self.remaining_seconds / 60, self.remaining_seconds % 60)
    }

    pub(crate) fn urgency(&self) -> Urgency {
        match self.remaining_seconds {
            seconds if seconds <= DANGER_SECONDS => Urgency::Danger,
            seconds if seconds <= WARNING_SECONDS => Urgency::Warning,
            _ => Urgency::Normal,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingAnswer {
    value: AnswerValue,
    due: Instant,
}

/// Per-question autosave queue. Typed answers wait for the input to settle; option clicks go
/// out on the next drain. A newer value for a question replaces the queued one.
#[derive(Debug, Clone)]
pub(crate) struct AnswerDebouncer {
    delay: Duration,
    pending: BTreeMap<i64, PendingAnswer>,
}

impl AnswerDebouncer {
    pub(crate) fn new(delay: Duration) -> Self {
        Self { delay, pending: BTreeMap::new() }
    }

    pub(crate) fn record(&mut self, question_id: i64, value: AnswerValue, now: Instant) {
        let due = match value {
            AnswerValue::Text(_) => now + self.delay,
            AnswerValue::Options(_) => now,
        };
        self.pending.insert(question_id, PendingAnswer { value, due });
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.due).min()
    }

    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<(i64, AnswerValue)> {
        let due: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.due <= now)
            .map(|(question_id, _)| *question_id)
            .collect();

        due.into_iter()
            .filter_map(|question_id| {
                self.pending.remove(&question_id).map(|pending| (question_id, pending.value))
            })
            .collect()
    }

    /// Everything still queued, regardless of deadline. Used right before submitting.
    pub(crate) fn flush(&mut self) -> Vec<(i64, AnswerValue)> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(question_id, pending)| (question_id, pending.value))
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
