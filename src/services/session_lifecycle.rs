//! State machine for one timed exam attempt.
//!
//! `in_progress` is the only state that accepts writes. Every mutation first recomputes the
//! remaining time from the stored start time; an attempt found past its deadline is
//! auto-submitted on the spot before the original request is answered. The terminal transition
//! and grading happen together inside [`SessionStore::finalize`], so whichever of submit,
//! auto-submit or lazy expiry gets there first is the only one that scores.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::core::config::ExamSettings;
use crate::core::metrics;
use crate::core::time::Clock;
use crate::db::models::{Exam, ExamSession};
use crate::db::types::{QuestionType, SessionStatus};
use crate::services::answer_codec::{Answer, AnswerValue};
use crate::services::anti_cheat::{self, TabSwitchStatus};
use crate::services::scoring::QuestionKey;
use crate::services::session_timer::{self, TimeLeft};
use crate::services::store::{ExamCatalog, NewSession, SessionStore, StoreError};

#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("Exam not found")]
    ExamNotFound,
    #[error("Session not found")]
    InvalidSession,
    #[error("Session is not in progress")]
    NotInProgress,
    #[error("Session has already been submitted")]
    AlreadyTerminal,
    #[error("Exam already completed")]
    AlreadyCompleted,
    #[error("Time limit reached; the session was submitted automatically")]
    TimeExpired,
    #[error("Question is not part of this exam")]
    UnknownQuestion,
    #[error("Invalid answer: {0}")]
    InvalidAnswer(String),
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct EnginePolicy {
    pub(crate) tab_switch_flag_threshold: u32,
    pub(crate) pass_percentage: Option<f64>,
}

impl EnginePolicy {
    pub(crate) fn from_settings(exam: &ExamSettings) -> Self {
        Self {
            tab_switch_flag_threshold: exam.tab_switch_flag_threshold,
            pass_percentage: exam.pass_percentage,
        }
    }
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self { tab_switch_flag_threshold: 3, pass_percentage: None }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StartedSession {
    pub(crate) session: ExamSession,
    pub(crate) remaining_seconds: i64,
    pub(crate) resumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimePoll {
    pub(crate) remaining_seconds: i64,
    pub(crate) time_expired: bool,
}

/// Everything a refreshed exam page needs to put itself back together.
#[derive(Debug, Clone)]
pub(crate) struct ResumeState {
    pub(crate) session: ExamSession,
    pub(crate) exam: Exam,
    pub(crate) remaining_seconds: i64,
    pub(crate) questions: Vec<QuestionKey>,
    pub(crate) answers: Vec<Answer>,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionResult {
    pub(crate) session: ExamSession,
    pub(crate) exam: Exam,
    pub(crate) answers: Vec<Answer>,
    pub(crate) flagged: bool,
    pub(crate) passed: Option<bool>,
}

pub(crate) struct SessionLifecycle {
    store: Arc<dyn SessionStore>,
    catalog: Arc<dyn ExamCatalog>,
    clock: Arc<dyn Clock>,
    policy: EnginePolicy,
}

impl SessionLifecycle {
    pub(crate) fn new(
        store: Arc<dyn SessionStore>,
        catalog: Arc<dyn ExamCatalog>,
        clock: Arc<dyn Clock>,
        policy: EnginePolicy,
    ) -> Self {
        Self { store, catalog, clock, policy }
    }

    pub(crate) fn policy(&self) -> EnginePolicy {
        self.policy
    }

    /// Resumes the student's in-progress attempt or opens a new one.
    pub(crate) async fn start(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<StartedSession, SessionError> {
        let exam = self.catalog.find_exam(exam_id).await?.ok_or(SessionError::ExamNotFound)?;

        if let Some(active) = self.store.find_active(exam_id, student_id).await? {
            let left = self.time_left(&active, &exam);
            if !left.expired() {
                metrics::session_started(true);
                return Ok(StartedSession {
                    session: active,
                    remaining_seconds: left.remaining_seconds,
                    resumed: true,
                });
            }
            self.finalize(&active, &exam, SessionStatus::AutoSubmitted).await?;
        }

        if let Some(latest) = self.store.find_latest(exam_id, student_id).await? {
            if latest.status.is_terminal()
                && !self.catalog.retake_allowed(exam_id, student_id).await?
            {
                return Err(SessionError::AlreadyCompleted);
            }
        }

        let attempts = self.store.count_attempts(exam_id, student_id).await?;
        let new_session = NewSession {
            id: Uuid::new_v4().to_string(),
            exam_id: exam_id.to_string(),
            student_id: student_id.to_string(),
            attempt_number: i32::try_from(attempts + 1).unwrap_or(i32::MAX),
            start_time: self.clock.now(),
        };

        let created = self.store.create_session(&new_session).await?;
        let lookup = if created {
            self.store.find_session(&new_session.id).await?
        } else {
            // A concurrent start won the one-active-session slot; resume theirs.
            self.store.find_active(exam_id, student_id).await?
        };
        let session = lookup.ok_or_else(|| {
            StoreError::Conflict(format!(
                "session for exam {exam_id} and student {student_id} vanished after start"
            ))
        })?;

        metrics::session_started(!created);
        if created {
            tracing::info!(
                session_id = %session.id,
                exam_id = %session.exam_id,
                student_id = %session.student_id,
                attempt_number = session.attempt_number,
                "Exam session started"
            );
        }

        let remaining_seconds = self.time_left(&session, &exam).remaining_seconds;
        Ok(StartedSession { session, remaining_seconds, resumed: !created })
    }

    pub(crate) async fn save_answer(
        &self,
        session_id: &str,
        student_id: &str,
        question_id: i64,
        value: AnswerValue,
    ) -> Result<TimeLeft, SessionError> {
        let (session, exam) = self.load(session_id, student_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::NotInProgress);
        }

        let left = self.time_left(&session, &exam);
        if left.expired() {
            self.finalize(&session, &exam, SessionStatus::AutoSubmitted).await?;
            return Err(SessionError::TimeExpired);
        }

        let key = self.catalog.answer_key(&exam).await?;
        let question = key.question(question_id).ok_or(SessionError::UnknownQuestion)?;
        validate_answer(question, &value)?;

        let saved =
            self.store.upsert_answer(session_id, question_id, &value, self.clock.now()).await?;
        if !saved {
            return Err(SessionError::NotInProgress);
        }

        metrics::answer_saved();
        tracing::debug!(session_id, question_id, "Answer saved");
        Ok(left)
    }

    /// Student-initiated submit. Past the deadline this freezes the attempt as auto-submitted.
    pub(crate) async fn submit(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<ExamSession, SessionError> {
        let (session, exam) = self.load(session_id, student_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::AlreadyTerminal);
        }

        let status = if self.time_left(&session, &exam).expired() {
            SessionStatus::AutoSubmitted
        } else {
            SessionStatus::Completed
        };
        self.finalize(&session, &exam, status).await?.ok_or(SessionError::AlreadyTerminal)
    }

    pub(crate) async fn auto_submit(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<ExamSession, SessionError> {
        let (session, exam) = self.load(session_id, student_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::AlreadyTerminal);
        }

        self.finalize(&session, &exam, SessionStatus::AutoSubmitted)
            .await?
            .ok_or(SessionError::AlreadyTerminal)
    }

    /// Side-effect free read of the server-side countdown.
    pub(crate) async fn remaining_seconds(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<i64, SessionError> {
        let (session, exam) = self.load(session_id, student_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::NotInProgress);
        }
        Ok(self.time_left(&session, &exam).remaining_seconds)
    }

    /// Countdown sync for the browser. Reaching zero auto-submits the attempt.
    pub(crate) async fn poll_time(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<TimePoll, SessionError> {
        let (session, exam) = self.load(session_id, student_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::NotInProgress);
        }

        let left = self.time_left(&session, &exam);
        if left.expired() {
            self.finalize(&session, &exam, SessionStatus::AutoSubmitted).await?;
        }
        Ok(TimePoll { remaining_seconds: left.remaining_seconds, time_expired: left.expired() })
    }

    pub(crate) async fn increment_tab_switch(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<TabSwitchStatus, SessionError> {
        let (session, exam) = self.load(session_id, student_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::NotInProgress);
        }
        if self.time_left(&session, &exam).expired() {
            self.finalize(&session, &exam, SessionStatus::AutoSubmitted).await?;
            return Err(SessionError::TimeExpired);
        }

        let count = self
            .store
            .increment_tab_switch(session_id, self.clock.now())
            .await?
            .ok_or(SessionError::NotInProgress)?;

        let threshold = self.policy.tab_switch_flag_threshold;
        let status = TabSwitchStatus::new(count, threshold);
        let newly_flagged = status.just_flagged(threshold);
        metrics::tab_switch_recorded(newly_flagged);
        if newly_flagged {
            tracing::warn!(
                session_id,
                student_id,
                exam_id = %session.exam_id,
                count,
                "Session flagged for tab switching"
            );
        }
        Ok(status)
    }

    /// Current counter without recording a new switch. Same expiry rule as a counted switch.
    pub(crate) async fn tab_switch_status(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<TabSwitchStatus, SessionError> {
        let (session, exam) = self.load(session_id, student_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::NotInProgress);
        }
        if self.time_left(&session, &exam).expired() {
            self.finalize(&session, &exam, SessionStatus::AutoSubmitted).await?;
            return Err(SessionError::TimeExpired);
        }
        Ok(TabSwitchStatus::new(session.tab_switch_count, self.policy.tab_switch_flag_threshold))
    }

    pub(crate) async fn answers(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Vec<Answer>, SessionError> {
        let session = self.load_owned(session_id, student_id).await?;
        Ok(self.store.list_answers(&session.id).await?)
    }

    pub(crate) async fn resume_state(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<ResumeState, SessionError> {
        let (mut session, exam) = self.load(session_id, student_id).await?;

        let mut remaining_seconds = 0;
        if !session.status.is_terminal() {
            let left = self.time_left(&session, &exam);
            if left.expired() {
                session = self.expire(session, &exam).await?;
            } else {
                remaining_seconds = left.remaining_seconds;
            }
        }

        let questions = self.catalog.answer_key(&exam).await?.questions;
        let answers = self.store.list_answers(&session.id).await?;
        Ok(ResumeState { session, exam, remaining_seconds, questions, answers })
    }

    /// Graded outcome of a finished attempt. An attempt still running in time has none yet.
    pub(crate) async fn session_result(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<SessionResult, SessionError> {
        let (mut session, exam) = self.load(session_id, student_id).await?;
        if !session.status.is_terminal() {
            if !self.time_left(&session, &exam).expired() {
                return Err(SessionError::NotInProgress);
            }
            session = self.expire(session, &exam).await?;
        }

        let answers = self.store.list_answers(&session.id).await?;
        let flagged =
            anti_cheat::is_flagged(session.tab_switch_count, self.policy.tab_switch_flag_threshold);
        let passed = self
            .policy
            .pass_percentage
            .zip(session.percentage)
            .map(|(threshold, percentage)| percentage >= threshold);

        Ok(SessionResult { session, exam, answers, flagged, passed })
    }

    fn time_left(&self, session: &ExamSession, exam: &Exam) -> TimeLeft {
        session_timer::time_left(session, exam.duration_minutes, self.clock.now())
    }

    async fn load_owned(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<ExamSession, SessionError> {
        self.store
            .find_session(session_id)
            .await?
            .filter(|session| session.student_id == student_id)
            .ok_or(SessionError::InvalidSession)
    }

    async fn load(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<(ExamSession, Exam), SessionError> {
        let session = self.load_owned(session_id, student_id).await?;
        let exam =
            self.catalog.find_exam(&session.exam_id).await?.ok_or(SessionError::ExamNotFound)?;
        Ok((session, exam))
    }

    /// Auto-submits an overdue attempt and returns the frozen row, whoever froze it.
    async fn expire(&self, session: ExamSession, exam: &Exam) -> Result<ExamSession, SessionError> {
        if let Some(frozen) = self.finalize(&session, exam, SessionStatus::AutoSubmitted).await? {
            return Ok(frozen);
        }
        self.store.find_session(&session.id).await?.ok_or(SessionError::InvalidSession)
    }

    async fn finalize(
        &self,
        session: &ExamSession,
        exam: &Exam,
        status: SessionStatus,
    ) -> Result<Option<ExamSession>, SessionError> {
        let key = self.catalog.answer_key(exam).await?;
        let frozen = self.store.finalize(&session.id, status, self.clock.now(), &key).await?;

        match &frozen {
            Some(done) => {
                metrics::session_finalized(status);
                tracing::info!(
                    session_id = %done.id,
                    exam_id = %done.exam_id,
                    student_id = %done.student_id,
                    status = status.as_str(),
                    score = done.score.unwrap_or_default(),
                    percentage = done.percentage.unwrap_or_default(),
                    "Exam session finalized"
                );
            }
            None => tracing::debug!(
                session_id = %session.id,
                status = status.as_str(),
                "Session already left in_progress; transition skipped"
            ),
        }
        Ok(frozen)
    }
}

fn validate_answer(question: &QuestionKey, value: &AnswerValue) -> Result<(), SessionError> {
    match (question.question_type.takes_text(), value) {
        (true, AnswerValue::Text(_)) => Ok(()),
        (true, AnswerValue::Options(_)) => {
            Err(SessionError::InvalidAnswer("this question expects a text answer".to_string()))
        }
        (false, AnswerValue::Text(_)) => {
            Err(SessionError::InvalidAnswer("this question expects option ids".to_string()))
        }
        (false, AnswerValue::Options(ids)) => {
            let single_choice = matches!(
                question.question_type,
                QuestionType::MultipleChoice | QuestionType::TrueFalse
            );
            if single_choice && ids.len() > 1 {
                return Err(SessionError::InvalidAnswer(
                    "only one option may be selected".to_string(),
                ));
            }
            if let Some(unknown) = ids.iter().find(|id| !question.has_option(**id)) {
                return Err(SessionError::InvalidAnswer(format!(
                    "option {unknown} does not belong to question {}",
                    question.question_id
                )));
            }
            Ok(())
        }
    }
}
