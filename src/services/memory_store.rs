use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::PrimitiveDateTime;

use crate::db::models::{Exam, ExamSession};
use crate::db::types::SessionStatus;
use crate::services::answer_codec::{Answer, AnswerValue};
use crate::services::scoring::{self, AnswerKey};
use crate::services::store::{ExamCatalog, NewSession, SessionStore, StoreError, StoreResult};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, ExamSession>,
    answers: BTreeMap<(String, i64), Answer>,
    exams: HashMap<String, (Exam, AnswerKey)>,
    retakes: HashSet<(String, String)>,
    finalizations: usize,
}

/// Mutex-guarded store and catalog. Every trait call runs under one lock, which gives the same
/// row-level atomicity the Postgres store gets from its transactions.
#[derive(Clone, Default)]
pub(crate) struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    pub(crate) fn insert_exam(&self, exam: Exam, key: AnswerKey) {
        if let Ok(mut state) = self.lock() {
            state.exams.insert(exam.id.clone(), (exam, key));
        }
    }

    pub(crate) fn allow_retake(&self, exam_id: &str, student_id: &str) {
        if let Ok(mut state) = self.lock() {
            state.retakes.insert((exam_id.to_string(), student_id.to_string()));
        }
    }

    /// How many terminal transitions actually applied.
    pub(crate) fn finalizations(&self) -> usize {
        self.lock().map(|state| state.finalizations).unwrap_or_default()
    }

    pub(crate) fn answer_count(&self, session_id: &str) -> usize {
        self.lock()
            .map(|state| state.answers.keys().filter(|(id, _)| id == session_id).count())
            .unwrap_or_default()
    }

    /// Moves a session's start time, for simulating long-idle attempts.
    pub(crate) fn set_start_time(&self, session_id: &str, start_time: PrimitiveDateTime) {
        if let Ok(mut state) = self.lock() {
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.start_time = start_time;
            }
        }
    }
}

fn is_in_progress(state: &MemoryState, session_id: &str) -> bool {
    state
        .sessions
        .get(session_id)
        .is_some_and(|session| session.status == SessionStatus::InProgress)
}

fn answers_for(state: &MemoryState, session_id: &str) -> Vec<Answer> {
    state
        .answers
        .iter()
        .filter(|((id, _), _)| id == session_id)
        .map(|(_, answer)| answer.clone())
        .collect()
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn find_session(&self, id: &str) -> StoreResult<Option<ExamSession>> {
        Ok(self.lock()?.sessions.get(id).cloned())
    }

    async fn find_active(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<ExamSession>> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .find(|session| {
                session.exam_id == exam_id
                    && session.student_id == student_id
                    && session.status == SessionStatus::InProgress
            })
            .cloned())
    }

    async fn find_latest(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<ExamSession>> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .filter(|session| session.exam_id == exam_id && session.student_id == student_id)
            .max_by_key(|session| (session.created_at, session.attempt_number))
            .cloned())
    }

    async fn count_attempts(&self, exam_id: &str, student_id: &str) -> StoreResult<i64> {
        let state = self.lock()?;
        let count = state
            .sessions
            .values()
            .filter(|session| session.exam_id == exam_id && session.student_id == student_id)
            .count();
        Ok(count as i64)
    }

    async fn create_session(&self, new: &NewSession) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let clash = state.sessions.contains_key(&new.id)
            || state.sessions.values().any(|session| {
                session.exam_id == new.exam_id
                    && session.student_id == new.student_id
                    && session.status == SessionStatus::InProgress
            });
        if clash {
            return Ok(false);
        }

        state.sessions.insert(
            new.id.clone(),
            ExamSession {
                id: new.id.clone(),
                exam_id: new.exam_id.clone(),
                student_id: new.student_id.clone(),
                attempt_number: new.attempt_number,
                start_time: new.start_time,
                end_time: None,
                status: SessionStatus::InProgress,
                score: None,
                percentage: None,
                tab_switch_count: 0,
                created_at: new.start_time,
                updated_at: new.start_time,
            },
        );
        Ok(true)
    }

    async fn upsert_answer(
        &self,
        session_id: &str,
        question_id: i64,
        value: &AnswerValue,
        now: PrimitiveDateTime,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        if !is_in_progress(&state, session_id) {
            return Ok(false);
        }

        state
            .answers
            .entry((session_id.to_string(), question_id))
            .and_modify(|answer| {
                answer.value = value.clone();
                answer.updated_at = now;
            })
            .or_insert_with(|| Answer {
                session_id: session_id.to_string(),
                question_id,
                value: value.clone(),
                is_correct: None,
                marks_awarded: None,
                answered_at: now,
                updated_at: now,
            });
        Ok(true)
    }

    async fn list_answers(&self, session_id: &str) -> StoreResult<Vec<Answer>> {
        Ok(answers_for(&*self.lock()?, session_id))
    }

    async fn finalize(
        &self,
        session_id: &str,
        status: SessionStatus,
        ended_at: PrimitiveDateTime,
        key: &AnswerKey,
    ) -> StoreResult<Option<ExamSession>> {
        let mut state = self.lock()?;
        if !is_in_progress(&state, session_id) {
            return Ok(None);
        }

        let grade = scoring::grade_session(key, &answers_for(&state, session_id));
        for item in &grade.answers {
            if let Some(answer) =
                state.answers.get_mut(&(session_id.to_string(), item.question_id))
            {
                answer.is_correct = Some(item.grade.is_correct);
                answer.marks_awarded = Some(item.grade.marks_awarded);
            }
        }

        let Some(session) = state.sessions.get_mut(session_id) else {
            return Ok(None);
        };
        session.status = status;
        session.end_time = Some(ended_at);
        session.score = Some(grade.score);
        session.percentage = Some(grade.percentage);
        session.updated_at = ended_at;
        let frozen = session.clone();

        state.finalizations += 1;
        Ok(Some(frozen))
    }

    async fn increment_tab_switch(
        &self,
        session_id: &str,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<i32>> {
        let mut state = self.lock()?;
        match state.sessions.get_mut(session_id) {
            Some(session) if session.status == SessionStatus::InProgress => {
                session.tab_switch_count += 1;
                session.updated_at = now;
                Ok(Some(session.tab_switch_count))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ExamCatalog for InMemoryStore {
    async fn find_exam(&self, exam_id: &str) -> StoreResult<Option<Exam>> {
        Ok(self.lock()?.exams.get(exam_id).map(|(exam, _)| exam.clone()))
    }

    async fn answer_key(&self, exam: &Exam) -> StoreResult<AnswerKey> {
        self.lock()?
            .exams
            .get(&exam.id)
            .map(|(_, key)| key.clone())
            .ok_or_else(|| StoreError::Conflict(format!("exam {} has no answer key", exam.id)))
    }

    async fn retake_allowed(&self, exam_id: &str, student_id: &str) -> StoreResult<bool> {
        Ok(self.lock()?.retakes.contains(&(exam_id.to_string(), student_id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::primitive_now_utc;
    use crate::test_support::{self, CHOICE_EXAM};

    #[tokio::test]
    async fn finalization_counter_tracks_applied_transitions_only() {
        let store = test_support::seeded_store();
        let now = primitive_now_utc();
        let (_, key) = {
            let state = store.lock().expect("lock");
            state.exams.get(CHOICE_EXAM).cloned().expect("seeded exam")
        };
        let new = NewSession {
            id: "s-1".to_string(),
            exam_id: CHOICE_EXAM.to_string(),
            student_id: "student-1".to_string(),
            attempt_number: 1,
            start_time: now,
        };
        assert!(store.create_session(&new).await.expect("create"));

        let missing = store.finalize("no-such-session", SessionStatus::Completed, now, &key).await;
        assert!(missing.expect("finalize").is_none());
        assert_eq!(store.finalizations(), 0);

        let first = store.finalize("s-1", SessionStatus::Completed, now, &key).await;
        assert_eq!(first.expect("finalize").map(|s| s.status), Some(SessionStatus::Completed));
        let second = store.finalize("s-1", SessionStatus::AutoSubmitted, now, &key).await;
        assert!(second.expect("finalize").is_none());
        assert_eq!(store.finalizations(), 1);
    }
}
