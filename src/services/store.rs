//! Persistence seams for the session engine.
//!
//! [`SessionStore`] owns the mutable session and answer rows; [`ExamCatalog`] reads the exam,
//! question and assignment data maintained elsewhere. Both are implemented over Postgres here
//! and in memory for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::{Exam, ExamSession, QuestionOption};
use crate::db::types::SessionStatus;
use crate::repositories;
use crate::services::answer_codec::{Answer, AnswerValue, CodecError};
use crate::services::scoring::{self, AnswerKey, QuestionKey};

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored answer is malformed: {0}")]
    Codec(#[from] CodecError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("session conflict: {0}")]
    Conflict(String),
}

pub(crate) type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub(crate) struct NewSession {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) student_id: String,
    pub(crate) attempt_number: i32,
    pub(crate) start_time: PrimitiveDateTime,
}

#[async_trait]
pub(crate) trait SessionStore: Send + Sync {
    async fn find_session(&self, id: &str) -> StoreResult<Option<ExamSession>>;

    async fn find_active(&self, exam_id: &str, student_id: &str)
        -> StoreResult<Option<ExamSession>>;

    async fn find_latest(&self, exam_id: &str, student_id: &str)
        -> StoreResult<Option<ExamSession>>;

    async fn count_attempts(&self, exam_id: &str, student_id: &str) -> StoreResult<i64>;

    /// Returns `false` if an in-progress session for the pair already exists.
    async fn create_session(&self, session: &NewSession) -> StoreResult<bool>;

    /// Writes the answer only while the session is in progress. Returns `false` otherwise.
    async fn upsert_answer(
        &self,
        session_id: &str,
        question_id: i64,
        value: &AnswerValue,
        now: PrimitiveDateTime,
    ) -> StoreResult<bool>;

    async fn list_answers(&self, session_id: &str) -> StoreResult<Vec<Answer>>;

    /// Atomically moves an in-progress session to `status`, grading every stored answer against
    /// `key` in the same step. Returns `None` if the session was no longer in progress.
    async fn finalize(
        &self,
        session_id: &str,
        status: SessionStatus,
        ended_at: PrimitiveDateTime,
        key: &AnswerKey,
    ) -> StoreResult<Option<ExamSession>>;

    /// New count, or `None` if the session was no longer in progress.
    async fn increment_tab_switch(
        &self,
        session_id: &str,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<i32>>;
}

#[async_trait]
pub(crate) trait ExamCatalog: Send + Sync {
    async fn find_exam(&self, exam_id: &str) -> StoreResult<Option<Exam>>;

    async fn answer_key(&self, exam: &Exam) -> StoreResult<AnswerKey>;

    async fn retake_allowed(&self, exam_id: &str, student_id: &str) -> StoreResult<bool>;
}

#[derive(Clone)]
pub(crate) struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn find_session(&self, id: &str) -> StoreResult<Option<ExamSession>> {
        Ok(repositories::sessions::find_by_id(&self.pool, id).await?)
    }

    async fn find_active(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<ExamSession>> {
        Ok(repositories::sessions::find_active(&self.pool, exam_id, student_id).await?)
    }

    async fn find_latest(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<ExamSession>> {
        Ok(repositories::sessions::find_latest(&self.pool, exam_id, student_id).await?)
    }

    async fn count_attempts(&self, exam_id: &str, student_id: &str) -> StoreResult<i64> {
        Ok(repositories::sessions::count_by_exam_and_student(&self.pool, exam_id, student_id)
            .await?)
    }

    async fn create_session(&self, session: &NewSession) -> StoreResult<bool> {
        Ok(repositories::sessions::create(
            &self.pool,
            repositories::sessions::CreateSession {
                id: &session.id,
                exam_id: &session.exam_id,
                student_id: &session.student_id,
                attempt_number: session.attempt_number,
                start_time: session.start_time,
            },
        )
        .await?)
    }

    async fn upsert_answer(
        &self,
        session_id: &str,
        question_id: i64,
        value: &AnswerValue,
        now: PrimitiveDateTime,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let status = repositories::sessions::status_for_share(&mut *tx, session_id).await?;
        if status != Some(SessionStatus::InProgress) {
            tx.rollback().await?;
            return Ok(false);
        }

        repositories::answers::upsert(&mut *tx, session_id, question_id, value.encode(), now)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_answers(&self, session_id: &str) -> StoreResult<Vec<Answer>> {
        let rows = repositories::answers::list_by_session(&self.pool, session_id).await?;
        rows.into_iter().map(|row| Answer::try_from(row).map_err(StoreError::from)).collect()
    }

    async fn finalize(
        &self,
        session_id: &str,
        status: SessionStatus,
        ended_at: PrimitiveDateTime,
        key: &AnswerKey,
    ) -> StoreResult<Option<ExamSession>> {
        let mut tx = self.pool.begin().await?;

        if repositories::sessions::lock_in_progress(&mut *tx, session_id).await?.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let answers = repositories::answers::list_by_session(&mut *tx, session_id)
            .await?
            .into_iter()
            .map(Answer::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let grade = scoring::grade_session(key, &answers);

        for item in &grade.answers {
            repositories::answers::set_grade(
                &mut *tx,
                session_id,
                item.question_id,
                item.grade.is_correct,
                item.grade.marks_awarded,
            )
            .await?;
        }

        let finished = repositories::sessions::finish(
            &mut *tx,
            repositories::sessions::FinishSession {
                id: session_id,
                status,
                end_time: ended_at,
                score: grade.score,
                percentage: grade.percentage,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(finished)
    }

    async fn increment_tab_switch(
        &self,
        session_id: &str,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<i32>> {
        Ok(repositories::sessions::increment_tab_switch(&self.pool, session_id, now).await?)
    }
}

#[async_trait]
impl ExamCatalog for PgStore {
    async fn find_exam(&self, exam_id: &str) -> StoreResult<Option<Exam>> {
        Ok(repositories::exams::find_by_id(&self.pool, exam_id).await?)
    }

    async fn answer_key(&self, exam: &Exam) -> StoreResult<AnswerKey> {
        let questions = repositories::exams::list_questions(&self.pool, &exam.id).await?;
        let ids: Vec<i64> = questions.iter().map(|question| question.id).collect();
        let mut options_by_question: HashMap<i64, Vec<QuestionOption>> = HashMap::new();
        for option in repositories::exams::list_options(&self.pool, &ids).await? {
            options_by_question.entry(option.question_id).or_default().push(option);
        }

        let questions = questions
            .into_iter()
            .map(|question| {
                let options = options_by_question.remove(&question.id).unwrap_or_default();
                QuestionKey::from_rows(question, options)
            })
            .collect();

        Ok(AnswerKey { total_marks: exam.total_marks, questions })
    }

    async fn retake_allowed(&self, exam_id: &str, student_id: &str) -> StoreResult<bool> {
        Ok(repositories::exams::retake_allowed(&self.pool, exam_id, student_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::time::{primitive_now_utc, ManualClock};
    use crate::services::session_lifecycle::{EnginePolicy, SessionLifecycle};
    use crate::test_support::{env_lock, insert_choice_exam, prepare_db};

    const EXAM: &str = "pg-exam";
    const STUDENT: &str = "student-pg";

    fn now() -> PrimitiveDateTime {
        primitive_now_utc().replace_nanosecond(0).expect("nanoseconds")
    }

    fn new_session(id: &str) -> NewSession {
        NewSession {
            id: id.to_string(),
            exam_id: EXAM.to_string(),
            student_id: STUDENT.to_string(),
            attempt_number: 1,
            start_time: now(),
        }
    }

    async fn answer_key(store: &PgStore) -> AnswerKey {
        let exam = store.find_exam(EXAM).await.expect("find exam").expect("exam exists");
        store.answer_key(&exam).await.expect("answer key")
    }

    #[tokio::test]
    async fn concurrent_finalize_applies_once() {
        let _guard = env_lock().await;
        let Some(pool) = prepare_db().await else {
            eprintln!("skipping Postgres store test: no test database configured");
            return;
        };
        let questions = insert_choice_exam(&pool, EXAM).await;
        let store = PgStore::new(pool);
        let key = answer_key(&store).await;

        assert!(store.create_session(&new_session("pg-s1")).await.expect("create"));
        let right = AnswerValue::Options(vec![questions[0].correct]);
        let wrong = AnswerValue::Options(vec![questions[1].wrong]);
        assert!(store.upsert_answer("pg-s1", questions[0].id, &right, now()).await.expect("save"));
        assert!(store.upsert_answer("pg-s1", questions[1].id, &wrong, now()).await.expect("save"));

        let ended_at = now();
        let (first, second) = tokio::join!(
            store.finalize("pg-s1", SessionStatus::Completed, ended_at, &key),
            store.finalize("pg-s1", SessionStatus::AutoSubmitted, ended_at, &key),
        );
        let applied: Vec<ExamSession> =
            [first.expect("first"), second.expect("second")].into_iter().flatten().collect();
        assert_eq!(applied.len(), 1, "exactly one finalize wins");

        let stored = store.find_session("pg-s1").await.expect("find").expect("session");
        assert_eq!(stored.status, applied[0].status);
        assert_eq!(stored.score, Some(5.0));
        assert_eq!(stored.percentage, Some(50.0));
        assert!(stored.end_time.is_some());

        let graded = store.list_answers("pg-s1").await.expect("answers");
        let by_question: HashMap<i64, Option<bool>> =
            graded.iter().map(|answer| (answer.question_id, answer.is_correct)).collect();
        assert_eq!(by_question[&questions[0].id], Some(true));
        assert_eq!(by_question[&questions[1].id], Some(false));

        let late = store.finalize("pg-s1", SessionStatus::Completed, now(), &key).await;
        assert!(late.expect("late finalize").is_none());
    }

    #[tokio::test]
    async fn answers_and_tab_switches_stop_after_finalize() {
        let _guard = env_lock().await;
        let Some(pool) = prepare_db().await else {
            eprintln!("skipping Postgres store test: no test database configured");
            return;
        };
        let questions = insert_choice_exam(&pool, EXAM).await;
        let store = PgStore::new(pool);
        let key = answer_key(&store).await;

        assert!(store.create_session(&new_session("pg-s2")).await.expect("create"));
        let first = AnswerValue::Options(vec![questions[0].wrong]);
        assert!(store.upsert_answer("pg-s2", questions[0].id, &first, now()).await.expect("save"));
        let changed = AnswerValue::Options(vec![questions[0].correct]);
        let saved = store.upsert_answer("pg-s2", questions[0].id, &changed, now()).await;
        assert!(saved.expect("save"));
        assert_eq!(store.increment_tab_switch("pg-s2", now()).await.expect("tab"), Some(1));

        store
            .finalize("pg-s2", SessionStatus::Completed, now(), &key)
            .await
            .expect("finalize")
            .expect("applied");

        let late = AnswerValue::Options(vec![questions[1].correct]);
        assert!(!store.upsert_answer("pg-s2", questions[1].id, &late, now()).await.expect("late"));
        assert!(!store.upsert_answer("pg-s2", questions[0].id, &first, now()).await.expect("late"));
        assert_eq!(store.increment_tab_switch("pg-s2", now()).await.expect("tab"), None);

        let answers = store.list_answers("pg-s2").await.expect("answers");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].value, changed);
        assert_eq!(answers[0].marks_awarded, Some(5.0));
    }

    #[tokio::test]
    async fn one_in_progress_session_per_student() {
        let _guard = env_lock().await;
        let Some(pool) = prepare_db().await else {
            eprintln!("skipping Postgres store test: no test database configured");
            return;
        };
        insert_choice_exam(&pool, EXAM).await;
        let store = PgStore::new(pool.clone());

        assert!(store.create_session(&new_session("pg-a")).await.expect("first"));
        assert!(!store.create_session(&new_session("pg-b")).await.expect("second"));

        let active = store.find_active(EXAM, STUDENT).await.expect("active").expect("exists");
        assert_eq!(active.id, "pg-a");
        assert_eq!(store.count_attempts(EXAM, STUDENT).await.expect("count"), 1);
        assert!(!store.retake_allowed(EXAM, STUDENT).await.expect("retake"));

        sqlx::query(
            "INSERT INTO exam_assignments (exam_id, student_id, retake_allowed) \
             VALUES ($1, $2, TRUE)",
        )
        .bind(EXAM)
        .bind(STUDENT)
        .execute(&pool)
        .await
        .expect("grant retake");
        assert!(store.retake_allowed(EXAM, STUDENT).await.expect("retake"));
    }

    #[tokio::test]
    async fn concurrent_starts_resume_the_same_session() {
        let _guard = env_lock().await;
        let Some(pool) = prepare_db().await else {
            eprintln!("skipping Postgres store test: no test database configured");
            return;
        };
        let questions = insert_choice_exam(&pool, EXAM).await;
        let store = Arc::new(PgStore::new(pool));
        let engine = SessionLifecycle::new(
            store.clone(),
            store.clone(),
            Arc::new(ManualClock::new()),
            EnginePolicy::default(),
        );

        let (first, second) =
            tokio::join!(engine.start(EXAM, STUDENT), engine.start(EXAM, STUDENT));
        let (first, second) = (first.expect("first start"), second.expect("second start"));
        assert_eq!(first.session.id, second.session.id);
        assert!(first.resumed != second.resumed, "one start creates, the other resumes");
        assert_eq!(store.count_attempts(EXAM, STUDENT).await.expect("count"), 1);

        let key = answer_key(&store).await;
        let ids: Vec<i64> = key.questions.iter().map(|question| question.question_id).collect();
        assert_eq!(ids, vec![questions[0].id, questions[1].id]);
        assert_eq!(key.questions[0].options.len(), 2);

        let session_id = first.session.id;
        let right = AnswerValue::Options(vec![questions[1].correct]);
        engine.save_answer(&session_id, STUDENT, questions[1].id, right).await.expect("save");
        let submitted = engine.submit(&session_id, STUDENT).await.expect("submit");
        assert_eq!(submitted.status, SessionStatus::Completed);
        assert_eq!(submitted.score, Some(5.0));
    }
}
