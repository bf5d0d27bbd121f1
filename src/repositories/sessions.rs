use time::PrimitiveDateTime;

use crate::db::models::ExamSession;
use crate::db::types::SessionStatus;

pub(crate) const COLUMNS: &str = "\
    id, exam_id, student_id, attempt_number, start_time, end_time, status, \
    score, percentage, tab_switch_count, created_at, updated_at";

pub(crate) struct CreateSession<'a> {
    pub(crate) id: &'a str,
    pub(crate) exam_id: &'a str,
    pub(crate) student_id: &'a str,
    pub(crate) attempt_number: i32,
    pub(crate) start_time: PrimitiveDateTime,
}

pub(crate) struct FinishSession<'a> {
    pub(crate) id: &'a str,
    pub(crate) status: SessionStatus,
    pub(crate) end_time: PrimitiveDateTime,
    pub(crate) score: f64,
    pub(crate) percentage: f64,
}

pub(crate) async fn find_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!("SELECT {COLUMNS} FROM exam_sessions WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn find_active(
    executor: impl sqlx::PgExecutor<'_>,
    exam_id: &str,
    student_id: &str,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "SELECT {COLUMNS} FROM exam_sessions \
         WHERE exam_id = $1 AND student_id = $2 AND status = $3"
    ))
    .bind(exam_id)
    .bind(student_id)
    .bind(SessionStatus::InProgress)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn find_latest(
    executor: impl sqlx::PgExecutor<'_>,
    exam_id: &str,
    student_id: &str,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "SELECT {COLUMNS} FROM exam_sessions \
         WHERE exam_id = $1 AND student_id = $2 \
         ORDER BY created_at DESC, attempt_number DESC LIMIT 1"
    ))
    .bind(exam_id)
    .bind(student_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn count_by_exam_and_student(
    executor: impl sqlx::PgExecutor<'_>,
    exam_id: &str,
    student_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM exam_sessions WHERE exam_id = $1 AND student_id = $2")
        .bind(exam_id)
        .bind(student_id)
        .fetch_one(executor)
        .await
}

/// Inserts an in-progress session. Returns `false` when another in-progress session for the
/// same exam and student already holds the partial unique index.
pub(crate) async fn create(
    executor: impl sqlx::PgExecutor<'_>,
    session: CreateSession<'_>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO exam_sessions (
            id, exam_id, student_id, attempt_number, start_time, status,
            tab_switch_count, created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,0,$5,$5)
        ON CONFLICT DO NOTHING",
    )
    .bind(session.id)
    .bind(session.exam_id)
    .bind(session.student_id)
    .bind(session.attempt_number)
    .bind(session.start_time)
    .bind(SessionStatus::InProgress)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Locks the row for the terminal transition. Yields nothing once the session left
/// `in_progress`, which is how a losing submit observes the race.
pub(crate) async fn lock_in_progress(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "SELECT {COLUMNS} FROM exam_sessions WHERE id = $1 AND status = $2 FOR UPDATE"
    ))
    .bind(id)
    .bind(SessionStatus::InProgress)
    .fetch_optional(executor)
    .await
}

/// Status read that blocks a concurrent terminal transition until the caller commits.
pub(crate) async fn status_for_share(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
) -> Result<Option<SessionStatus>, sqlx::Error> {
    sqlx::query_scalar("SELECT status FROM exam_sessions WHERE id = $1 FOR SHARE")
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn finish(
    executor: impl sqlx::PgExecutor<'_>,
    finish: FinishSession<'_>,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "UPDATE exam_sessions \
         SET status = $2, end_time = $3, score = $4, percentage = $5, updated_at = $3 \
         WHERE id = $1 AND status = $6 \
         RETURNING {COLUMNS}"
    ))
    .bind(finish.id)
    .bind(finish.status)
    .bind(finish.end_time)
    .bind(finish.score)
    .bind(finish.percentage)
    .bind(SessionStatus::InProgress)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn increment_tab_switch(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<Option<i32>, sqlx::Error> {
    sqlx::query_scalar(
        "UPDATE exam_sessions \
         SET tab_switch_count = tab_switch_count + 1, updated_at = $2 \
         WHERE id = $1 AND status = $3 \
         RETURNING tab_switch_count",
    )
    .bind(id)
    .bind(now)
    .bind(SessionStatus::InProgress)
    .fetch_optional(executor)
    .await
}
