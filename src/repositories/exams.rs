use sqlx::PgPool;

use crate::db::models::{Exam, Question, QuestionOption};

pub(crate) const COLUMNS: &str = "id, title, description, duration_minutes, total_marks";

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Exam>, sqlx::Error> {
    sqlx::query_as::<_, Exam>(&format!("SELECT {COLUMNS} FROM exams WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list_questions(
    pool: &PgPool,
    exam_id: &str,
) -> Result<Vec<Question>, sqlx::Error> {
    sqlx::query_as::<_, Question>(
        "SELECT q.id, q.type, q.content, q.marks \
         FROM exam_questions eq \
         JOIN questions q ON q.id = eq.question_id \
         WHERE eq.exam_id = $1 \
         ORDER BY eq.question_order, q.id",
    )
    .bind(exam_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list_options(
    pool: &PgPool,
    question_ids: &[i64],
) -> Result<Vec<QuestionOption>, sqlx::Error> {
    if question_ids.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query_as::<_, QuestionOption>(
        "SELECT id, question_id, option_text, is_correct, order_index \
         FROM question_options \
         WHERE question_id = ANY($1) \
         ORDER BY question_id, order_index, id",
    )
    .bind(question_ids)
    .fetch_all(pool)
    .await
}

pub(crate) async fn retake_allowed(
    pool: &PgPool,
    exam_id: &str,
    student_id: &str,
) -> Result<bool, sqlx::Error> {
    let allowed: Option<bool> = sqlx::query_scalar(
        "SELECT retake_allowed FROM exam_assignments WHERE exam_id = $1 AND student_id = $2",
    )
    .bind(exam_id)
    .bind(student_id)
    .fetch_optional(pool)
    .await?;

    Ok(allowed.unwrap_or(false))
}
