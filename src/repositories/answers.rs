use time::PrimitiveDateTime;

use crate::db::models::AnswerRow;
use crate::services::answer_codec::AnswerColumns;

pub(crate) const COLUMNS: &str = "\
    session_id, question_id, answer_text, selected_options, is_correct, marks_awarded, \
    answered_at, updated_at";

/// Insert-or-overwrite keyed by `(session_id, question_id)`. Clears the column the new value
/// does not use so a question can switch between text and options.
pub(crate) async fn upsert(
    executor: impl sqlx::PgExecutor<'_>,
    session_id: &str,
    question_id: i64,
    columns: AnswerColumns,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO answers (
            session_id, question_id, answer_text, selected_options, answered_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$5)
        ON CONFLICT (session_id, question_id) DO UPDATE SET
            answer_text = EXCLUDED.answer_text,
            selected_options = EXCLUDED.selected_options,
            updated_at = EXCLUDED.updated_at",
    )
    .bind(session_id)
    .bind(question_id)
    .bind(columns.answer_text)
    .bind(columns.selected_options)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn list_by_session(
    executor: impl sqlx::PgExecutor<'_>,
    session_id: &str,
) -> Result<Vec<AnswerRow>, sqlx::Error> {
    sqlx::query_as::<_, AnswerRow>(&format!(
        "SELECT {COLUMNS} FROM answers WHERE session_id = $1 ORDER BY question_id"
    ))
    .bind(session_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn set_grade(
    executor: impl sqlx::PgExecutor<'_>,
    session_id: &str,
    question_id: i64,
    is_correct: bool,
    marks_awarded: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE answers SET is_correct = $3, marks_awarded = $4 \
         WHERE session_id = $1 AND question_id = $2",
    )
    .bind(session_id)
    .bind(question_id)
    .bind(is_correct)
    .bind(marks_awarded)
    .execute(executor)
    .await?;
    Ok(())
}
