use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{QuestionType, SessionStatus};

/// Exam header as far as the session engine needs it. Authored elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Exam {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) duration_minutes: i32,
    pub(crate) total_marks: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Question {
    pub(crate) id: i64,
    #[sqlx(rename = "type")]
    pub(crate) question_type: QuestionType,
    pub(crate) content: String,
    pub(crate) marks: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct QuestionOption {
    pub(crate) id: i64,
    pub(crate) question_id: i64,
    pub(crate) option_text: String,
    pub(crate) is_correct: bool,
    pub(crate) order_index: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct ExamSession {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) student_id: String,
    pub(crate) attempt_number: i32,
    pub(crate) start_time: PrimitiveDateTime,
    pub(crate) end_time: Option<PrimitiveDateTime>,
    pub(crate) status: SessionStatus,
    pub(crate) score: Option<f64>,
    pub(crate) percentage: Option<f64>,
    pub(crate) tab_switch_count: i32,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// Raw `answers` row. Decoded into [`crate::services::answer_codec::Answer`] before use.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct AnswerRow {
    pub(crate) session_id: String,
    pub(crate) question_id: i64,
    pub(crate) answer_text: Option<String>,
    pub(crate) selected_options: Option<Json<Vec<i64>>>,
    pub(crate) is_correct: Option<bool>,
    pub(crate) marks_awarded: Option<f64>,
    pub(crate) answered_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}
