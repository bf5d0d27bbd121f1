use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::AnswerRow;

/// A submitted answer. On the wire a JSON string is text, a JSON array is option ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum AnswerValue {
    Text(String),
    Options(Vec<i64>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum CodecError {
    #[error("answer row carries neither text nor options")]
    Empty,
    #[error("answer row carries both text and options")]
    Ambiguous,
}

/// Column pair for the `answers` table. Exactly one side is set.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AnswerColumns {
    pub(crate) answer_text: Option<String>,
    pub(crate) selected_options: Option<Json<Vec<i64>>>,
}

impl AnswerValue {
    pub(crate) fn encode(&self) -> AnswerColumns {
        match self {
            AnswerValue::Text(text) => {
                AnswerColumns { answer_text: Some(text.clone()), selected_options: None }
            }
            AnswerValue::Options(ids) => {
                AnswerColumns { answer_text: None, selected_options: Some(Json(ids.clone())) }
            }
        }
    }

    pub(crate) fn decode(
        answer_text: Option<String>,
        selected_options: Option<Json<Vec<i64>>>,
    ) -> Result<Self, CodecError> {
        match (answer_text, selected_options) {
            (Some(text), None) => Ok(AnswerValue::Text(text)),
            (None, Some(Json(ids))) => Ok(AnswerValue::Options(ids)),
            (None, None) => Err(CodecError::Empty),
            (Some(_), Some(_)) => Err(CodecError::Ambiguous),
        }
    }

    pub(crate) fn as_text(&self) -> Option<&str> {
        match self {
            AnswerValue::Text(text) => Some(text),
            AnswerValue::Options(_) => None,
        }
    }

    pub(crate) fn as_options(&self) -> Option<&[i64]> {
        match self {
            AnswerValue::Options(ids) => Some(ids),
            AnswerValue::Text(_) => None,
        }
    }
}

/// One persisted answer. Scoring fields stay `None` until the session is finalized.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Answer {
    pub(crate) session_id: String,
    pub(crate) question_id: i64,
    pub(crate) value: AnswerValue,
    pub(crate) is_correct: Option<bool>,
    pub(crate) marks_awarded: Option<f64>,
    pub(crate) answered_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

impl TryFrom<AnswerRow> for Answer {
    type Error = CodecError;

    fn try_from(row: AnswerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            value: AnswerValue::decode(row.answer_text, row.selected_options)?,
            session_id: row.session_id,
            question_id: row.question_id,
            is_correct: row.is_correct,
            marks_awarded: row.marks_awarded,
            answered_at: row.answered_at,
            updated_at: row.updated_at,
        })
    }
}
