use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::time::format_primitive;
use crate::db::models::{Exam, ExamSession};
use crate::db::types::{QuestionType, SessionStatus};
use crate::services::answer_codec::{Answer, AnswerValue};
use crate::services::anti_cheat;
use crate::services::scoring::QuestionKey;

const MAX_TEXT_ANSWER_CHARS: usize = 10_000;
const MAX_SELECTED_OPTIONS: usize = 100;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct SaveAnswerRequest {
    #[validate(custom(function = "validate_answer_value"))]
    pub(crate) answer: AnswerValue,
}

fn validate_answer_value(value: &AnswerValue) -> Result<(), ValidationError> {
    let within_limits = match value {
        AnswerValue::Text(text) => text.chars().count() <= MAX_TEXT_ANSWER_CHARS,
        AnswerValue::Options(ids) => ids.len() <= MAX_SELECTED_OPTIONS,
    };
    if within_limits {
        Ok(())
    } else {
        Err(ValidationError::new("answer_too_large")
            .with_message("answer exceeds the allowed size".into()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StartSessionResponse {
    pub(crate) session_id: String,
    pub(crate) attempt_number: i32,
    pub(crate) remaining_seconds: i64,
    pub(crate) resumed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SaveAnswerResponse {
    pub(crate) question_id: i64,
    pub(crate) saved: bool,
    pub(crate) remaining_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RemainingTimeResponse {
    pub(crate) remaining_seconds: i64,
    pub(crate) time_expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TabSwitchResponse {
    pub(crate) count: i32,
    pub(crate) flagged: bool,
    /// `false` when the report was folded into one received moments earlier.
    pub(crate) counted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionSummaryResponse {
    pub(crate) session_id: String,
    pub(crate) exam_id: String,
    pub(crate) attempt_number: i32,
    pub(crate) status: SessionStatus,
    pub(crate) start_time: String,
    pub(crate) end_time: Option<String>,
    pub(crate) score: Option<f64>,
    pub(crate) percentage: Option<f64>,
    pub(crate) tab_switch_count: i32,
    pub(crate) flagged: bool,
}

impl SessionSummaryResponse {
    pub(crate) fn from_session(session: &ExamSession, flag_threshold: u32) -> Self {
        Self {
            session_id: session.id.clone(),
            exam_id: session.exam_id.clone(),
            attempt_number: session.attempt_number,
            status: session.status,
            start_time: format_primitive(session.start_time),
            end_time: session.end_time.map(format_primitive),
            score: session.score,
            percentage: session.percentage,
            tab_switch_count: session.tab_switch_count,
            flagged: anti_cheat::is_flagged(session.tab_switch_count, flag_threshold),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExamInfoResponse {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) duration_minutes: i32,
    pub(crate) total_marks: f64,
}

impl From<&Exam> for ExamInfoResponse {
    fn from(exam: &Exam) -> Self {
        Self {
            id: exam.id.clone(),
            title: exam.title.clone(),
            description: exam.description.clone(),
            duration_minutes: exam.duration_minutes,
            total_marks: exam.total_marks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OptionResponse {
    pub(crate) id: i64,
    pub(crate) text: String,
}

/// A question as shown to the student: no correctness flags, and no options at all for
/// free-text questions since those hold the expected answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QuestionResponse {
    pub(crate) id: i64,
    #[serde(rename = "type")]
    pub(crate) question_type: QuestionType,
    pub(crate) content: String,
    pub(crate) marks: f64,
    pub(crate) options: Vec<OptionResponse>,
}

impl From<&QuestionKey> for QuestionResponse {
    fn from(question: &QuestionKey) -> Self {
        let options = if question.question_type.takes_text() {
            Vec::new()
        } else {
            question
                .options
                .iter()
                .map(|option| OptionResponse { id: option.id, text: option.text.clone() })
                .collect()
        };
        Self {
            id: question.question_id,
            question_type: question.question_type,
            content: question.content.clone(),
            marks: question.marks,
            options,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AnswerResponse {
    pub(crate) question_id: i64,
    pub(crate) answer: AnswerValue,
    pub(crate) is_correct: Option<bool>,
    pub(crate) marks_awarded: Option<f64>,
    pub(crate) answered_at: String,
    pub(crate) updated_at: String,
}

impl From<&Answer> for AnswerResponse {
    fn from(answer: &Answer) -> Self {
        Self {
            question_id: answer.question_id,
            answer: answer.value.clone(),
            is_correct: answer.is_correct,
            marks_awarded: answer.marks_awarded,
            answered_at: format_primitive(answer.answered_at),
            updated_at: format_primitive(answer.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionStateResponse {
    pub(crate) session: SessionSummaryResponse,
    pub(crate) exam: ExamInfoResponse,
    pub(crate) remaining_seconds: i64,
    pub(crate) questions: Vec<QuestionResponse>,
    pub(crate) answers: Vec<AnswerResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionResultResponse {
    pub(crate) session: SessionSummaryResponse,
    pub(crate) exam: ExamInfoResponse,
    pub(crate) answers: Vec<AnswerResponse>,
    pub(crate) flagged: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) passed: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::scoring::KeyOption;

    #[test]
    fn free_text_questions_hide_their_expected_answer() {
        let question = QuestionKey {
            question_id: 4,
            question_type: QuestionType::FillBlank,
            content: "Capital of France?".to_string(),
            marks: 2.0,
            options: vec![KeyOption { id: 20, text: "Paris".to_string(), is_correct: true }],
        };

        let json = serde_json::to_value(QuestionResponse::from(&question)).expect("serialize");
        assert_eq!(json["type"], "fill_blank");
        assert_eq!(json["options"], serde_json::json!([]));
        assert!(!json.to_string().contains("Paris"));
    }

    #[test]
    fn choice_questions_list_options_without_correctness() {
        let question = QuestionKey {
            question_id: 1,
            question_type: QuestionType::MultipleChoice,
            content: "Pick one".to_string(),
            marks: 5.0,
            options: vec![
                KeyOption { id: 7, text: "A".to_string(), is_correct: true },
                KeyOption { id: 8, text: "B".to_string(), is_correct: false },
            ],
        };

        let json = serde_json::to_value(QuestionResponse::from(&question)).expect("serialize");
        let expected = serde_json::json!([{"id": 7, "text": "A"}, {"id": 8, "text": "B"}]);
        assert_eq!(json["options"], expected);
    }

    #[test]
    fn oversized_answers_fail_validation() {
        let ok = SaveAnswerRequest { answer: AnswerValue::Text("Paris".to_string()) };
        assert!(ok.validate().is_ok());

        let huge = SaveAnswerRequest { answer: AnswerValue::Text("x".repeat(10_001)) };
        assert!(huge.validate().is_err());

        let many = SaveAnswerRequest { answer: AnswerValue::Options((0..101).collect()) };
        assert!(many.validate().is_err());
    }
}
