use serde::{Deserialize, Serialize};
use sqlx::Type;

/// Lifecycle of one attempt. `InProgress` is the only state that accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "sessionstatus", rename_all = "snake_case")]
pub(crate) enum SessionStatus {
    InProgress,
    Completed,
    AutoSubmitted,
}

impl SessionStatus {
    pub(crate) fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::InProgress)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::AutoSubmitted => "auto_submitted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "questiontype", rename_all = "snake_case")]
pub(crate) enum QuestionType {
    MultipleChoice,
    TrueFalse,
    SelectAll,
    FillBlank,
    ShortAnswer,
}

impl QuestionType {
    /// Free-text questions carry `answer_text`; the rest carry selected option ids.
    pub(crate) fn takes_text(self) -> bool {
        matches!(self, QuestionType::FillBlank | QuestionType::ShortAnswer)
    }
}
