//! Automatic grading of stored answers.
//!
//! Everything here is pure: the same key and answers always produce the same grade, so the
//! store can run it inside the transaction that freezes the session.

use std::collections::{BTreeSet, HashMap};

use crate::db::models::{Question, QuestionOption};
use crate::db::types::QuestionType;
use crate::services::answer_codec::{Answer, AnswerValue};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyOption {
    pub(crate) id: i64,
    pub(crate) text: String,
    pub(crate) is_correct: bool,
}

/// A question together with its correct answers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QuestionKey {
    pub(crate) question_id: i64,
    pub(crate) question_type: QuestionType,
    pub(crate) content: String,
    pub(crate) marks: f64,
    pub(crate) options: Vec<KeyOption>,
}

/// Questions assigned to an exam, in presentation order, plus the exam's total marks.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AnswerKey {
    pub(crate) total_marks: f64,
    pub(crate) questions: Vec<QuestionKey>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Grade {
    pub(crate) is_correct: bool,
    pub(crate) marks_awarded: f64,
}

impl Grade {
    const WRONG: Grade = Grade { is_correct: false, marks_awarded: 0.0 };

    fn full(marks: f64) -> Self {
        Grade { is_correct: true, marks_awarded: marks }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AnswerGrade {
    pub(crate) question_id: i64,
    pub(crate) grade: Grade,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SessionGrade {
    pub(crate) answers: Vec<AnswerGrade>,
    pub(crate) score: f64,
    pub(crate) percentage: f64,
}

impl QuestionKey {
    pub(crate) fn from_rows(question: Question, options: Vec<QuestionOption>) -> Self {
        let mut options = options;
        options.sort_by_key(|option| (option.order_index, option.id));
        Self {
            question_id: question.id,
            question_type: question.question_type,
            content: question.content,
            marks: question.marks,
            options: options
                .into_iter()
                .map(|option| KeyOption {
                    id: option.id,
                    text: option.option_text,
                    is_correct: option.is_correct,
                })
                .collect(),
        }
    }

    pub(crate) fn has_option(&self, option_id: i64) -> bool {
        self.options.iter().any(|option| option.id == option_id)
    }

    fn correct_ids(&self) -> BTreeSet<i64> {
        self.options.iter().filter(|option| option.is_correct).map(|option| option.id).collect()
    }

    /// Expected text for fill-blank questions. Without an option flagged correct nothing matches.
    fn expected_text(&self) -> Option<&str> {
        self.options.iter().find(|option| option.is_correct).map(|option| option.text.as_str())
    }
}

impl AnswerKey {
    pub(crate) fn question(&self, question_id: i64) -> Option<&QuestionKey> {
        self.questions.iter().find(|question| question.question_id == question_id)
    }
}

pub(crate) fn grade_answer(question: &QuestionKey, value: &AnswerValue) -> Grade {
    match question.question_type {
        QuestionType::MultipleChoice | QuestionType::TrueFalse => {
            let Some(&[selected]) = value.as_options() else {
                return Grade::WRONG;
            };
            let correct = question.options.iter().find(|option| option.is_correct);
            match correct {
                Some(option) if option.id == selected => Grade::full(question.marks),
                _ => Grade::WRONG,
            }
        }
        QuestionType::SelectAll => {
            let Some(selected) = value.as_options() else {
                return Grade::WRONG;
            };
            let selected: BTreeSet<i64> = selected.iter().copied().collect();
            if selected == question.correct_ids() {
                Grade::full(question.marks)
            } else {
                Grade::WRONG
            }
        }
        QuestionType::FillBlank => {
            let (Some(submitted), Some(expected)) = (value.as_text(), question.expected_text())
            else {
                return Grade::WRONG;
            };
            if normalize_text(submitted) == normalize_text(expected) {
                Grade::full(question.marks)
            } else {
                Grade::WRONG
            }
        }
        // Left for manual review.
        QuestionType::ShortAnswer => Grade::WRONG,
    }
}

/// Grades every stored answer. Answers to questions no longer on the exam earn nothing.
pub(crate) fn grade_session(key: &AnswerKey, answers: &[Answer]) -> SessionGrade {
    let questions: HashMap<i64, &QuestionKey> =
        key.questions.iter().map(|question| (question.question_id, question)).collect();

    let graded: Vec<AnswerGrade> = answers
        .iter()
        .map(|answer| AnswerGrade {
            question_id: answer.question_id,
            grade: questions
                .get(&answer.question_id)
                .map(|question| grade_answer(question, &answer.value))
                .unwrap_or(Grade::WRONG),
        })
        .collect();

    let score: f64 = graded.iter().map(|item| item.grade.marks_awarded).sum();
    SessionGrade { percentage: percentage(score, key.total_marks), answers: graded, score }
}

/// `score / total * 100` rounded to two decimals. A zero total divides by one instead.
pub(crate) fn percentage(score: f64, total_marks: f64) -> f64 {
    let divisor = if total_marks == 0.0 { 1.0 } else { total_marks };
    round2(score / divisor * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn normalize_text(value: &str) -> String {
    value.trim().to_lowercase()
}
