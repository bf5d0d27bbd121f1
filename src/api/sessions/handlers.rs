use axum::{
    extract::{Path, State},
    Json,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentStudent;
use crate::core::state::AppState;
use crate::schemas::session::{
    AnswerResponse, ExamInfoResponse, QuestionResponse, RemainingTimeResponse, SaveAnswerRequest,
    SaveAnswerResponse, SessionResultResponse, SessionStateResponse, SessionSummaryResponse,
    StartSessionResponse, TabSwitchResponse,
};

pub(super) async fn start_session(
    Path(exam_id): Path<String>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let started = state.engine().start(&exam_id, &student_id).await?;

    Ok(Json(StartSessionResponse {
        session_id: started.session.id,
        attempt_number: started.session.attempt_number,
        remaining_seconds: started.remaining_seconds,
        resumed: started.resumed,
    }))
}

pub(super) async fn session_state(
    Path(session_id): Path<String>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<SessionStateResponse>, ApiError> {
    let resume = state.engine().resume_state(&session_id, &student_id).await?;
    let threshold = state.engine().policy().tab_switch_flag_threshold;

    Ok(Json(SessionStateResponse {
        session: SessionSummaryResponse::from_session(&resume.session, threshold),
        exam: ExamInfoResponse::from(&resume.exam),
        remaining_seconds: resume.remaining_seconds,
        questions: resume.questions.iter().map(QuestionResponse::from).collect(),
        answers: resume.answers.iter().map(AnswerResponse::from).collect(),
    }))
}

pub(super) async fn list_answers(
    Path(session_id): Path<String>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<Vec<AnswerResponse>>, ApiError> {
    let answers = state.engine().answers(&session_id, &student_id).await?;
    Ok(Json(answers.iter().map(AnswerResponse::from).collect()))
}

pub(super) async fn save_answer(
    Path((session_id, question_id)): Path<(String, i64)>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
    Json(payload): Json<SaveAnswerRequest>,
) -> Result<Json<SaveAnswerResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let left = state
        .engine()
        .save_answer(&session_id, &student_id, question_id, payload.answer)
        .await?;

    Ok(Json(SaveAnswerResponse {
        question_id,
        saved: true,
        remaining_seconds: left.remaining_seconds,
    }))
}

pub(super) async fn submit_session(
    Path(session_id): Path<String>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<SessionSummaryResponse>, ApiError> {
    let session = state.engine().submit(&session_id, &student_id).await?;
    let threshold = state.engine().policy().tab_switch_flag_threshold;
    Ok(Json(SessionSummaryResponse::from_session(&session, threshold)))
}

pub(super) async fn auto_submit_session(
    Path(session_id): Path<String>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<SessionSummaryResponse>, ApiError> {
    let session = state.engine().auto_submit(&session_id, &student_id).await?;
    let threshold = state.engine().policy().tab_switch_flag_threshold;
    Ok(Json(SessionSummaryResponse::from_session(&session, threshold)))
}

pub(super) async fn remaining_time(
    Path(session_id): Path<String>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<RemainingTimeResponse>, ApiError> {
    let poll = state.engine().poll_time(&session_id, &student_id).await?;

    Ok(Json(RemainingTimeResponse {
        remaining_seconds: poll.remaining_seconds,
        time_expired: poll.time_expired,
    }))
}

/// Blur and visibility events for a single switch arrive back to back; only the first report
/// inside the dedup window is counted.
pub(super) async fn log_tab_switch(
    Path(session_id): Path<String>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<TabSwitchResponse>, ApiError> {
    let window = state.settings().exam().tab_switch_dedup_seconds;
    let key = format!("exam-engine:tab-switch:{session_id}:{student_id}");

    let counted = match state.redis().claim_window(&key, window).await {
        Ok(first) => first,
        Err(err) => {
            tracing::warn!(
                error = %err,
                session_id = %session_id,
                "Tab-switch dedup unavailable; counting report"
            );
            true
        }
    };

    let status = if counted {
        state.engine().increment_tab_switch(&session_id, &student_id).await?
    } else {
        state.engine().tab_switch_status(&session_id, &student_id).await?
    };

    Ok(Json(TabSwitchResponse { count: status.count, flagged: status.flagged, counted }))
}

pub(super) async fn session_result(
    Path(session_id): Path<String>,
    CurrentStudent(student_id): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<SessionResultResponse>, ApiError> {
    let result = state.engine().session_result(&session_id, &student_id).await?;
    let threshold = state.engine().policy().tab_switch_flag_threshold;

    Ok(Json(SessionResultResponse {
        session: SessionSummaryResponse::from_session(&result.session, threshold),
        exam: ExamInfoResponse::from(&result.exam),
        answers: result.answers.iter().map(AnswerResponse::from).collect(),
        flagged: result.flagged,
        passed: result.passed,
    }))
}
