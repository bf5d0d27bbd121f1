mod handlers;

use axum::{routing::get, routing::post, routing::put, Router};

use crate::core::state::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/exams/:exam_id/start", post(handlers::start_session))
        .route("/:session_id/state", get(handlers::session_state))
        .route("/:session_id/answers", get(handlers::list_answers))
        .route("/:session_id/answers/:question_id", put(handlers::save_answer))
        .route("/:session_id/submit", post(handlers::submit_session))
        .route("/:session_id/auto-submit", post(handlers::auto_submit_session))
        .route("/:session_id/remaining-time", get(handlers::remaining_time))
        .route("/:session_id/tab-switch", post(handlers::log_tab_switch))
        .route("/:session_id/result", get(handlers::session_result))
}
