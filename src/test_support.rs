use std::sync::{Arc, OnceLock};

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api;
use crate::core::{
    config::Settings, redis::RedisHandle, security, state::AppState, time::ManualClock,
};
use crate::db::models::Exam;
use crate::db::types::QuestionType;
use crate::services::memory_store::InMemoryStore;
use crate::services::scoring::{AnswerKey, KeyOption, QuestionKey};
use crate::services::session_lifecycle::{EnginePolicy, SessionLifecycle};

const TEST_SECRET_KEY: &str = "test-secret";
const TEST_REDIS_DB: &str = "1";

/// Two multiple-choice questions worth 5 marks each; option 7 and option 9 are correct.
pub(crate) const CHOICE_EXAM: &str = "exam-choice";
/// A fill-blank question (expects "Paris") and a select-all question (options 30 and 31).
pub(crate) const MIXED_EXAM: &str = "exam-mixed";

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    pub(crate) store: InMemoryStore,
    pub(crate) clock: ManualClock,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    dotenvy::dotenv().ok();

    std::env::set_var("EXAM_ENGINE_ENV", "test");
    std::env::set_var("EXAM_ENGINE_STRICT_CONFIG", "0");
    std::env::set_var("SECRET_KEY", TEST_SECRET_KEY);
    std::env::set_var("REDIS_HOST", "127.0.0.1");
    std::env::set_var("REDIS_PORT", "6379");
    std::env::set_var("REDIS_DB", TEST_REDIS_DB);
    std::env::remove_var("REDIS_PASSWORD");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("TAB_SWITCH_FLAG_THRESHOLD");
    std::env::remove_var("PASS_PERCENTAGE");
    std::env::remove_var("TIME_SYNC_INTERVAL_SECONDS");
    std::env::remove_var("AUTO_SAVE_DEBOUNCE_MS");
}

fn option(id: i64, text: &str, is_correct: bool) -> KeyOption {
    KeyOption { id, text: text.to_string(), is_correct }
}

fn question(id: i64, question_type: QuestionType, options: Vec<KeyOption>) -> QuestionKey {
    QuestionKey {
        question_id: id,
        question_type,
        content: format!("Question {id}"),
        marks: 5.0,
        options,
    }
}

fn exam(id: &str, title: &str) -> Exam {
    Exam {
        id: id.to_string(),
        title: title.to_string(),
        description: None,
        duration_minutes: 10,
        total_marks: 10.0,
    }
}

pub(crate) fn seeded_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    store.insert_exam(
        exam(CHOICE_EXAM, "Choice quiz"),
        AnswerKey {
            total_marks: 10.0,
            questions: vec![
                question(
                    1,
                    QuestionType::MultipleChoice,
                    vec![option(7, "A", true), option(8, "B", false)],
                ),
                question(
                    2,
                    QuestionType::MultipleChoice,
                    vec![option(9, "C", true), option(10, "D", false)],
                ),
            ],
        },
    );
    store.insert_exam(
        exam(MIXED_EXAM, "Mixed quiz"),
        AnswerKey {
            total_marks: 10.0,
            questions: vec![
                question(3, QuestionType::FillBlank, vec![option(20, "Paris", true)]),
                question(
                    4,
                    QuestionType::SelectAll,
                    vec![option(30, "x", true), option(31, "y", true), option(32, "z", false)],
                ),
            ],
        },
    );
    store
}

pub(crate) fn engine_on(
    store: &InMemoryStore,
    clock: &ManualClock,
    policy: EnginePolicy,
) -> SessionLifecycle {
    SessionLifecycle::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        policy,
    )
}

pub(crate) async fn setup_test_context() -> TestContext {
    let guard = env_lock().await;
    set_test_env();

    let settings = Settings::load().expect("settings");
    let store = seeded_store();
    let clock = ManualClock::new();
    let engine = engine_on(&store, &clock, EnginePolicy::from_settings(settings.exam()));

    // Left disconnected: tab-switch reports are never coalesced in tests.
    let redis = RedisHandle::new(settings.redis().redis_url());

    let state = AppState::new(settings, engine, redis, None);
    let app = api::router::router(state.clone());

    TestContext { state, app, store, clock, _guard: guard }
}

pub(crate) fn bearer_token(student_id: &str, settings: &Settings) -> String {
    security::create_access_token(student_id, settings, time::Duration::minutes(30))
        .expect("token")
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}

/// Pool on `DATABASE_URL`, migrated and emptied. `None` when the variable is unset or does not
/// name a database ending in `_test`, since every table is truncated.
pub(crate) async fn prepare_db() -> Option<PgPool> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty())?;

    let db = PgPoolOptions::new().max_connections(5).connect(&database_url).await.expect("db pool");
    let current_db: String = sqlx::query_scalar("SELECT current_database()")
        .fetch_one(&db)
        .await
        .expect("current database");
    if !current_db.ends_with("_test") {
        eprintln!("refusing to truncate {current_db}: Postgres tests need a *_test database");
        return None;
    }

    crate::db::run_migrations(&db).await.expect("migrations");
    reset_db(&db).await.expect("reset db");
    Some(db)
}

pub(crate) async fn reset_db(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "TRUNCATE answers, exam_sessions, exam_assignments, exam_questions, question_options, \
         questions, exams RESTART IDENTITY CASCADE",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Ids of a seeded multiple-choice question and its two options.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SeededQuestion {
    pub(crate) id: i64,
    pub(crate) correct: i64,
    pub(crate) wrong: i64,
}

/// Inserts a 10 minute exam with two multiple-choice questions worth 5 marks each.
pub(crate) async fn insert_choice_exam(pool: &PgPool, exam_id: &str) -> Vec<SeededQuestion> {
    sqlx::query(
        "INSERT INTO exams (id, title, duration_minutes, total_marks) \
         VALUES ($1, 'Postgres quiz', 10, 10)",
    )
    .bind(exam_id)
    .execute(pool)
    .await
    .expect("insert exam");

    let mut seeded = Vec::new();
    for order in 0..2 {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO questions (type, content, marks) \
             VALUES ('multiple_choice', $1, 5) RETURNING id",
        )
        .bind(format!("Question {}", order + 1))
        .fetch_one(pool)
        .await
        .expect("insert question");

        let mut option_ids = Vec::new();
        for (index, (text, is_correct)) in [("right", true), ("wrong", false)].iter().enumerate() {
            let option_id: i64 = sqlx::query_scalar(
                "INSERT INTO question_options (question_id, option_text, is_correct, order_index) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
            )
            .bind(id)
            .bind(*text)
            .bind(*is_correct)
            .bind(index as i32)
            .fetch_one(pool)
            .await
            .expect("insert option");
            option_ids.push(option_id);
        }

        sqlx::query(
            "INSERT INTO exam_questions (exam_id, question_id, question_order) VALUES ($1, $2, $3)",
        )
        .bind(exam_id)
        .bind(id)
        .bind(order)
        .execute(pool)
        .await
        .expect("link question");

        seeded.push(SeededQuestion { id, correct: option_ids[0], wrong: option_ids[1] });
    }
    seeded
}
