pub(crate) mod api;
pub(crate) mod client;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::time::SystemClock;
use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::services::session_lifecycle::{EnginePolicy, SessionLifecycle};
use crate::services::store::PgStore;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; tab-switch dedup disabled");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let store = Arc::new(PgStore::new(db_pool.clone()));
    let engine = SessionLifecycle::new(
        store.clone(),
        store,
        Arc::new(SystemClock),
        EnginePolicy::from_settings(settings.exam()),
    );
    let state = AppState::new(settings, engine, redis.clone(), Some(db_pool));

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Exam engine API listening"
    );

    let result =
        axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await;

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

/// Entry point for the `exam_client` binary: takes one exam from the terminal.
pub async fn run_client() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;

    let args = client::ClientArgs::parse(&settings, std::env::args().skip(1))?;
    tracing::info!(exam_id = %args.exam_id, base_url = %args.base_url, "Starting exam client");

    client::run(&settings, args).await
}
