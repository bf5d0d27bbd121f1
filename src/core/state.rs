use std::sync::Arc;

use sqlx::PgPool;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::services::session_lifecycle::SessionLifecycle;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    engine: SessionLifecycle,
    redis: RedisHandle,
    db: Option<PgPool>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        engine: SessionLifecycle,
        redis: RedisHandle,
        db: Option<PgPool>,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, engine, redis, db }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn engine(&self) -> &SessionLifecycle {
        &self.inner.engine
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    /// `None` when the engine runs on a non-Postgres store.
    pub(crate) fn db(&self) -> Option<&PgPool> {
        self.inner.db.as_ref()
    }
}
