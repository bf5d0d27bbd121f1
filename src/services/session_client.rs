//! HTTP driver for one exam attempt, the way a browser tab would run it.
//!
//! [`run_time_sync`] keeps a [`Countdown`] honest against the server and requests auto-submit
//! when the local clock reaches zero. The server still decides; a lost auto-submit call is
//! caught by the next lazy expiry check.

use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::core::config::ExamSettings;
use crate::schemas::session::{
    AnswerResponse, RemainingTimeResponse, SaveAnswerRequest, SaveAnswerResponse,
    SessionResultResponse, SessionStateResponse, SessionSummaryResponse, StartSessionResponse,
    TabSwitchResponse,
};
use crate::services::answer_codec::AnswerValue;
use crate::services::countdown::{AnswerDebouncer, Countdown};

#[derive(Debug, Error)]
pub(crate) enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {detail}")]
    Api { status: u16, detail: String },
}

impl ClientError {
    pub(crate) fn is_time_expired(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::GONE.as_u16())
    }

    /// The session is no longer accepting writes.
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::CONFLICT.as_u16())
            || self.is_time_expired()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// Timing knobs the browser receives from the server configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncConfig {
    pub(crate) sync_interval: Duration,
    pub(crate) debounce: Duration,
}

impl SyncConfig {
    pub(crate) fn from_settings(settings: &ExamSettings) -> Self {
        Self {
            sync_interval: Duration::from_secs(settings.time_sync_interval_seconds),
            debounce: Duration::from_millis(settings.auto_save_debounce_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SessionClient {
    client: Client,
    base_url: String,
    token: String,
}

impl SessionClient {
    /// `base_url` points at the sessions router, e.g. `http://host/api/v1/sessions`.
    pub(crate) fn new(
        base_url: &str,
        token: String,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder().connect_timeout(timeout).timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), token })
    }

    pub(crate) async fn start(&self, exam_id: &str) -> Result<StartSessionResponse, ClientError> {
        let url = format!("{}/exams/{exam_id}/start", self.base_url);
        self.send(self.client.post(url)).await
    }

    pub(crate) async fn state(
        &self,
        session_id: &str,
    ) -> Result<SessionStateResponse, ClientError> {
        let url = format!("{}/{session_id}/state", self.base_url);
        self.send(self.client.get(url)).await
    }

    pub(crate) async fn answers(
        &self,
        session_id: &str,
    ) -> Result<Vec<AnswerResponse>, ClientError> {
        let url = format!("{}/{session_id}/answers", self.base_url);
        self.send(self.client.get(url)).await
    }

    pub(crate) async fn save_answer(
        &self,
        session_id: &str,
        question_id: i64,
        answer: AnswerValue,
    ) -> Result<SaveAnswerResponse, ClientError> {
        let url = format!("{}/{session_id}/answers/{question_id}", self.base_url);
        self.send(self.client.put(url).json(&SaveAnswerRequest { answer })).await
    }

    pub(crate) async fn submit(
        &self,
        session_id: &str,
    ) -> Result<SessionSummaryResponse, ClientError> {
        let url = format!("{}/{session_id}/submit", self.base_url);
        self.send(self.client.post(url)).await
    }

    pub(crate) async fn auto_submit(
        &self,
        session_id: &str,
    ) -> Result<SessionSummaryResponse, ClientError> {
        let url = format!("{}/{session_id}/auto-submit", self.base_url);
        self.send(self.client.post(url)).await
    }

    pub(crate) async fn remaining_time(
        &self,
        session_id: &str,
    ) -> Result<RemainingTimeResponse, ClientError> {
        let url = format!("{}/{session_id}/remaining-time", self.base_url);
        self.send(self.client.get(url)).await
    }

    pub(crate) async fn tab_switch(
        &self,
        session_id: &str,
    ) -> Result<TabSwitchResponse, ClientError> {
        let url = format!("{}/{session_id}/tab-switch", self.base_url);
        self.send(self.client.post(url)).await
    }

    pub(crate) async fn result(
        &self,
        session_id: &str,
    ) -> Result<SessionResultResponse, ClientError> {
        let url = format!("{}/{session_id}/result", self.base_url);
        self.send(self.client.get(url)).await
    }

    /// Sends every debounced answer that is due at `now`. Returns how many were saved.
    pub(crate) async fn flush_due(
        &self,
        session_id: &str,
        debouncer: &mut AnswerDebouncer,
        now: Instant,
    ) -> Result<usize, ClientError> {
        self.save_all(session_id, debouncer.drain_due(now)).await
    }

    /// Submits after pushing whatever is still waiting in the debouncer.
    pub(crate) async fn submit_with_pending(
        &self,
        session_id: &str,
        debouncer: &mut AnswerDebouncer,
    ) -> Result<SessionSummaryResponse, ClientError> {
        self.save_all(session_id, debouncer.flush()).await?;
        self.submit(session_id).await
    }

    async fn save_all(
        &self,
        session_id: &str,
        answers: Vec<(i64, AnswerValue)>,
    ) -> Result<usize, ClientError> {
        let mut saved = 0;
        for (question_id, answer) in answers {
            self.save_answer(session_id, question_id, answer).await?;
            saved += 1;
        }
        Ok(saved)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let raw_body = response.text().await?;
        let detail = serde_json::from_str::<ErrorBody>(&raw_body)
            .map(|body| body.detail)
            .unwrap_or(raw_body);
        Err(ClientError::Api { status: status.as_u16(), detail })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    /// The local countdown hit zero and this loop finalized the session.
    AutoSubmitted,
    /// The server reported the session closed, either expired or submitted elsewhere.
    ClosedByServer,
    Stopped,
}

/// Ticks `countdown` once a second and replaces it with the server value every
/// `config.sync_interval`. Sync failures that are not a closed session are logged and retried
/// on the next interval.
pub(crate) async fn run_time_sync(
    client: &SessionClient,
    session_id: &str,
    countdown: &mut Countdown,
    config: SyncConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SyncOutcome, ClientError> {
    let sync_interval = config.sync_interval;
    let one_second = Duration::from_secs(1);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + one_second, one_second);
    let mut sync =
        tokio::time::interval_at(tokio::time::Instant::now() + sync_interval, sync_interval);

    loop {
        if *shutdown.borrow() {
            return Ok(SyncOutcome::Stopped);
        }

        let expired = tokio::select! {
            _ = ticker.tick() => countdown.tick(),
            _ = sync.tick() => match client.remaining_time(session_id).await {
                Ok(poll) if poll.time_expired => {
                    countdown.sync(0);
                    return Ok(SyncOutcome::ClosedByServer);
                }
                Ok(poll) => countdown.sync(poll.remaining_seconds),
                Err(err) if err.is_closed() => return Ok(SyncOutcome::ClosedByServer),
                Err(err) => {
                    tracing::warn!(error = %err, session_id, "Time sync failed");
                    false
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(SyncOutcome::Stopped);
                }
                false
            }
        };

        if expired {
            tracing::info!(session_id, "Countdown reached zero; requesting auto-submit");
            return match client.auto_submit(session_id).await {
                Ok(_) => Ok(SyncOutcome::AutoSubmitted),
                Err(err) if err.is_closed() => Ok(SyncOutcome::ClosedByServer),
                Err(err) => Err(err),
            };
        }
    }
}
