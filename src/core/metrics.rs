use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;
use crate::db::types::SessionStatus;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled || PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

pub(crate) fn session_started(resumed: bool) {
    let outcome = if resumed { "resumed" } else { "created" };
    metrics::counter!("exam_sessions_started_total", "outcome" => outcome).increment(1);
}

pub(crate) fn answer_saved() {
    metrics::counter!("exam_answers_saved_total").increment(1);
}

pub(crate) fn session_finalized(status: SessionStatus) {
    metrics::counter!("exam_sessions_finalized_total", "status" => status.as_str()).increment(1);
}

pub(crate) fn tab_switch_recorded(flagged_now: bool) {
    metrics::counter!("exam_tab_switches_total").increment(1);
    if flagged_now {
        metrics::counter!("exam_sessions_flagged_total").increment(1);
    }
}
