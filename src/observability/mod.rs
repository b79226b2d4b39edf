use tracing_subscriber::EnvFilter;

use crate::relay::{EndReason, SessionReport};

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
pub fn init_tracing(log_level: &str) {
    let Some(directive) = filter_directive(log_level) else {
        return;
    };

    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn filter_directive(log_level: &str) -> Option<String> {
    let level = log_level.trim().to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Emit the single summary line for a finished stream session.
///
/// Failed and disconnected sessions log at `warn`, everything else at `info`.
pub fn log_session_complete(report: &SessionReport) {
    let elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX);
    let failure = match &report.end {
        EndReason::UpstreamFailed(failure) => Some(failure.to_string()),
        _ => None,
    };

    if is_abnormal(&report.end) || report.persisted_turn.is_none() {
        tracing::warn!(
            session_id = %report.session_id,
            thread_id = report.thread_id,
            end = report.end.as_str(),
            error = failure.as_deref().unwrap_or(""),
            chars = report.content.len(),
            fragments = report.fragments,
            skipped = report.skipped,
            finish_reason = report.finish_reason.as_deref().unwrap_or(""),
            fallback = report.fallback,
            persisted_turn = ?report.persisted_turn,
            done_sent = report.done_sent,
            elapsed_ms,
            "stream session closed"
        );
    } else {
        tracing::info!(
            session_id = %report.session_id,
            thread_id = report.thread_id,
            end = report.end.as_str(),
            chars = report.content.len(),
            fragments = report.fragments,
            skipped = report.skipped,
            finish_reason = report.finish_reason.as_deref().unwrap_or(""),
            fallback = report.fallback,
            persisted_turn = ?report.persisted_turn,
            done_sent = report.done_sent,
            elapsed_ms,
            "stream session closed"
        );
    }
}

fn is_abnormal(end: &EndReason) -> bool {
    matches!(
        end,
        EndReason::UpstreamFailed(_) | EndReason::ClientDisconnected
    )
}
