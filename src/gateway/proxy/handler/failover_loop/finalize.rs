//! Usage: Terminal error events for the two exhausted states of the cascade.

use crate::gateway::events::{Attempt, StreamMessage, TerminalErrorCode};
use crate::gateway::streams::EventSink;

pub(super) fn content_policy_exhausted_message(rejections: usize, fallbacks: usize) -> String {
    format!(
        "recitation finish on {rejections} attempts; all {fallbacks} fallback models exhausted"
    )
}

pub(super) fn all_models_exhausted_message(attempts: usize, last_error: Option<&str>) -> String {
    format!(
        "all {attempts} model attempts failed; last error: {}",
        last_error.unwrap_or("none")
    )
}

/// Writes the single terminal `error` event. An undeliverable event only gets
/// a log line.
pub(super) async fn emit_terminal_error(
    sink: &EventSink,
    trace_id: &str,
    code: TerminalErrorCode,
    message: String,
    attempts: Vec<Attempt>,
) {
    tracing::warn!(
        trace_id = %trace_id,
        error_code = code.as_str(),
        attempts = attempts.len(),
        "{message}"
    );
    let event = StreamMessage::terminal_error(code, message, attempts);
    if let Err(err) = sink.emit(&event).await {
        tracing::warn!(trace_id = %trace_id, error = %err, "terminal error not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_messages_name_counts_and_last_error() {
        assert_eq!(
            all_models_exhausted_message(3, Some("upstream returned status 503: busy")),
            "all 3 model attempts failed; last error: upstream returned status 503: busy"
        );
        assert_eq!(
            all_models_exhausted_message(0, None),
            "all 0 model attempts failed; last error: none"
        );
        assert!(content_policy_exhausted_message(3, 2).contains("2 fallback models"));
    }
}
