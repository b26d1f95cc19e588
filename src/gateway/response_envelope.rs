//! Usage: Collected-mode finalization (NDJSON answer accumulation, code-fence stripping, JSON parse).

use crate::gateway::events::{Attempt, MetaEvent, StreamMessage, TerminalErrorCode};
use serde_json::Value;
use std::collections::BTreeMap;

const FENCES: [&str; 2] = ["```", "~~~"];

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnvelopeError {
    #[error("invalid stream line: {0}")]
    InvalidLine(#[source] serde_json::Error),
    #[error("answer is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),
}

impl EnvelopeError {
    pub(crate) fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidLine(_) => "GW_NDJSON_DECODE_FAILED",
            Self::NotJson(_) => "GW_ANSWER_NOT_JSON",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FinalAnswer {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CollectedAnswer {
    pub(crate) attempt: u32,
    pub(crate) model: String,
    pub(crate) text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CollectedFailure {
    pub(crate) code: TerminalErrorCode,
    pub(crate) message: String,
    pub(crate) retryable: bool,
    pub(crate) attempts: Vec<Attempt>,
}

#[derive(Debug, Default)]
struct AttemptBuffer {
    model: String,
    text: String,
}

/// Rebuilds the final answer from a message stream: every attempt gets its own
/// buffer, `reset` clears it, and only the last attempt counts.
#[derive(Debug, Default)]
pub(crate) struct AnswerAccumulator {
    buffers: BTreeMap<u32, AttemptBuffer>,
    last_attempt: Option<u32>,
    failure: Option<CollectedFailure>,
}

impl AnswerAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_line(&mut self, line: &str) -> Result<(), EnvelopeError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let message: StreamMessage =
            serde_json::from_str(line).map_err(EnvelopeError::InvalidLine)?;
        self.push_message(&message);
        Ok(())
    }

    pub(crate) fn push_message(&mut self, message: &StreamMessage) {
        match message {
            StreamMessage::Meta {
                event: MetaEvent::AttemptStart,
                attempt,
                model,
            } => {
                self.buffers.insert(
                    *attempt,
                    AttemptBuffer {
                        model: model.clone(),
                        text: String::new(),
                    },
                );
                self.last_attempt = Some(*attempt);
            }
            StreamMessage::Reset { attempt, .. } => {
                if let Some(buffer) = self.buffers.get_mut(attempt) {
                    buffer.text.clear();
                }
            }
            StreamMessage::Answer {
                attempt,
                model,
                text,
            } => {
                let buffer = self.buffers.entry(*attempt).or_insert_with(|| AttemptBuffer {
                    model: model.clone(),
                    text: String::new(),
                });
                buffer.text.push_str(text);
                if self.last_attempt.map_or(true, |last| *attempt >= last) {
                    self.last_attempt = Some(*attempt);
                }
            }
            StreamMessage::Error {
                code,
                message,
                retryable,
                attempts,
            } => {
                self.failure = Some(CollectedFailure {
                    code: *code,
                    message: message.clone(),
                    retryable: *retryable,
                    attempts: attempts.clone().unwrap_or_default(),
                });
            }
            StreamMessage::Meta { .. }
            | StreamMessage::Thought { .. }
            | StreamMessage::Debug { .. }
            | StreamMessage::Grounding { .. } => {}
        }
    }

    pub(crate) fn finish(mut self) -> Result<CollectedAnswer, CollectedFailure> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }
        let last = self
            .last_attempt
            .and_then(|attempt| self.buffers.remove(&attempt).map(|b| (attempt, b)));
        match last {
            Some((attempt, buffer)) => Ok(CollectedAnswer {
                attempt,
                model: buffer.model,
                text: buffer.text,
            }),
            None => Err(CollectedFailure {
                code: TerminalErrorCode::AllModelsExhausted,
                message: "stream ended before any attempt started".to_string(),
                retryable: TerminalErrorCode::AllModelsExhausted.retryable(),
                attempts: Vec::new(),
            }),
        }
    }
}

/// Strips one Markdown code fence (``` or ~~~, optional language tag) around
/// the text. Unfenced text is returned trimmed.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(fence) = FENCES.into_iter().find(|f| trimmed.starts_with(*f)) else {
        return trimmed;
    };

    let after_open = trimmed[fence.len()..].trim_start_matches(fence.chars().next().unwrap_or('`'));
    let body = match after_open.rfind(fence) {
        Some(end) => &after_open[..end],
        None => after_open,
    };
    let body = body.trim_end_matches(fence.chars().next().unwrap_or('`'));

    match body.split_once('\n') {
        // First line holds the (possibly empty) language tag.
        Some((tag_line, rest)) if is_language_tag(tag_line) => rest.trim(),
        Some(_) => body.trim(),
        None => strip_inline_tag(body.trim()),
    }
}

fn is_language_tag(line: &str) -> bool {
    let line = line.trim();
    line.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
}

fn strip_inline_tag(body: &str) -> &str {
    if body.starts_with(['{', '[', '"']) {
        return body;
    }
    match body.split_once(char::is_whitespace) {
        Some((tag, rest)) if is_language_tag(tag) && !rest.trim().is_empty() => rest.trim(),
        _ => body,
    }
}

pub(crate) fn finalize_answer(
    text: &str,
    schema_constrained: bool,
) -> Result<FinalAnswer, EnvelopeError> {
    if !schema_constrained {
        return Ok(FinalAnswer::Text(text.to_string()));
    }
    serde_json::from_str(strip_code_fence(text))
        .map(FinalAnswer::Json)
        .map_err(EnvelopeError::NotJson)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fence_styles_all_yield_same_object() {
        let expected = json!({"name": "Ada", "tags": ["x", "y"]});
        let inputs = [
            "```json\n{\"name\": \"Ada\", \"tags\": [\"x\", \"y\"]}\n```",
            "```\n{\"name\": \"Ada\", \"tags\": [\"x\", \"y\"]}\n```",
            "~~~json\n{\"name\": \"Ada\", \"tags\": [\"x\", \"y\"]}\n~~~",
            "```json {\"name\": \"Ada\", \"tags\": [\"x\", \"y\"]}```",
            "```{\"name\": \"Ada\", \"tags\": [\"x\", \"y\"]}```",
            "  {\"name\": \"Ada\", \"tags\": [\"x\", \"y\"]}  ",
        ];
        for input in inputs {
            assert_eq!(
                finalize_answer(input, true).expect(input),
                FinalAnswer::Json(expected.clone()),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn unconstrained_answers_skip_parsing() {
        assert_eq!(
            finalize_answer("```not json```", false).expect("text"),
            FinalAnswer::Text("```not json```".to_string())
        );
    }

    #[test]
    fn parse_failure_is_an_envelope_error() {
        let err = finalize_answer("```json\n{oops\n```", true).unwrap_err();
        assert_eq!(err.error_code(), "GW_ANSWER_NOT_JSON");
    }

    #[test]
    fn accumulator_keeps_only_last_attempt_and_honors_reset() {
        let lines = [
            r#"{"type":"meta","event":"attempt_start","attempt":1,"model":"A"}"#,
            r#"{"type":"answer","attempt":1,"model":"A","text":"copied "}"#,
            r#"{"type":"reset","attempt":1,"model":"A","reason":"recitation","clear":true}"#,
            r#"{"type":"meta","event":"retrying_after_recitation","attempt":1,"model":"F1"}"#,
            r#"{"type":"meta","event":"attempt_start","attempt":2,"model":"F1"}"#,
            r#"{"type":"thought","attempt":2,"model":"F1","text":"hmm"}"#,
            r#"{"type":"answer","attempt":2,"model":"F1","text":"```json\n{\"a\":"}"#,
            r#"{"type":"answer","attempt":2,"model":"F1","text":"1}\n```"}"#,
            "",
        ];
        let mut acc = AnswerAccumulator::new();
        for line in lines {
            acc.push_line(line).expect("line");
        }
        let answer = acc.finish().expect("answer");
        assert_eq!(answer.attempt, 2);
        assert_eq!(answer.model, "F1");
        assert_eq!(
            finalize_answer(&answer.text, true).expect("json"),
            FinalAnswer::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn accumulator_surfaces_terminal_error() {
        let mut acc = AnswerAccumulator::new();
        acc.push_line(r#"{"type":"meta","event":"attempt_start","attempt":1,"model":"A"}"#)
            .expect("meta");
        acc.push_line(
            r#"{"type":"error","code":"all-models-exhausted","message":"all 1 model attempts failed; last error: x","retryable":true,"attempts":[{"attempt":1,"model":"A","status":"failed"}]}"#,
        )
        .expect("error");
        let failure = acc.finish().unwrap_err();
        assert_eq!(failure.code, TerminalErrorCode::AllModelsExhausted);
        assert!(failure.retryable);
        assert_eq!(failure.attempts.len(), 1);
    }

    #[test]
    fn invalid_line_is_rejected() {
        let mut acc = AnswerAccumulator::new();
        let err = acc.push_line("{not json").unwrap_err();
        assert_eq!(err.error_code(), "GW_NDJSON_DECODE_FAILED");
    }
}
