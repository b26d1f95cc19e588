//! Usage: Attempt cascade controller (model queue iteration + recitation recovery + terminal outcome).

mod attempt_record;
mod finalize;
mod stream_relay;
#[cfg(test)]
mod tests;

use super::super::failover::{CascadeDecision, ModelQueue, ModelSource, RecitationRecovery};
use super::super::types::VariantConfig;
use crate::gateway::events::{Attempt, AttemptStatus, MetaEvent, StreamMessage, TerminalErrorCode};
use crate::gateway::streams::{EventSink, SinkError};
use crate::gateway::upstream::{FinishSignal, GenerationBackend, PromptPart, UpstreamRequest};
use attempt_record::{AttemptLog, Settlement};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_relay::{relay_attempt, RelayCtx, RelayOutcome};

const ERR_FINISH_REASON: &str = "GW_UPSTREAM_FINISH_REASON";
const ERR_ENDED_WITHOUT_FINISH: &str = "GW_STREAM_ENDED_WITHOUT_FINISH";

/// `None` disables the bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct RelayTimeouts {
    pub(super) first_byte: Option<Duration>,
    pub(super) idle: Option<Duration>,
}

impl RelayTimeouts {
    pub(super) fn from_seconds(first_byte: u32, idle: u32) -> Self {
        let bound = |secs: u32| (secs > 0).then(|| Duration::from_secs(u64::from(secs)));
        Self {
            first_byte: bound(first_byte),
            idle: bound(idle),
        }
    }
}

pub(super) struct CascadeInput {
    pub(super) backend: Arc<dyn GenerationBackend>,
    pub(super) sink: EventSink,
    pub(super) trace_id: String,
    pub(super) config: VariantConfig,
    pub(super) parts: Arc<Vec<PromptPart>>,
    pub(super) response_schema: Option<Arc<Value>>,
    pub(super) api_key: String,
    pub(super) queue: ModelQueue,
    pub(super) recovery: RecitationRecovery,
    pub(super) timeouts: RelayTimeouts,
    pub(super) started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CascadeOutcome {
    Success,
    ContentPolicyExhausted,
    AllModelsExhausted,
    ClientGone,
    /// A message could not be framed; the stream was closed early.
    SinkFailed,
}

impl CascadeOutcome {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ContentPolicyExhausted => "content_policy_exhausted",
            Self::AllModelsExhausted => "all_models_exhausted",
            Self::ClientGone => "client_gone",
            Self::SinkFailed => "sink_failed",
        }
    }

    pub(super) fn terminal_code(self) -> Option<TerminalErrorCode> {
        match self {
            Self::ContentPolicyExhausted => Some(TerminalErrorCode::ContentPolicyExhausted),
            Self::AllModelsExhausted => Some(TerminalErrorCode::AllModelsExhausted),
            Self::Success | Self::ClientGone | Self::SinkFailed => None,
        }
    }
}

#[derive(Debug)]
pub(super) struct CascadeReport {
    pub(super) outcome: CascadeOutcome,
    pub(super) attempts: Vec<Attempt>,
    pub(super) final_model: Option<String>,
    pub(super) last_error_code: Option<String>,
    pub(super) first_output_ms: Option<u128>,
}

struct LastError {
    code: String,
    message: String,
}

/// Drives attempts strictly one after another until one succeeds or both
/// model sources are exhausted. The sink is dropped on return, which closes
/// the outgoing stream right after the terminal event.
pub(super) async fn run(input: CascadeInput) -> CascadeReport {
    let CascadeInput {
        backend,
        sink,
        trace_id,
        config,
        parts,
        response_schema,
        api_key,
        mut queue,
        mut recovery,
        timeouts,
        started,
    } = input;

    let mut history = AttemptLog::default();
    let mut last_error: Option<LastError> = None;
    let mut first_output: Option<Instant> = None;

    let report = |outcome: CascadeOutcome,
                  history: AttemptLog,
                  final_model: Option<String>,
                  last_error: Option<LastError>,
                  first_output: Option<Instant>| CascadeReport {
        outcome,
        attempts: history.into_vec(),
        final_model,
        last_error_code: match outcome {
            CascadeOutcome::Success => None,
            _ => outcome
                .terminal_code()
                .map(|code| code.as_str().to_string())
                .or_else(|| last_error.map(|e| e.code)),
        },
        first_output_ms: first_output.map(|at| at.saturating_duration_since(started).as_millis()),
    };

    while let Some(model) = queue.next_model() {
        let attempt = history.start(&model);
        tracing::info!(trace_id = %trace_id, attempt, model = %model, "attempt started");

        let start_event = StreamMessage::Meta {
            event: MetaEvent::AttemptStart,
            attempt,
            model: model.clone(),
        };
        if let Err(err) = sink.emit(&start_event).await {
            let outcome = sink_outcome(&trace_id, &err);
            history.settle(sink_settlement(&err));
            return report(outcome, history, Some(model), last_error, first_output);
        }

        let request = UpstreamRequest {
            model: model.clone(),
            api_key: api_key.clone(),
            parts: Arc::clone(&parts),
            response_schema: response_schema.clone(),
            enable_search: config.enable_search,
        };
        let relay = RelayCtx {
            backend: backend.as_ref(),
            sink: &sink,
            attempt,
            relay_grounding: config.relay_grounding,
            timeouts,
        };
        let outcome = relay_attempt(relay, &request, &mut first_output).await;

        let decision = match outcome {
            RelayOutcome::Finished(FinishSignal::Stop) => {
                history.settle(Settlement::finished(AttemptStatus::Success, "STOP"));
                CascadeDecision::Finish
            }
            RelayOutcome::Finished(FinishSignal::Recitation) => {
                history.settle(Settlement::finished(
                    AttemptStatus::Recoverable,
                    FinishSignal::Recitation.as_str(),
                ));
                let reset = StreamMessage::Reset {
                    attempt,
                    model: model.clone(),
                    reason: "recitation".to_string(),
                    clear: true,
                };
                if let Err(err) = sink.emit(&reset).await {
                    let outcome = sink_outcome(&trace_id, &err);
                    return report(outcome, history, Some(model), last_error, first_output);
                }

                match recovery.next_model() {
                    Some(fallback) => {
                        let retry = StreamMessage::Meta {
                            event: MetaEvent::RetryingAfterRecitation,
                            attempt,
                            model: fallback.clone(),
                        };
                        if let Err(err) = sink.emit(&retry).await {
                            let outcome = sink_outcome(&trace_id, &err);
                            return report(outcome, history, Some(model), last_error, first_output);
                        }
                        queue.push_front(fallback);
                        CascadeDecision::Recover
                    }
                    None => CascadeDecision::Abort,
                }
            }
            RelayOutcome::Finished(FinishSignal::Other(reason)) => {
                let message = format!("upstream finished with reason {reason}");
                history.settle(Settlement {
                    status: AttemptStatus::Failed,
                    finish_reason: Some(reason.as_str()),
                    error_code: Some(ERR_FINISH_REASON),
                    error: Some(message.clone()),
                });
                last_error = Some(LastError {
                    code: ERR_FINISH_REASON.to_string(),
                    message,
                });
                CascadeDecision::Advance
            }
            RelayOutcome::EndedWithoutFinish => {
                let message = "stream ended without a finish signal".to_string();
                history.settle(Settlement::failed(
                    AttemptStatus::UnknownEnd,
                    ERR_ENDED_WITHOUT_FINISH,
                    message.clone(),
                ));
                last_error = Some(LastError {
                    code: ERR_ENDED_WITHOUT_FINISH.to_string(),
                    message,
                });
                CascadeDecision::Advance
            }
            RelayOutcome::Failed(err) => {
                let code = err.error_code();
                let message = err.to_string();
                history.settle(Settlement::failed(AttemptStatus::Failed, code, message.clone()));
                last_error = Some(LastError {
                    code: code.to_string(),
                    message,
                });
                CascadeDecision::Advance
            }
            RelayOutcome::SinkClosed(err) => {
                let outcome = sink_outcome(&trace_id, &err);
                history.settle(sink_settlement(&err));
                tracing::info!(trace_id = %trace_id, attempt, model = %model, "attempt abandoned");
                return report(outcome, history, Some(model), last_error, first_output);
            }
        };

        tracing::info!(
            trace_id = %trace_id,
            attempt,
            model = %model,
            decision = decision.as_str(),
            error_code = last_error.as_ref().map(|e| e.code.as_str()).unwrap_or(""),
            remaining = queue.len(),
            "attempt settled"
        );

        match decision {
            CascadeDecision::Finish => {
                return report(CascadeOutcome::Success, history, Some(model), None, first_output);
            }
            CascadeDecision::Abort => {
                let message =
                    finalize::content_policy_exhausted_message(recovery.occurrences(), recovery.limit());
                finalize::emit_terminal_error(
                    &sink,
                    &trace_id,
                    TerminalErrorCode::ContentPolicyExhausted,
                    message,
                    history.snapshot(),
                )
                .await;
                return report(
                    CascadeOutcome::ContentPolicyExhausted,
                    history,
                    Some(model),
                    last_error,
                    first_output,
                );
            }
            CascadeDecision::Recover | CascadeDecision::Advance => {}
        }
    }

    let message = finalize::all_models_exhausted_message(
        history.len(),
        last_error.as_ref().map(|e| e.message.as_str()),
    );
    finalize::emit_terminal_error(
        &sink,
        &trace_id,
        TerminalErrorCode::AllModelsExhausted,
        message,
        history.snapshot(),
    )
    .await;
    let final_model = history.last_model();
    report(
        CascadeOutcome::AllModelsExhausted,
        history,
        final_model,
        last_error,
        first_output,
    )
}

fn sink_settlement(err: &SinkError) -> Settlement<'static> {
    Settlement::failed(AttemptStatus::Failed, err.error_code(), err.to_string())
}

fn sink_outcome(trace_id: &str, err: &SinkError) -> CascadeOutcome {
    match err {
        SinkError::ClientGone => CascadeOutcome::ClientGone,
        SinkError::Frame { .. } => {
            tracing::error!(trace_id = %trace_id, error = %err, "stream closed early");
            CascadeOutcome::SinkFailed
        }
    }
}
