use super::*;
use crate::gateway::proxy::types::RequestVariant;
use crate::gateway::upstream::testing::{Script, ScriptedBackend};
use crate::gateway::upstream::{TaggedText, UpstreamChunk, UpstreamError};
use crate::shared::stream_ext::next_item;
use serde_json::json;

fn models(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

struct Run {
    report: CascadeReport,
    messages: Vec<StreamMessage>,
    backend: Arc<ScriptedBackend>,
}

struct Setup<'a> {
    variant: RequestVariant,
    override_model: Option<&'a str>,
    queue: &'a [&'a str],
    fallbacks: &'a [&'a str],
    timeouts: RelayTimeouts,
}

impl Default for Setup<'_> {
    fn default() -> Self {
        Self {
            variant: RequestVariant::Generate,
            override_model: None,
            queue: &["A", "B", "C"],
            fallbacks: &["F1", "F2"],
            timeouts: RelayTimeouts::default(),
        }
    }
}

async fn drive(backend: ScriptedBackend, setup: Setup<'_>) -> Run {
    let backend = Arc::new(backend);
    let (sink, mut body) = EventSink::channel();
    let input = CascadeInput {
        backend: backend.clone(),
        sink,
        trace_id: "t-test".to_string(),
        config: setup.variant.config(),
        parts: Arc::new(vec![PromptPart::Text("2+2?".to_string())]),
        response_schema: None,
        api_key: "k".to_string(),
        queue: ModelQueue::for_request(setup.override_model, &models(setup.queue)),
        recovery: RecitationRecovery::new(&models(setup.fallbacks)),
        timeouts: setup.timeouts,
        started: Instant::now(),
    };
    let handle = tokio::spawn(run(input));

    let mut messages = Vec::new();
    while let Some(frame) = next_item(&mut body).await {
        let frame = frame.expect("infallible");
        let text = std::str::from_utf8(&frame).expect("utf8");
        assert!(text.ends_with('\n'), "frame must be newline-terminated");
        messages.push(serde_json::from_str(text.trim_end()).expect("message json"));
    }

    let report = handle.await.expect("cascade task");
    Run {
        report,
        messages,
        backend,
    }
}

fn count_kind(messages: &[StreamMessage], kind: &str) -> usize {
    messages.iter().filter(|m| m.kind() == kind).count()
}

fn statuses(report: &CascadeReport) -> Vec<AttemptStatus> {
    report.attempts.iter().map(|a| a.status).collect()
}

fn terminal_error(messages: &[StreamMessage]) -> Option<(TerminalErrorCode, bool, usize)> {
    messages.iter().find_map(|m| match m {
        StreamMessage::Error {
            code,
            retryable,
            attempts,
            ..
        } => Some((*code, *retryable, attempts.as_ref().map_or(0, Vec::len))),
        _ => None,
    })
}

#[tokio::test]
async fn override_model_single_answer_stream() {
    let backend = ScriptedBackend::new().on("M1", Script::stop(&["4"]));
    let run = drive(
        backend,
        Setup {
            override_model: Some("M1"),
            ..Setup::default()
        },
    )
    .await;

    assert_eq!(
        run.messages,
        vec![
            StreamMessage::Meta {
                event: MetaEvent::AttemptStart,
                attempt: 1,
                model: "M1".to_string(),
            },
            StreamMessage::Answer {
                attempt: 1,
                model: "M1".to_string(),
                text: "4".to_string(),
            },
        ]
    );
    assert_eq!(run.report.outcome, CascadeOutcome::Success);
    assert_eq!(run.report.final_model.as_deref(), Some("M1"));
    assert_eq!(run.backend.opened_models(), vec!["M1"]);
}

#[tokio::test]
async fn first_success_stops_the_queue() {
    let chunks = vec![
        Ok(UpstreamChunk {
            parts: vec![TaggedText::thought("thinking"), TaggedText::answer("Hel")],
            ..UpstreamChunk::default()
        }),
        Ok(UpstreamChunk {
            parts: vec![TaggedText::answer("lo")],
            finish: Some(FinishSignal::Stop),
            ..UpstreamChunk::default()
        }),
    ];
    let backend = ScriptedBackend::new().on("A", Script::Chunks(chunks));
    let run = drive(backend, Setup::default()).await;

    assert_eq!(run.backend.opened_models(), vec!["A"]);
    assert_eq!(count_kind(&run.messages, "meta"), 1);
    assert_eq!(count_kind(&run.messages, "thought"), 1);
    assert_eq!(count_kind(&run.messages, "answer"), 2);
    assert_eq!(count_kind(&run.messages, "reset"), 0);
    assert_eq!(count_kind(&run.messages, "error"), 0);
    assert_eq!(statuses(&run.report), vec![AttemptStatus::Success]);
    assert!(run.report.first_output_ms.is_some());
    assert_eq!(run.report.last_error_code, None);
}

#[tokio::test]
async fn recitation_retries_are_bounded_by_fallback_list() {
    let backend = ScriptedBackend::new().otherwise(Script::recitation(&["partial"]));
    let run = drive(backend, Setup::default()).await;

    assert_eq!(run.backend.opened_models(), vec!["A", "F1", "F2"]);
    assert_eq!(
        statuses(&run.report),
        vec![AttemptStatus::Recoverable; 3]
    );
    assert_eq!(count_kind(&run.messages, "reset"), 3);
    assert_eq!(
        terminal_error(&run.messages),
        Some((TerminalErrorCode::ContentPolicyExhausted, false, 3))
    );
    assert_eq!(run.report.outcome, CascadeOutcome::ContentPolicyExhausted);
    assert_eq!(
        run.report.last_error_code.as_deref(),
        Some("content-policy-exhausted")
    );
    assert_eq!(run.messages.last().map(StreamMessage::kind), Some("error"));
}

#[tokio::test]
async fn recitation_recovers_on_fallback_model_at_queue_front() {
    let backend = ScriptedBackend::new()
        .on("A", Script::recitation(&["copied"]))
        .on("F1", Script::stop(&["fresh"]));
    let run = drive(backend, Setup::default()).await;

    assert_eq!(run.backend.opened_models(), vec!["A", "F1"]);
    assert_eq!(
        statuses(&run.report),
        vec![AttemptStatus::Recoverable, AttemptStatus::Success]
    );

    let reset_at = run
        .messages
        .iter()
        .position(|m| matches!(m, StreamMessage::Reset { attempt: 1, clear: true, .. }))
        .expect("reset for attempt 1");
    assert!(matches!(
        &run.messages[reset_at + 1],
        StreamMessage::Meta { event: MetaEvent::RetryingAfterRecitation, attempt: 1, model } if model == "F1"
    ));
    assert!(matches!(
        &run.messages[reset_at + 2],
        StreamMessage::Meta { event: MetaEvent::AttemptStart, attempt: 2, model } if model == "F1"
    ));
    assert_eq!(run.report.final_model.as_deref(), Some("F1"));
}

#[tokio::test]
async fn empty_fallback_list_makes_first_recitation_terminal() {
    let backend = ScriptedBackend::new().otherwise(Script::recitation(&[]));
    let run = drive(
        backend,
        Setup {
            fallbacks: &[],
            ..Setup::default()
        },
    )
    .await;

    assert_eq!(run.backend.opened_models(), vec!["A"]);
    assert_eq!(
        terminal_error(&run.messages),
        Some((TerminalErrorCode::ContentPolicyExhausted, false, 1))
    );
}

#[tokio::test]
async fn generic_failures_advance_without_reset() {
    let backend = ScriptedBackend::new()
        .on("A", Script::transport_error())
        .on(
            "B",
            Script::OpenError(UpstreamError::Status {
                status: 503,
                body: "busy".to_string(),
            }),
        )
        .on("C", Script::stop(&["ok"]));
    let run = drive(backend, Setup::default()).await;

    assert_eq!(run.backend.opened_models(), vec!["A", "B", "C"]);
    assert_eq!(
        statuses(&run.report),
        vec![
            AttemptStatus::Failed,
            AttemptStatus::Failed,
            AttemptStatus::Success
        ]
    );
    assert_eq!(
        run.report.attempts[1].error_code.as_deref(),
        Some("GW_UPSTREAM_5XX")
    );
    assert_eq!(count_kind(&run.messages, "reset"), 0);
    assert_eq!(count_kind(&run.messages, "error"), 0);
}

#[tokio::test]
async fn full_exhaustion_is_retryable_and_carries_history() {
    let backend = ScriptedBackend::new()
        .on("A", Script::transport_error())
        .on(
            "B",
            Script::OpenError(UpstreamError::Status {
                status: 429,
                body: "quota".to_string(),
            }),
        );
    let run = drive(
        backend,
        Setup {
            queue: &["A", "B"],
            ..Setup::default()
        },
    )
    .await;

    assert_eq!(
        terminal_error(&run.messages),
        Some((TerminalErrorCode::AllModelsExhausted, true, 2))
    );
    let message = run.messages.iter().find_map(|m| match m {
        StreamMessage::Error { message, .. } => Some(message.clone()),
        _ => None,
    });
    assert_eq!(
        message.as_deref(),
        Some("all 2 model attempts failed; last error: upstream returned status 429: quota")
    );
    assert_eq!(run.report.outcome, CascadeOutcome::AllModelsExhausted);
    assert_eq!(
        run.report.last_error_code.as_deref(),
        Some("all-models-exhausted")
    );
}

#[tokio::test]
async fn stream_without_finish_is_unknown_end_and_moves_on() {
    let unfinished = Script::Chunks(vec![Ok(UpstreamChunk {
        parts: vec![TaggedText::answer("half")],
        ..UpstreamChunk::default()
    })]);
    let backend = ScriptedBackend::new()
        .on("A", unfinished)
        .on("B", Script::stop(&["whole"]));
    let run = drive(backend, Setup::default()).await;

    assert_eq!(run.backend.opened_models(), vec!["A", "B"]);
    assert_eq!(
        statuses(&run.report),
        vec![AttemptStatus::UnknownEnd, AttemptStatus::Success]
    );
    assert_eq!(
        run.report.attempts[0].error_code.as_deref(),
        Some(ERR_ENDED_WITHOUT_FINISH)
    );
}

#[tokio::test]
async fn other_finish_reason_is_a_generic_failure_with_debug_echo() {
    let backend = ScriptedBackend::new()
        .on(
            "A",
            Script::finish_with(&["x"], FinishSignal::Other("SAFETY".to_string())),
        )
        .on("B", Script::stop(&["y"]));
    let run = drive(backend, Setup::default()).await;

    assert_eq!(run.report.attempts[0].status, AttemptStatus::Failed);
    assert_eq!(run.report.attempts[0].finish_reason.as_deref(), Some("SAFETY"));
    assert!(run.messages.iter().any(|m| matches!(
        m,
        StreamMessage::Debug { attempt: 1, text, .. } if text == "finish_reason=SAFETY"
    )));
    assert_eq!(count_kind(&run.messages, "reset"), 0);
}

#[tokio::test]
async fn messages_stay_scoped_to_their_attempt() {
    let backend = ScriptedBackend::new()
        .on("A", Script::transport_error())
        .on("B", Script::recitation(&["b1", "b2"]))
        .on("F1", Script::stop(&["f1", "f2"]));
    let run = drive(backend, Setup::default()).await;

    let history = &run.report.attempts;
    let mut last_attempt = 0;
    for message in &run.messages {
        let Some(attempt) = message.attempt() else {
            continue;
        };
        assert!(attempt >= last_attempt, "attempt {attempt} after {last_attempt}");
        last_attempt = attempt;

        let expected_model = &history[(attempt - 1) as usize].model;
        match message {
            StreamMessage::Thought { model, .. }
            | StreamMessage::Answer { model, .. }
            | StreamMessage::Debug { model, .. }
            | StreamMessage::Reset { model, .. } => assert_eq!(model, expected_model),
            StreamMessage::Meta {
                event: MetaEvent::AttemptStart,
                model,
                ..
            } => assert_eq!(model, expected_model),
            _ => {}
        }
    }
    assert_eq!(
        history.iter().map(|a| a.model.as_str()).collect::<Vec<_>>(),
        vec!["A", "B", "F1"]
    );
}

#[tokio::test]
async fn grounding_is_relayed_only_for_search_variant() {
    let grounded = || {
        Script::Chunks(vec![Ok(UpstreamChunk {
            parts: vec![TaggedText::answer("cited")],
            grounding: Some(json!({"groundingChunks": [{"web": {"uri": "https://example.com"}}]})),
            finish: Some(FinishSignal::Stop),
        })])
    };

    let search = drive(
        ScriptedBackend::new().on("A", grounded()),
        Setup {
            variant: RequestVariant::Search,
            ..Setup::default()
        },
    )
    .await;
    assert_eq!(count_kind(&search.messages, "grounding"), 1);
    assert!(search.messages.iter().any(|m| matches!(
        m,
        StreamMessage::Debug { text, .. } if text == "grounding_metadata=present"
    )));
    assert!(search.backend.opened_requests()[0].enable_search);

    let plain = drive(ScriptedBackend::new().on("A", grounded()), Setup::default()).await;
    assert_eq!(count_kind(&plain.messages, "grounding"), 0);
    assert!(!plain.backend.opened_requests()[0].enable_search);
}

#[tokio::test]
async fn first_byte_timeout_advances_the_cascade() {
    let backend = ScriptedBackend::new()
        .on("A", Script::Stall)
        .on("B", Script::stop(&["late but fine"]));
    let run = drive(
        backend,
        Setup {
            timeouts: RelayTimeouts {
                first_byte: Some(Duration::from_millis(30)),
                idle: None,
            },
            ..Setup::default()
        },
    )
    .await;

    assert_eq!(
        run.report.attempts[0].error_code.as_deref(),
        Some("GW_UPSTREAM_TIMEOUT")
    );
    assert_eq!(run.report.outcome, CascadeOutcome::Success);
}

#[tokio::test]
async fn dropped_client_stops_before_opening_upstream() {
    let backend = Arc::new(ScriptedBackend::new().otherwise(Script::stop(&["unused"])));
    let (sink, body) = EventSink::channel();
    drop(body);

    let report = run(CascadeInput {
        backend: backend.clone(),
        sink,
        trace_id: "t-gone".to_string(),
        config: RequestVariant::Generate.config(),
        parts: Arc::new(vec![PromptPart::Text("hi".to_string())]),
        response_schema: None,
        api_key: "k".to_string(),
        queue: ModelQueue::for_request(None, &models(&["A", "B"])),
        recovery: RecitationRecovery::new(&[]),
        timeouts: RelayTimeouts::default(),
        started: Instant::now(),
    })
    .await;

    assert_eq!(report.outcome, CascadeOutcome::ClientGone);
    assert!(backend.opened_models().is_empty());
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].error_code.as_deref(), Some("GW_CLIENT_GONE"));
}

#[tokio::test]
async fn disconnect_during_silent_upstream_releases_the_attempt() {
    let backend = Arc::new(ScriptedBackend::new().on("A", Script::Stall));
    let (sink, mut body) = EventSink::channel();
    let handle = tokio::spawn(run(CascadeInput {
        backend: backend.clone(),
        sink,
        trace_id: "t-stall".to_string(),
        config: RequestVariant::Generate.config(),
        parts: Arc::new(vec![PromptPart::Text("hi".to_string())]),
        response_schema: None,
        api_key: "k".to_string(),
        queue: ModelQueue::for_request(Some("A"), &[]),
        recovery: RecitationRecovery::new(&[]),
        timeouts: RelayTimeouts::default(),
        started: Instant::now(),
    }));

    let start = next_item(&mut body).await.expect("frame").expect("infallible");
    assert!(std::str::from_utf8(&start).expect("utf8").contains("attempt_start"));
    drop(body);

    let report = tokio::time::timeout(Duration::from_millis(500), handle)
        .await
        .expect("cascade should stop once the client is gone")
        .expect("cascade task");
    assert_eq!(report.outcome, CascadeOutcome::ClientGone);
    assert!(backend.opened_models().len() <= 1);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].status, AttemptStatus::Failed);
    assert_eq!(report.attempts[0].error_code.as_deref(), Some("GW_CLIENT_GONE"));
}

#[tokio::test]
async fn idle_timeout_after_partial_output_advances_without_reset() {
    let partial = Script::ChunksThenStall(vec![Ok(UpstreamChunk {
        parts: vec![TaggedText::answer("par")],
        ..UpstreamChunk::default()
    })]);
    let backend = ScriptedBackend::new()
        .on("A", partial)
        .on("B", Script::stop(&["whole"]));
    let run = drive(
        backend,
        Setup {
            timeouts: RelayTimeouts {
                first_byte: None,
                idle: Some(Duration::from_millis(30)),
            },
            ..Setup::default()
        },
    )
    .await;

    assert_eq!(run.backend.opened_models(), vec!["A", "B"]);
    assert_eq!(
        statuses(&run.report),
        vec![AttemptStatus::Failed, AttemptStatus::Success]
    );
    assert_eq!(
        run.report.attempts[0].error_code.as_deref(),
        Some("GW_UPSTREAM_TIMEOUT")
    );
    assert_eq!(count_kind(&run.messages, "reset"), 0);
    assert!(run.messages.iter().any(|m| matches!(
        m,
        StreamMessage::Answer { attempt: 1, text, .. } if text == "par"
    )));
}

#[tokio::test]
async fn mid_stream_transport_error_advances_without_reset() {
    let broken = Script::Chunks(vec![
        Ok(UpstreamChunk {
            parts: vec![TaggedText::answer("half an ")],
            ..UpstreamChunk::default()
        }),
        Err(UpstreamError::Stream("connection reset".to_string())),
    ]);
    let backend = ScriptedBackend::new()
        .on("A", broken)
        .on("B", Script::stop(&["answer"]));
    let run = drive(backend, Setup::default()).await;

    assert_eq!(run.backend.opened_models(), vec!["A", "B"]);
    assert_eq!(
        statuses(&run.report),
        vec![AttemptStatus::Failed, AttemptStatus::Success]
    );
    assert_eq!(
        run.report.attempts[0].error_code.as_deref(),
        Some("GW_STREAM_ERROR")
    );
    assert_eq!(count_kind(&run.messages, "reset"), 0);
    assert_eq!(run.report.outcome, CascadeOutcome::Success);
}

#[tokio::test]
async fn malformed_chunk_is_a_decode_failure_of_the_attempt() {
    let backend = ScriptedBackend::new()
        .on(
            "A",
            Script::Chunks(vec![Err(UpstreamError::Decode("expected value".to_string()))]),
        )
        .on("B", Script::stop(&["ok"]));
    let run = drive(backend, Setup::default()).await;

    assert_eq!(
        run.report.attempts[0].error_code.as_deref(),
        Some("GW_UPSTREAM_DECODE_FAILED")
    );
    assert_eq!(run.report.outcome, CascadeOutcome::Success);
}

#[test]
fn relay_timeouts_treat_zero_as_disabled() {
    let timeouts = RelayTimeouts::from_seconds(0, 15);
    assert_eq!(timeouts.first_byte, None);
    assert_eq!(timeouts.idle, Some(Duration::from_secs(15)));
}

#[test]
fn sink_errors_map_to_outcomes() {
    assert_eq!(
        sink_outcome("t", &SinkError::ClientGone),
        CascadeOutcome::ClientGone
    );

    let frame = SinkError::Frame {
        kind: "error",
        source: serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
    };
    assert_eq!(sink_outcome("t", &frame), CascadeOutcome::SinkFailed);
    assert_eq!(CascadeOutcome::SinkFailed.as_str(), "sink_failed");
    assert_eq!(CascadeOutcome::SinkFailed.terminal_code(), None);

    let mut log = AttemptLog::default();
    log.start("A");
    log.settle(sink_settlement(&frame));
    let attempts = log.into_vec();
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].error_code.as_deref(), Some("GW_STREAM_FRAME_FAILED"));
}
