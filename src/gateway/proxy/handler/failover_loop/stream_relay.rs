//! Usage: One attempt's relay (open upstream stream, forward tagged parts, report the finish signal).

use super::RelayTimeouts;
use crate::gateway::events::StreamMessage;
use crate::gateway::streams::{EventSink, SinkError};
use crate::gateway::upstream::{FinishSignal, GenerationBackend, UpstreamError, UpstreamRequest};
use crate::shared::stream_ext::next_item_within;
use std::time::Instant;

/// How one attempt ended. The relay never decides what happens next.
#[derive(Debug)]
pub(super) enum RelayOutcome {
    Finished(FinishSignal),
    EndedWithoutFinish,
    Failed(UpstreamError),
    /// The client went away or the sink could not carry a message.
    SinkClosed(SinkError),
}

pub(super) struct RelayCtx<'a> {
    pub(super) backend: &'a dyn GenerationBackend,
    pub(super) sink: &'a EventSink,
    pub(super) attempt: u32,
    pub(super) relay_grounding: bool,
    pub(super) timeouts: RelayTimeouts,
}

pub(super) async fn relay_attempt(
    ctx: RelayCtx<'_>,
    request: &UpstreamRequest,
    first_output: &mut Option<Instant>,
) -> RelayOutcome {
    match relay_inner(&ctx, request, first_output).await {
        Ok(outcome) => outcome,
        Err(err) => RelayOutcome::SinkClosed(err),
    }
}

async fn relay_inner(
    ctx: &RelayCtx<'_>,
    request: &UpstreamRequest,
    first_output: &mut Option<Instant>,
) -> Result<RelayOutcome, SinkError> {
    let model = request.model.as_str();
    let first_byte_deadline = ctx.timeouts.first_byte.map(|limit| Instant::now() + limit);

    // Every wait on the upstream also watches the client, so a dropped body
    // releases the upstream connection even when no timeout is configured.
    let open = ctx.backend.open_stream(request);
    let opened = match ctx.timeouts.first_byte {
        Some(limit) => match ctx.sink.unless_closed(tokio::time::timeout(limit, open)).await? {
            Ok(opened) => opened,
            Err(_) => {
                return Ok(RelayOutcome::Failed(UpstreamError::Timeout(format!(
                    "no first chunk within {}s",
                    limit.as_secs()
                ))))
            }
        },
        None => ctx.sink.unless_closed(open).await?,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(err) => return Ok(RelayOutcome::Failed(err)),
    };

    let mut received_any = false;
    loop {
        let limit = if received_any {
            ctx.timeouts.idle
        } else {
            first_byte_deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
        };

        let item = match ctx
            .sink
            .unless_closed(next_item_within(&mut stream, limit))
            .await?
        {
            Ok(item) => item,
            Err(_) => {
                let message = if received_any {
                    format!(
                        "stream idle for more than {}s",
                        ctx.timeouts.idle.map(|d| d.as_secs()).unwrap_or(0)
                    )
                } else {
                    format!(
                        "no first chunk within {}s",
                        ctx.timeouts.first_byte.map(|d| d.as_secs()).unwrap_or(0)
                    )
                };
                return Ok(RelayOutcome::Failed(UpstreamError::Timeout(message)));
            }
        };

        let chunk = match item {
            None => return Ok(RelayOutcome::EndedWithoutFinish),
            Some(Err(err)) => return Ok(RelayOutcome::Failed(err)),
            Some(Ok(chunk)) => chunk,
        };
        received_any = true;

        for part in chunk.parts {
            if part.text.is_empty() {
                continue;
            }
            first_output.get_or_insert_with(Instant::now);
            ctx.sink
                .emit(&StreamMessage::part(part.tag, ctx.attempt, model, part.text))
                .await?;
        }

        if ctx.relay_grounding {
            if let Some(metadata) = chunk.grounding {
                ctx.sink.emit(&StreamMessage::Grounding { metadata }).await?;
                ctx.sink
                    .emit(&StreamMessage::debug(
                        ctx.attempt,
                        model,
                        "grounding_metadata=present".to_string(),
                    ))
                    .await?;
            }
        }

        if let Some(finish) = chunk.finish {
            // A clean STOP stays silent so a successful stream is just meta plus parts.
            if finish == FinishSignal::Stop {
                return Ok(RelayOutcome::Finished(finish));
            }
            ctx.sink
                .emit(&StreamMessage::debug(
                    ctx.attempt,
                    model,
                    format!("finish_reason={}", finish.as_str()),
                ))
                .await?;
            return Ok(RelayOutcome::Finished(finish));
        }
    }
}
