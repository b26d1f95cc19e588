//! Usage: Gateway stream adapters (gunzip, SSE decoding, NDJSON framing and relay).

mod gunzip;
pub(super) use gunzip::GunzipStream;

mod sse;
pub(super) use sse::SseDataStream;

mod relay;
pub(super) use relay::NdjsonBodyStream;

mod ndjson;
pub(super) use ndjson::{EventSink, SinkError};
