//! Usage: Gateway proxy core (request preparation + model cascade + NDJSON relay + request logging).

mod errors;
mod failover;
mod handler;
mod http_util;
mod logging;
mod prompt;
mod types;

pub(super) use errors::error_response;
pub(super) use handler::{collect_json_impl, stream_impl};
pub(super) use types::RequestVariant;
