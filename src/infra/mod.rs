//! Usage: Infrastructure adapters (settings file, sqlite persistence).

pub(crate) mod db;
pub(crate) mod request_logs;
pub(crate) mod settings;
