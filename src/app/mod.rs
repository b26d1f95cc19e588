//! Usage: Process-level wiring (logging bootstrap).

pub(crate) mod logging;
