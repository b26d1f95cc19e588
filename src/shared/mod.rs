//! Usage: Cross-cutting utilities shared across layers (low-level helpers, pure logic).

pub(crate) mod blocking;
pub(crate) mod fs;
pub(crate) mod stream_ext;
pub(crate) mod time;
