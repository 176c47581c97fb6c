//! Logging and span helpers shared by the issue-mirror crates.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   filtered by `RUST_LOG` with a configured fallback level
//! - **Tracing**: trace/span ID generation and the `operation` / `task` spans
//!   every sync operation runs under

pub mod logging;
pub mod tracing_setup;
