//! Logging setup shared by the conductor binaries.
//!
//! Human-readable or JSON output through `tracing-subscriber`, filtered by
//! `RUST_LOG` when set and by the configured level otherwise.

pub mod logging;
