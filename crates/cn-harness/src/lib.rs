//! Harness: admission control and safety checks that sit between the
//! coordinator and the agent processes it launches.
//!
//! - [`quota`] tracks daily usage and answers admission requests atomically.
//! - [`guardrails`] holds the pure checks every agent action must pass.
//! - [`shutdown`] coordinates a cooperative stop across the daemon loops.

pub mod guardrails;
pub mod quota;
pub mod shutdown;
