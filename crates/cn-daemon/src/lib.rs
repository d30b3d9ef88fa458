//! The conductor daemon: scheduling, PR automation and event rules around a
//! single-writer coordinator.

pub mod coordinator;
pub mod daemon;
pub mod pr_pipeline;
pub mod rules;
pub mod scheduler;
