//! Source-control and CI boundary.
//!
//! Everything goes through the `gh` command-line tool; credentials stay with
//! it. [`github::poller::GitHubPoller`] turns PR, check and review state into
//! [`cn_core::types::ExternalEvent`]s for the coordinator.

pub mod github;
pub mod types;
