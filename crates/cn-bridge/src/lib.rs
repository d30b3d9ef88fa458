//! Bridge between the Conductor coordinator and its observers.
//!
//! - [`event_bus`] fans typed [`protocol::StateChange`] notifications out to
//!   any number of subscribers (at-least-once, no acknowledgement).
//! - [`commands`] is the synchronous command surface: a cloneable
//!   [`commands::CoordinatorHandle`] that sends requests to the coordinator
//!   and awaits typed replies.
//! - [`http_api`] exposes both over axum: REST endpoints, webhook ingest and
//!   a `/ws` live feed.

pub mod api_error;
pub mod commands;
pub mod event_bus;
pub mod http_api;
pub mod protocol;
