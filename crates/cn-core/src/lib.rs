pub mod config;
pub mod error;
pub mod git;
pub mod store;
pub mod types;
pub mod workspace;
