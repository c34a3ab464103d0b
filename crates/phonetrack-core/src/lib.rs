pub mod config;
pub mod coordinator;
pub mod error;
pub mod evaluator;
pub mod fetch;
pub mod payload;
pub mod platform;
pub mod redact;
pub mod tracker;
pub mod validation;
