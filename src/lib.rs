//! Library entrypoint for ppc-autopilot.
//!
//! Exposes all modules so integration tests can import them.

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod data;
pub mod jobs;
pub mod scoring;
