//! Credentials and OAuth token lifecycle.

pub mod gcp;
pub mod secrets;
pub mod token;
