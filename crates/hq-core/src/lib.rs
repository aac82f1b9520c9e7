//! `hq-core`: configuration and process-level errors shared by the `hq` crates.

pub mod config;
pub mod error;

pub use config::HqConfig;
pub use error::{HqError, Result};
