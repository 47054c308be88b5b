pub mod config;
pub mod error;
pub mod executor;
pub mod input;
pub mod log_sanitize;
pub mod modules;
pub mod params;
pub mod planner;
pub mod remote;
pub mod runlog;

pub use error::{Error, Result};
