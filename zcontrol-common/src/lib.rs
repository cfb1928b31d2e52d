//! # zcontrol Common
//!
//! Shared utilities for the zcontrol crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use zcontrol_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(lpar = "LP01", "Partition activated");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, level_from_env, DEFAULT_LOG_LEVEL, LOG_LEVEL_ENV};
