//! # Gantry Common Library
//!
//! Shared plumbing for the Gantry application host:
//! - Configuration loading with file / environment / CLI cascade
//! - Database pool setup, patch records, and JSON document collections
//! - Logging initialization
//! - Server-Sent Events utilities

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod sse;

pub use error::{Error, Result};
