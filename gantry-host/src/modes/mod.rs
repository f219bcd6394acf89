//! Execution modes
//!
//! Mode dispatch runs after migrations, once models and services are up.
//! `internal` adds nothing and bootstrap ends there, `cron` starts the
//! scheduler, `web` starts the HTTP server with the realtime bridge.

pub mod cron;
pub mod web;
