//! # Gantry Application Host
//!
//! Hosts an application assembled from registered modules:
//! - Staged lifecycle (`created` to `launching` to `active` to `stopped`)
//! - Module registry with model, service, router, and scheduler hooks
//! - Versioned data patches applied at most once across processes
//! - Execution modes: web (HTTP + realtime bridge), cron, internal
//!
//! Embedding programs build a [`ModuleRegistry`], hand it to
//! [`App::builder`], and call [`App::init`]. The `gantry` binary runs an
//! empty registry for checking a deployment before any modules exist.

pub mod app;
pub mod error;
pub mod modes;
pub mod registry;

mod migrate;
mod realtime;

pub use app::{App, AppBuilder, AppStatus, HostHooks};
pub use error::{Error, Result};
pub use modes::cron::Scheduler;
pub use registry::{ModuleDef, ModuleRegistry, ModuleStructure, RegistryBuilder, Service};
