//! Host binary entry point
//!
//! Runs a host with an empty module registry: enough to check a
//! deployment's configuration cascade, database, and web surface before
//! any modules exist. Embedding programs depend on the library instead
//! and register their modules through `ModuleRegistry::builder()`.

use anyhow::Result;
use clap::Parser;
use gantry_common::config::{ConfigOverrides, Mode};
use gantry_host::{App, ModuleRegistry};
use std::path::PathBuf;

/// Command-line arguments for the host binary
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(about = "Modular application host")]
#[command(version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "GANTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Deployment environment label
    #[arg(short, long)]
    environment: Option<String>,

    /// Execution mode: web, cron, or internal
    #[arg(short, long)]
    mode: Option<Mode>,

    /// Bind address for web mode
    #[arg(long)]
    host: Option<String>,

    /// Bind port for web mode (0 asks the OS for a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database file
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let overrides = ConfigOverrides {
        config_path: args.config,
        environment: args.environment,
        mode: args.mode,
        host: args.host,
        port: args.port,
        database_path: args.database,
    };

    let app = App::builder()
        .overrides(overrides)
        .registry(ModuleRegistry::builder().build()?)
        .build();

    app.init().await?;
    app.wait_until_stopped().await;
    Ok(())
}
