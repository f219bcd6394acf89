//! Data patch coordination
//!
//! Applies registered one-shot data patches at most once per database,
//! even when several host processes bootstrap concurrently against the
//! same file. The only synchronization primitive is the PRIMARY KEY on
//! `patch_records`: claim by INSERT, skip on unique violation. There are
//! no leases or timeouts; a claimed patch whose owner crashed stays
//! pending and is never retried.
//!
//! Ordering is ascending by version within one process. Concurrent
//! processes may interleave claims across different versions; there is no
//! global barrier between patches.

use crate::app::App;
use crate::error::{Error, Result};
use crate::registry::Patch;
use gantry_common::db::patches::{self, Claim};
use tracing::{debug, error, info, info_span, Instrument};

pub(crate) async fn run(app: &App) -> Result<()> {
    let registered = &app.registry().patches;
    if registered.is_empty() {
        return Ok(());
    }

    let db = app.db().map_err(|_| {
        Error::Common(gantry_common::Error::Config(
            "data patches require a [database] configuration".to_string(),
        ))
    })?;

    let applied = patches::max_version(&db).await?;
    let mut outstanding: Vec<&Patch> = registered
        .iter()
        .filter(|patch| patch.version > applied)
        .collect();
    outstanding.sort_by_key(|patch| patch.version);

    if outstanding.is_empty() {
        debug!("No outstanding data patches (max applied: {})", applied);
        return Ok(());
    }
    info!(
        "{} data patches outstanding (max applied: {})",
        outstanding.len(),
        applied
    );

    for patch in outstanding {
        match patches::claim(&db, patch.version, &patch.name).await? {
            Claim::Lost => {
                debug!(
                    "Patch {} '{}' already claimed by another instance",
                    patch.version, patch.name
                );
                continue;
            }
            Claim::Won => {}
        }

        info!("Running patch {} '{}'", patch.version, patch.name);
        let span = info_span!("patch", id = patch.version, name = %patch.name);
        match (patch.run)(app.clone()).instrument(span).await {
            Ok(()) => {
                patches::complete(&db, patch.version).await?;
                info!("✓ Patch {} '{}' completed", patch.version, patch.name);
            }
            Err(e) => {
                error!("Patch {} '{}' failed: {}", patch.version, patch.name, e);
                // Full teardown; the pending record stays and is never retried
                if let Err(teardown) = app.destroy_inner().await {
                    error!("Teardown after failed patch also errored: {}", teardown);
                }
                return Err(Error::Migration(format!(
                    "patch {} '{}': {}",
                    patch.version, patch.name, e
                )));
            }
        }
    }

    Ok(())
}
