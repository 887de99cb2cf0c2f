//! Filesystem migrations from prior on-disk layouts.
//!
//! Each migration is guarded by a sentinel file under `protected/` and by
//! per-step existence checks, so a run interrupted at any point can be
//! repeated safely.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::paths;

const PROJECTS_SENTINEL: &str = ".migrated-projects";

/// Rename the legacy `teams/` root to `projects/` and each team's
/// `repos/` directory to `workspaces/`.  Idempotent regardless of which
/// rename steps had previously succeeded.
pub fn migrate_teams_to_projects(home: &Path) -> Result<bool> {
    paths::ensure_protected(home).context("create protected dir")?;
    let sentinel = paths::protected_dir(home).join(PROJECTS_SENTINEL);
    if sentinel.exists() {
        return Ok(false);
    }

    let legacy = paths::legacy_teams_dir(home);
    let projects = paths::projects_dir(home);

    let mut migrated = false;
    if legacy.is_dir() && !projects.exists() {
        std::fs::rename(&legacy, &projects)
            .with_context(|| format!("rename {legacy:?} → {projects:?}"))?;
        info!("migrated {legacy:?} → {projects:?}");
        migrated = true;
    }

    if projects.is_dir() {
        for entry in std::fs::read_dir(&projects)? {
            let team_dir = entry?.path();
            if !team_dir.is_dir() {
                continue;
            }
            let legacy_repos = team_dir.join("repos");
            let workspaces = team_dir.join("workspaces");
            if legacy_repos.is_dir() && !workspaces.exists() {
                std::fs::rename(&legacy_repos, &workspaces)
                    .with_context(|| format!("rename {legacy_repos:?} → {workspaces:?}"))?;
                info!("migrated {legacy_repos:?} → {workspaces:?}");
                migrated = true;
            }
        }
    }

    std::fs::write(&sentinel, "1\n").with_context(|| format!("write sentinel {sentinel:?}"))?;
    Ok(migrated)
}

/// Run every filesystem migration in order.  Any failure leaves the
/// sentinel unwritten so the next start retries; the daemon must not run
/// from an inconsistent intermediate state.
pub fn run_all(home: &Path) -> Result<()> {
    migrate_teams_to_projects(home)?;
    Ok(())
}
