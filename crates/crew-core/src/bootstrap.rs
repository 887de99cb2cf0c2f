//! Team bootstrap: directories, agent files, store rows.
//!
//! `bootstrap` is idempotent — running it N times leaves the filesystem
//! and schema exactly as after the first run.

use std::path::Path;

use anyhow::{bail, Result};
use std::sync::OnceLock;

use crate::config;
use crate::db::Db;
use crate::paths;
use crate::types::{AgentProfile, Approval, PipelineStep};

/// Team slugs: lowercase alphanumeric with `_`/`-`, starting with an
/// alphanumeric.  Uppercase, spaces, `/` and `.` are rejected.
pub fn validate_team_name(name: &str) -> Result<()> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9][a-z0-9_-]*$")
            .unwrap_or_else(|e| unreachable!("slug pattern is valid: {e}"))
    });
    if !pattern.is_match(name) {
        bail!(
            "invalid team name '{name}': must be lowercase alphanumeric \
             (plus '-' and '_'), starting with a letter or digit"
        );
    }
    Ok(())
}

const DEFAULT_BIO: &str = "An autonomous engineer on this team.\n";

/// Create (or complete) a team: store row, directory tree, agent files.
pub fn bootstrap(
    home: &Path,
    db: &Db,
    team: &str,
    agents: &[AgentProfile],
) -> Result<()> {
    validate_team_name(team)?;
    db.create_team(team)?;

    std::fs::create_dir_all(paths::agents_dir(home, team))?;
    std::fs::create_dir_all(paths::workspaces_dir(home, team))?;

    for profile in agents {
        add_agent(home, team, profile, None)?;
    }
    Ok(())
}

/// Add one agent to a team.  Existing files are left untouched.
pub fn add_agent(
    home: &Path,
    team: &str,
    profile: &AgentProfile,
    bio: Option<&str>,
) -> Result<()> {
    let dir = paths::agent_dir(home, team, &profile.name);
    std::fs::create_dir_all(&dir)?;

    let bio_path = paths::agent_bio_path(home, team, &profile.name);
    if !bio_path.exists() {
        std::fs::write(&bio_path, bio.unwrap_or(DEFAULT_BIO))?;
    }
    let context_path = paths::agent_context_path(home, team, &profile.name);
    if !context_path.exists() {
        std::fs::write(&context_path, "")?;
    }
    if !paths::agent_state_path(home, team, &profile.name).exists() {
        config::write_agent_state(home, team, profile)?;
    }
    Ok(())
}

/// Register a repository for a team: store row, workspace directory, and
/// a `source` symlink back to the checkout.  Registering the same path
/// again returns the original name and changes nothing on disk.
pub fn register_repo(
    home: &Path,
    db: &Db,
    team: &str,
    path: &Path,
    name: Option<&str>,
    approval: Approval,
    test_cmd: Option<&str>,
) -> Result<String> {
    let path = std::fs::canonicalize(path)
        .map_err(|e| anyhow::anyhow!("cannot resolve repo path {path:?}: {e}"))?;
    let name = name
        .map(|n| n.to_string())
        .unwrap_or_else(|| {
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo")
                .to_string()
        });
    let pipeline: Vec<PipelineStep> = test_cmd
        .map(PipelineStep::legacy_test_cmd)
        .unwrap_or_default();
    let name = db.register_repo(team, &name, &path.to_string_lossy(), approval, &pipeline)?;

    let workspace = paths::workspaces_dir(home, team).join(&name);
    std::fs::create_dir_all(&workspace)?;
    let link = workspace.join("source");
    if link.symlink_metadata().is_err() {
        std::os::unix::fs::symlink(&path, &link)?;
    }
    Ok(name)
}

/// Generated agent names for `team add --agents N`.
pub fn default_agent_names(count: usize) -> Vec<String> {
    const NAMES: &[&str] = &[
        "ada", "grace", "edsger", "barbara", "donald", "tony", "radia", "ken",
    ];
    (0..count)
        .map(|i| {
            NAMES
                .get(i)
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("agent{}", i + 1))
        })
        .collect()
}
