//! Home-directory layout helpers.
//!
//! Everything the daemon persists lives under a single home directory
//! (default `~/.crew`).  The `protected/` subtree holds state agents must
//! never touch: the database, the singleton lock, and the network policy.

use std::path::{Path, PathBuf};

pub fn default_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    Path::new(&home).join(".crew")
}

pub fn protected_dir(home: &Path) -> PathBuf {
    home.join("protected")
}

pub fn db_path(home: &Path) -> PathBuf {
    protected_dir(home).join("db.sqlite")
}

pub fn daemon_pid_path(home: &Path) -> PathBuf {
    protected_dir(home).join("daemon.pid")
}

pub fn daemon_lock_path(home: &Path) -> PathBuf {
    protected_dir(home).join("daemon.lock")
}

pub fn network_config_path(home: &Path) -> PathBuf {
    protected_dir(home).join("network.yaml")
}

pub fn org_config_path(home: &Path) -> PathBuf {
    home.join("config.yaml")
}

pub fn log_file_path(home: &Path) -> PathBuf {
    home.join("daemon.log")
}

pub fn members_dir(home: &Path) -> PathBuf {
    home.join("members")
}

pub fn projects_dir(home: &Path) -> PathBuf {
    home.join("projects")
}

/// Legacy root renamed to `projects/` by the filesystem migration.
pub fn legacy_teams_dir(home: &Path) -> PathBuf {
    home.join("teams")
}

pub fn team_dir(home: &Path, team: &str) -> PathBuf {
    projects_dir(home).join(team)
}

pub fn agents_dir(home: &Path, team: &str) -> PathBuf {
    team_dir(home, team).join("agents")
}

pub fn agent_dir(home: &Path, team: &str, agent: &str) -> PathBuf {
    agents_dir(home, team).join(agent)
}

pub fn agent_bio_path(home: &Path, team: &str, agent: &str) -> PathBuf {
    agent_dir(home, team, agent).join("bio.md")
}

pub fn agent_context_path(home: &Path, team: &str, agent: &str) -> PathBuf {
    agent_dir(home, team, agent).join("context.md")
}

pub fn agent_state_path(home: &Path, team: &str, agent: &str) -> PathBuf {
    agent_dir(home, team, agent).join("state.yaml")
}

pub fn workspaces_dir(home: &Path, team: &str) -> PathBuf {
    team_dir(home, team).join("workspaces")
}

/// Per-task worktree: `projects/<team>/workspaces/<repo>/T<id>`.
pub fn task_worktree_path(home: &Path, team: &str, repo: &str, task_id: i64) -> PathBuf {
    workspaces_dir(home, team)
        .join(repo)
        .join(format!("T{task_id}"))
}

pub fn ensure_protected(home: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(protected_dir(home))
}
