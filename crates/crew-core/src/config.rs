//! Org-level configuration and participant state files.
//!
//! `config.yaml` holds org-global settings (the boss — the default human
//! member — and the source-repo path).  Humans live in `members/<name>.yaml`;
//! each agent's role and model live in its `state.yaml`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;
use crate::types::{AgentProfile, Member};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo: Option<String>,
}

pub fn load_org_config(home: &Path) -> OrgConfig {
    let path = paths::org_config_path(home);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return OrgConfig::default();
    };
    serde_yaml::from_str(&raw).unwrap_or_default()
}

pub fn save_org_config(home: &Path, config: &OrgConfig) -> Result<()> {
    let path = paths::org_config_path(home);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_yaml::to_string(config).context("serialize config.yaml")?;
    std::fs::write(&path, raw).with_context(|| format!("write {path:?}"))?;
    Ok(())
}

pub fn get_boss(home: &Path) -> Option<String> {
    load_org_config(home).boss
}

pub fn set_boss(home: &Path, name: &str) -> Result<()> {
    let mut config = load_org_config(home);
    config.boss = Some(name.to_string());
    save_org_config(home, &config)
}

// ── Members ──────────────────────────────────────────────────────────────

pub fn add_member(home: &Path, name: &str) -> Result<()> {
    let dir = paths::members_dir(home);
    std::fs::create_dir_all(&dir)?;
    let member = Member {
        name: name.to_string(),
    };
    let raw = serde_yaml::to_string(&member).context("serialize member")?;
    std::fs::write(dir.join(format!("{name}.yaml")), raw)?;
    Ok(())
}

pub fn list_members(home: &Path) -> Result<Vec<Member>> {
    let dir = paths::members_dir(home);
    let mut members = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Ok(members);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)?;
        if let Ok(member) = serde_yaml::from_str::<Member>(&raw) {
            members.push(member);
        }
    }
    members.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(members)
}

pub fn remove_member(home: &Path, name: &str) -> Result<bool> {
    let path = paths::members_dir(home).join(format!("{name}.yaml"));
    if !path.is_file() {
        return Ok(false);
    }
    std::fs::remove_file(path)?;
    Ok(true)
}

// ── Agent state ──────────────────────────────────────────────────────────

pub fn write_agent_state(home: &Path, team: &str, profile: &AgentProfile) -> Result<()> {
    let path = paths::agent_state_path(home, team, &profile.name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_yaml::to_string(profile).context("serialize state.yaml")?;
    std::fs::write(&path, raw).with_context(|| format!("write {path:?}"))?;
    Ok(())
}

pub fn read_agent_state(home: &Path, team: &str, agent: &str) -> Result<AgentProfile> {
    let path = paths::agent_state_path(home, team, agent);
    let raw = std::fs::read_to_string(&path).with_context(|| format!("read {path:?}"))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse {path:?}"))
}

/// All agents of a team, from the agent directories on disk.
pub fn read_roster(home: &Path, team: &str) -> Result<Vec<AgentProfile>> {
    let dir = paths::agents_dir(home, team);
    let mut agents = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Ok(agents);
    };
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match read_agent_state(home, team, &name) {
            Ok(profile) => agents.push(profile),
            Err(_) => agents.push(AgentProfile {
                name,
                role: "engineer".into(),
                model: String::new(),
            }),
        }
    }
    agents.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(agents)
}

/// The team's manager: the agent with the `manager` role, if any.
pub fn team_manager(home: &Path, team: &str) -> Option<String> {
    read_roster(home, team)
        .ok()?
        .into_iter()
        .find(|a| a.role == "manager")
        .map(|a| a.name)
}
