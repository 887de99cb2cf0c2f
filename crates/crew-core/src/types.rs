use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Task status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Unassigned,
    Assigned,
    InProgress,
    InReview,
    InApproval,
    Merging,
    MergeFailed,
    Rejected,
    Done,
    Discarded,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::InApproval => "in_approval",
            Self::Merging => "merging",
            Self::MergeFailed => "merge_failed",
            Self::Rejected => "rejected",
            Self::Done => "done",
            Self::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "unassigned" => Self::Unassigned,
            "assigned" => Self::Assigned,
            "in_progress" => Self::InProgress,
            "in_review" => Self::InReview,
            "in_approval" => Self::InApproval,
            "merging" => Self::Merging,
            "merge_failed" => Self::MergeFailed,
            "rejected" => Self::Rejected,
            "done" => Self::Done,
            "discarded" => Self::Discarded,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Rejected | Self::MergeFailed | Self::Discarded
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Task ─────────────────────────────────────────────────────────────────

/// A unit of work as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub team: String,
    pub title: String,
    pub description: String,
    /// Directly responsible agent, if assigned.
    pub dri: Option<String>,
    pub status: TaskStatus,
    /// Repos this task touches, by registered name.
    pub repos: Vec<String>,
    /// repo name → task branch.
    pub branches: HashMap<String, String>,
    /// repo name → main SHA the branch is based on.
    pub base_shas: HashMap<String, String>,
    /// repo name → SHA that was fast-forwarded into main.
    pub merge_tips: HashMap<String, String>,
    pub merge_attempts: u32,
    /// Merge loop skips the task until this instant.
    pub retry_after: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the task carries everything required to start work.
    pub fn ready_for_progress(&self) -> bool {
        self.dri.is_some()
            && !self.repos.is_empty()
            && self
                .repos
                .iter()
                .all(|r| self.branches.contains_key(r) && self.base_shas.contains_key(r))
    }
}

/// Fields for task creation.  Everything not listed starts empty.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub dri: Option<String>,
}

/// Three-state patch value for nullable fields: distinguish "leave as is"
/// from "set to null" from "set to a value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> Patch<T> {
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Clear => *slot = None,
            Patch::Set(v) => *slot = Some(v),
        }
    }
}

/// Partial task update.  Map fields merge key-by-key; `repos` unions.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub dri: Patch<String>,
    pub repos: Vec<String>,
    pub branches: HashMap<String, String>,
    pub base_shas: HashMap<String, String>,
    pub merge_tips: HashMap<String, String>,
    pub merge_attempts: Option<u32>,
    pub retry_after: Patch<DateTime<Utc>>,
    pub rejection_reason: Patch<String>,
}

// ── Messages ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    Event,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

/// A mailbox message.  Lifecycle instants are monotonic:
/// `created_at ≤ delivered_at ≤ seen_at ≤ processed_at` (suffix may be null).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub team: String,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub seen_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A chat/event audit row in the team feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedEntry {
    pub id: i64,
    pub team: String,
    pub kind: MessageKind,
    pub actor: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ── Repositories & pipelines ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Approval {
    Auto,
    Manual,
}

impl Approval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// One named shell step of a pre-merge pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub name: String,
    pub command: String,
    /// Absent = no timeout.  A timed-out step fails the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl PipelineStep {
    /// Wrap a legacy single test command as a one-step pipeline.
    pub fn legacy_test_cmd(command: impl Into<String>) -> Vec<Self> {
        vec![Self {
            name: "test".into(),
            command: command.into(),
            timeout_seconds: None,
        }]
    }
}

/// A registered repository: team-scoped symbolic name → local checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoEntry {
    pub team: String,
    pub name: String,
    pub path: String,
    pub approval: Approval,
    pub pipeline: Vec<PipelineStep>,
}

// ── Participants ─────────────────────────────────────────────────────────

/// Per-agent persisted state (`state.yaml` in the agent directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub model: String,
}

fn default_role() -> String {
    "engineer".to_string()
}

/// An org-wide human member (`members/<name>.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
}
