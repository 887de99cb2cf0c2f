//! Task workflow state machine.
//!
//! The transition table is closed: anything not listed is rejected with
//! [`WorkflowError::InvalidTransition`].  Guards run before the write.
//! Every transition that goes through [`Workflow`] leaves an `event` row
//! in the team feed and broadcasts `task_changed` on the event bus.

use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::db::Db;
use crate::events::{Event, EventBus};
use crate::types::{Approval, Patch, Task, TaskPatch, TaskStatus};

pub const MAX_MERGE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid transition {from} → {to} for task #{id}")]
    InvalidTransition {
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task #{id} not found in team '{team}'")]
    UnknownTask { team: String, id: i64 },
    #[error("task #{id} is missing {what} (required before {status})")]
    GuardFailed {
        id: i64,
        what: &'static str,
        status: TaskStatus,
    },
}

/// Check whether `task` may move to `to`.  Pure — no side effects.
pub fn validate_transition(task: &Task, to: TaskStatus) -> Result<(), WorkflowError> {
    use TaskStatus::*;
    let from = task.status;

    // Manager discard is allowed from any non-terminal state.
    if to == Discarded {
        if from.is_terminal() {
            return Err(WorkflowError::InvalidTransition { id: task.id, from, to });
        }
        return Ok(());
    }

    let allowed = matches!(
        (from, to),
        (Unassigned, Assigned)
            | (Assigned, InProgress)
            | (InProgress, InReview)
            | (InReview, InApproval)
            | (InReview, Rejected)
            | (InApproval, Merging)
            | (InApproval, Rejected)
            | (Merging, Done)
            | (Merging, Merging)
            | (Merging, MergeFailed)
            | (Rejected, InProgress)
    );
    if !allowed {
        return Err(WorkflowError::InvalidTransition { id: task.id, from, to });
    }

    match to {
        Assigned => {
            if task.dri.is_none() {
                return Err(WorkflowError::GuardFailed {
                    id: task.id,
                    what: "a DRI",
                    status: to,
                });
            }
        }
        InProgress if from == Assigned => {
            if !task.ready_for_progress() {
                return Err(WorkflowError::GuardFailed {
                    id: task.id,
                    what: "repo, branch and base_sha",
                    status: to,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// Transition operations over the store, with feed audit and event
/// broadcast.  This is what the HTTP façade and CLI call.
pub struct Workflow {
    db: Arc<Db>,
    bus: EventBus,
}

impl Workflow {
    pub fn new(db: Arc<Db>, bus: EventBus) -> Self {
        Self { db, bus }
    }

    fn record(&self, team: &str, task: &Task, detail: &str) -> Result<()> {
        self.db.log_event(team, "workflow", detail)?;
        self.bus.broadcast(Event::task_changed(team, task.id, detail));
        Ok(())
    }

    pub fn assign_task(&self, team: &str, id: i64, dri: &str) -> Result<Task> {
        self.db.update_task(
            team,
            id,
            TaskPatch {
                dri: Patch::Set(dri.to_string()),
                ..Default::default()
            },
        )?;
        let task = self.db.change_status(team, id, TaskStatus::Assigned)?;
        self.record(team, &task, &format!("task #{id} assigned to {dri}"))?;
        Ok(task)
    }

    pub fn accept_task(&self, team: &str, id: i64) -> Result<Task> {
        let task = self.db.change_status(team, id, TaskStatus::InProgress)?;
        self.record(team, &task, &format!("task #{id} accepted"))?;
        Ok(task)
    }

    pub fn submit_for_review(&self, team: &str, id: i64) -> Result<Task> {
        let task = self.db.change_status(team, id, TaskStatus::InReview)?;
        self.record(team, &task, &format!("task #{id} submitted for review"))?;
        Ok(task)
    }

    pub fn approve_review(&self, team: &str, id: i64) -> Result<Task> {
        let task = self.db.change_status(team, id, TaskStatus::InApproval)?;
        self.record(team, &task, &format!("task #{id} passed review"))?;
        Ok(task)
    }

    /// Reject from `in_review` or `in_approval`, recording the reason and
    /// notifying the team manager via the mailbox.
    pub fn reject(&self, team: &str, id: i64, reason: &str, manager: Option<&str>) -> Result<Task> {
        self.db.change_status(team, id, TaskStatus::Rejected)?;
        let task = self.db.update_task(
            team,
            id,
            TaskPatch {
                rejection_reason: Patch::Set(reason.to_string()),
                ..Default::default()
            },
        )?;
        if let Some(manager) = manager {
            self.db.send_message(
                team,
                "workflow",
                manager,
                &format!("Task #{id} \"{}\" was rejected: {reason}", task.title),
            )?;
        }
        self.record(team, &task, &format!("task #{id} rejected: {reason}"))?;
        Ok(task)
    }

    /// Release an approved task into the merge queue.  Auto-approval repos
    /// release immediately; manual repos require `by_human`.
    pub fn release_to_merge(&self, team: &str, id: i64, by_human: bool) -> Result<Task> {
        let task = self
            .db
            .get_task(team, id)?
            .ok_or(WorkflowError::UnknownTask { team: team.into(), id })?;
        let needs_human = task.repos.iter().any(|name| {
            self.db
                .get_repo(team, name)
                .ok()
                .flatten()
                .map(|r| r.approval == Approval::Manual)
                .unwrap_or(false)
        });
        if needs_human && !by_human {
            anyhow::bail!("task #{id} targets a manual-approval repo; a human must release it");
        }
        let task = self.db.change_status(team, id, TaskStatus::Merging)?;
        self.record(team, &task, &format!("task #{id} released for merge"))?;
        Ok(task)
    }

    /// Rework a rejected task: back to `in_progress` with the reason cleared.
    pub fn rework(&self, team: &str, id: i64) -> Result<Task> {
        self.db.change_status(team, id, TaskStatus::InProgress)?;
        let task = self.db.update_task(
            team,
            id,
            TaskPatch {
                rejection_reason: Patch::Clear,
                ..Default::default()
            },
        )?;
        self.record(team, &task, &format!("task #{id} sent back for rework"))?;
        Ok(task)
    }

    pub fn discard(&self, team: &str, id: i64) -> Result<Task> {
        let task = self.db.change_status(team, id, TaskStatus::Discarded)?;
        self.record(team, &task, &format!("task #{id} discarded"))?;
        Ok(task)
    }

    pub fn complete_merge(&self, team: &str, id: i64) -> Result<Task> {
        let task = self.db.change_status(team, id, TaskStatus::Done)?;
        self.record(team, &task, &format!("task #{id} merged"))?;
        Ok(task)
    }

    pub fn fail_merge(&self, team: &str, id: i64, detail: &str) -> Result<Task> {
        let task = self.db.change_status(team, id, TaskStatus::MergeFailed)?;
        self.record(team, &task, &format!("task #{id} merge failed: {detail}"))?;
        self.bus
            .broadcast(Event::merge_failed(team, id, detail));
        Ok(task)
    }
}
