//! Merge coordinator: rebase → fast-forward with bounded retries.
//!
//! For every task in `merging`, each of its repos goes through:
//! clean-main check → rebase in a disposable worktree → reset the agent
//! worktree to the rebased tip → pre-merge pipeline → fast-forward `main`.
//! Failures are classified; retryable classes increment `merge_attempts`
//! and may schedule a `retry_after`, non-retryable classes escalate to
//! `merge_failed` immediately.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::Db;
use crate::events::EventBus;
use crate::git::Git;
use crate::paths;
use crate::types::{Patch, PipelineStep, Task, TaskPatch, TaskStatus};
use crate::workflow::{Workflow, MAX_MERGE_ATTEMPTS};

pub const WORKTREE_RETRY_BASE: f64 = 5.0;
pub const WORKTREE_RETRY_JITTER: f64 = 0.3;

// ── Failure classification ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFailureReason {
    WorktreeError,
    DirtyMain,
    RebaseConflict,
    PreMergeFailed,
    SquashConflict,
}

impl MergeFailureReason {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::WorktreeError | Self::DirtyMain)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorktreeError => "WORKTREE_ERROR",
            Self::DirtyMain => "DIRTY_MAIN",
            Self::RebaseConflict => "REBASE_CONFLICT",
            Self::PreMergeFailed => "PRE_MERGE_FAILED",
            Self::SquashConflict => "SQUASH_CONFLICT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub task_id: i64,
    pub success: bool,
    pub detail: String,
    pub reason: Option<MergeFailureReason>,
}

impl MergeOutcome {
    pub fn ok(task_id: i64, detail: impl Into<String>) -> Self {
        Self {
            task_id,
            success: true,
            detail: detail.into(),
            reason: None,
        }
    }

    pub fn fail(task_id: i64, reason: MergeFailureReason, detail: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            detail: detail.into(),
            reason: Some(reason),
        }
    }
}

/// Backoff for `WORKTREE_ERROR` retries: `5s · 3^(n-1)`, jitter ±30%,
/// floor 5s.
pub fn worktree_retry_delay(attempt: u32) -> f64 {
    let base = WORKTREE_RETRY_BASE * 3f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = 1.0 + (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * WORKTREE_RETRY_JITTER;
    (base * jitter).max(WORKTREE_RETRY_BASE)
}

// ── Worktree locks ────────────────────────────────────────────────────────

/// Per-`(team, task)` reader/writer lock: agent turns hold read, the merge
/// pipeline holds write.  No persistent form.
#[derive(Default)]
pub struct WorktreeLocks {
    inner: std::sync::Mutex<HashMap<(String, i64), Arc<RwLock<()>>>>,
}

impl WorktreeLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, team: &str, task_id: i64) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry((team.to_string(), task_id))
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────

pub struct MergeCoordinator {
    db: Arc<Db>,
    home: PathBuf,
    locks: Arc<WorktreeLocks>,
    workflow: Workflow,
}

impl MergeCoordinator {
    pub fn new(db: Arc<Db>, home: PathBuf, locks: Arc<WorktreeLocks>, bus: EventBus) -> Self {
        let workflow = Workflow::new(Arc::clone(&db), bus);
        Self {
            db,
            home,
            locks,
            workflow,
        }
    }

    /// One poll cycle: attempt every due task in `merging` for the team.
    pub async fn merge_once(&self, team: &str) -> Result<Vec<MergeOutcome>> {
        let mut outcomes = Vec::new();
        let now = Utc::now();

        for task in self.db.list_tasks(team, Some(TaskStatus::Merging))? {
            if let Some(retry_after) = task.retry_after {
                if retry_after > now {
                    continue;
                }
            }
            // Clear the gate before the attempt so a later skip check can
            // not stall the task once the attempt has started.
            self.db.update_task(
                team,
                task.id,
                TaskPatch {
                    retry_after: Patch::Clear,
                    ..Default::default()
                },
            )?;

            let result = self.merge_task(&task).await;
            if result.success {
                self.workflow.complete_merge(team, task.id)?;
                info!("task #{} merged: {}", task.id, result.detail);
            } else {
                self.handle_merge_failure(team, &task, &result)?;
            }
            outcomes.push(result);
        }
        Ok(outcomes)
    }

    /// Run the full merge protocol for one task.
    pub async fn merge_task(&self, task: &Task) -> MergeOutcome {
        let lock = self.locks.get(&task.team, task.id);
        let guard = match lock.try_write_owned() {
            Ok(g) => g,
            Err(_) => {
                return MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::WorktreeError,
                    "could not acquire worktree write lock",
                );
            }
        };

        let mut merged = Vec::new();
        for repo_name in &task.repos {
            match self.merge_repo(task, repo_name).await {
                Ok(tip) => merged.push(format!("{repo_name}@{}", &tip[..8.min(tip.len())])),
                Err(outcome) => {
                    drop(guard);
                    return outcome;
                }
            }
        }
        drop(guard);
        MergeOutcome::ok(task.id, format!("fast-forwarded {}", merged.join(", ")))
    }

    /// Merge one repo of the task.  Returns the rebased tip on success,
    /// a classified outcome on failure.
    async fn merge_repo(&self, task: &Task, repo_name: &str) -> Result<String, MergeOutcome> {
        let team = task.team.as_str();
        let repo = match self.db.get_repo(team, repo_name) {
            Ok(Some(r)) => r,
            Ok(None) => {
                return Err(MergeOutcome {
                    task_id: task.id,
                    success: false,
                    detail: format!("repo '{repo_name}' is not registered for team '{team}'"),
                    reason: None,
                });
            }
            Err(e) => {
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::WorktreeError,
                    format!("repo lookup failed: {e}"),
                ));
            }
        };
        let Some(branch) = task.branches.get(repo_name) else {
            return Err(MergeOutcome {
                task_id: task.id,
                success: false,
                detail: format!("task #{} has no branch for repo '{repo_name}'", task.id),
                reason: None,
            });
        };

        let git = Git::new(&repo.path);

        // The target checkout must be on main with nothing uncommitted.
        match git.status_clean(&repo.path) {
            Ok(true) => {}
            Ok(false) => {
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::DirtyMain,
                    format!("{}: main checkout has uncommitted changes", repo.path),
                ));
            }
            Err(e) => {
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::WorktreeError,
                    format!("git status failed: {e}"),
                ));
            }
        }
        match git.current_branch(&repo.path) {
            Ok(b) if b == "main" => {}
            Ok(b) => {
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::DirtyMain,
                    format!("{}: checkout is on '{b}', not main", repo.path),
                ));
            }
            Err(e) => {
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::WorktreeError,
                    format!("git rev-parse failed: {e}"),
                ));
            }
        }

        let main_head = git.rev_parse("main").map_err(|e| {
            MergeOutcome::fail(
                task.id,
                MergeFailureReason::WorktreeError,
                format!("rev-parse main failed: {e}"),
            )
        })?;

        // Rebase the task branch onto main in a disposable worktree under
        // the home directory (unique per daemon).
        let scratch = paths::protected_dir(&self.home)
            .join("merge-scratch")
            .join(format!("{team}-T{}-{repo_name}", task.id));
        if let Err(e) = std::fs::create_dir_all(scratch.parent().unwrap_or(&self.home)) {
            return Err(MergeOutcome::fail(
                task.id,
                MergeFailureReason::WorktreeError,
                format!("scratch dir failed: {e}"),
            ));
        }
        let scratch_str = scratch.to_string_lossy().to_string();
        let _ = git.remove_worktree(&scratch_str);
        let _ = std::fs::remove_dir_all(&scratch);
        git.prune_worktrees();
        git.add_detached_worktree(&scratch_str, branch).map_err(|e| {
            MergeOutcome::fail(
                task.id,
                MergeFailureReason::WorktreeError,
                format!("scratch worktree failed: {e}"),
            )
        })?;

        let rebase = git.rebase_onto(&scratch_str, "main");
        let rebased_tip = match rebase {
            Ok(r) if r.success() => git.exec(&scratch_str, &["rev-parse", "HEAD"]).ok(),
            Ok(r) => {
                git.abort_rebase(&scratch_str);
                let _ = git.remove_worktree(&scratch_str);
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::RebaseConflict,
                    format!("rebase of {branch} onto main conflicted:\n{}", r.combined_output()),
                ));
            }
            Err(e) => {
                let _ = git.remove_worktree(&scratch_str);
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::WorktreeError,
                    format!("rebase spawn failed: {e}"),
                ));
            }
        };
        let _ = git.remove_worktree(&scratch_str);
        let Some(tip) = rebased_tip.map(|r| r.stdout.trim().to_string()).filter(|s| !s.is_empty())
        else {
            return Err(MergeOutcome::fail(
                task.id,
                MergeFailureReason::WorktreeError,
                "could not resolve rebased tip",
            ));
        };

        // Reset the agent's live worktree so its next turn starts from the
        // merged basis.  Untracked files survive the hard reset.
        let agent_wt = paths::task_worktree_path(&self.home, team, repo_name, task.id);
        if !agent_wt.is_dir() {
            return Err(MergeOutcome::fail(
                task.id,
                MergeFailureReason::WorktreeError,
                format!("agent worktree missing at {}", agent_wt.display()),
            ));
        }
        let agent_wt_str = agent_wt.to_string_lossy().to_string();
        if let Err(e) = git.reset_hard(&agent_wt_str, &tip) {
            return Err(MergeOutcome::fail(
                task.id,
                MergeFailureReason::WorktreeError,
                format!("agent worktree reset failed: {e}"),
            ));
        }

        if let Err(e) = self.db.update_task(
            team,
            task.id,
            TaskPatch {
                base_shas: HashMap::from([(repo_name.to_string(), main_head.clone())]),
                ..Default::default()
            },
        ) {
            return Err(MergeOutcome::fail(
                task.id,
                MergeFailureReason::WorktreeError,
                format!("base_sha update failed: {e}"),
            ));
        }

        // Pre-merge pipeline runs in the agent worktree.
        if let Err(outcome) = self
            .run_pipeline(task.id, &repo.pipeline, &agent_wt_str)
            .await
        {
            return Err(outcome);
        }

        // Fast-forward main.  If main advanced since the HEAD capture this
        // is no longer possible — retryable, the next cycle restarts.
        match git.fast_forward(&repo.path, &tip) {
            Ok(r) if r.success() => {}
            Ok(r) => {
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::DirtyMain,
                    format!("fast-forward of main to {tip} failed:\n{}", r.combined_output()),
                ));
            }
            Err(e) => {
                return Err(MergeOutcome::fail(
                    task.id,
                    MergeFailureReason::WorktreeError,
                    format!("fast-forward spawn failed: {e}"),
                ));
            }
        }

        if let Err(e) = self.db.update_task(
            team,
            task.id,
            TaskPatch {
                merge_tips: HashMap::from([(repo_name.to_string(), tip.clone())]),
                ..Default::default()
            },
        ) {
            warn!("task #{}: merge_tip record failed: {e}", task.id);
        }

        Ok(tip)
    }

    async fn run_pipeline(
        &self,
        task_id: i64,
        steps: &[PipelineStep],
        dir: &str,
    ) -> Result<(), MergeOutcome> {
        for step in steps {
            info!("task #{task_id}: pipeline step '{}' in {dir}", step.name);
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&step.command).current_dir(dir);
            let output = match step.timeout_seconds {
                Some(secs) => {
                    match tokio::time::timeout(
                        std::time::Duration::from_secs(secs),
                        cmd.output(),
                    )
                    .await
                    {
                        Ok(out) => out,
                        Err(_) => {
                            return Err(MergeOutcome::fail(
                                task_id,
                                MergeFailureReason::PreMergeFailed,
                                format!("pipeline step '{}' timed out after {secs}s", step.name),
                            ));
                        }
                    }
                }
                None => cmd.output().await,
            };
            match output {
                Ok(out) if out.status.success() => {}
                Ok(out) => {
                    return Err(MergeOutcome::fail(
                        task_id,
                        MergeFailureReason::PreMergeFailed,
                        format!(
                            "pipeline step '{}' exited {}:\n{}\n{}",
                            step.name,
                            out.status.code().unwrap_or(1),
                            String::from_utf8_lossy(&out.stdout),
                            String::from_utf8_lossy(&out.stderr),
                        ),
                    ));
                }
                Err(e) => {
                    return Err(MergeOutcome::fail(
                        task_id,
                        MergeFailureReason::WorktreeError,
                        format!("pipeline step '{}' failed to spawn: {e}", step.name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Classify a failed attempt: bump the counter, schedule the retry or
    /// escalate to `merge_failed`.
    pub fn handle_merge_failure(
        &self,
        team: &str,
        task: &Task,
        result: &MergeOutcome,
    ) -> Result<()> {
        let retryable = result.reason.map(|r| r.retryable()).unwrap_or(false);
        let label = result
            .reason
            .map(|r| r.as_str())
            .unwrap_or("UNCLASSIFIED");

        if !retryable {
            warn!(
                "task #{}: non-retryable merge failure [{label}]: {}",
                task.id, result.detail
            );
            self.workflow
                .fail_merge(team, task.id, &format!("[{label}] {}", result.detail))?;
            return Ok(());
        }

        let attempts = task.merge_attempts + 1;
        self.db.update_task(
            team,
            task.id,
            TaskPatch {
                merge_attempts: Some(attempts),
                ..Default::default()
            },
        )?;

        if attempts >= MAX_MERGE_ATTEMPTS {
            warn!(
                "task #{}: merge attempts exhausted ({attempts}) [{label}]: {}",
                task.id, result.detail
            );
            self.workflow
                .fail_merge(team, task.id, &format!("[{label}] attempts exhausted: {}", result.detail))?;
            return Ok(());
        }

        if result.reason == Some(MergeFailureReason::WorktreeError) {
            let delay = worktree_retry_delay(attempts);
            let retry_at = Utc::now()
                + Duration::milliseconds((delay * 1000.0) as i64);
            self.db.update_task(
                team,
                task.id,
                TaskPatch {
                    retry_after: Patch::Set(retry_at),
                    ..Default::default()
                },
            )?;
            info!(
                "task #{}: [{label}] attempt {attempts}/{MAX_MERGE_ATTEMPTS}, retrying in {delay:.1}s",
                task.id
            );
        } else {
            info!(
                "task #{}: [{label}] attempt {attempts}/{MAX_MERGE_ATTEMPTS}, retrying next cycle",
                task.id
            );
        }

        self.db.log_event(
            team,
            "merge",
            &format!("task #{} merge attempt {attempts} failed [{label}]: {}", task.id, result.detail),
        )?;
        Ok(())
    }
}
