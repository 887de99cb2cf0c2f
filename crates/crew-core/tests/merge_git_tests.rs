//! End-to-end merge protocol against real git repositories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crew_core::db::Db;
use crew_core::events::EventBus;
use crew_core::merge::{MergeCoordinator, MergeFailureReason, WorktreeLocks};
use crew_core::paths;
use crew_core::types::{Approval, NewTask, PipelineStep, Task, TaskPatch, TaskStatus};
use crew_core::workflow::Workflow;

const TEAM: &str = "myteam";
const REPO: &str = "myrepo";

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn setup_repo(root: &Path) -> PathBuf {
    let repo = root.join("source_repo");
    std::fs::create_dir_all(&repo).unwrap();
    let output = Command::new("git")
        .arg("-C")
        .arg(&repo)
        .args(["init", "-b", "main"])
        .output()
        .expect("git init");
    assert!(output.status.success());
    git(&repo, &["config", "user.email", "test@test.com"]);
    git(&repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "# Test repo\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "Initial commit"]);
    repo
}

fn make_feature_branch(repo: &Path, filename: &str, content: &str) {
    git(repo, &["checkout", "-b", "feature/test"]);
    std::fs::write(repo.join(filename), content).unwrap();
    git(repo, &["add", "."]);
    git(repo, &["commit", "-m", &format!("Add {filename}")]);
    git(repo, &["checkout", "main"]);
}

fn advance_main(repo: &Path, filename: &str, content: &str) {
    git(repo, &["checkout", "main"]);
    std::fs::write(repo.join(filename), content).unwrap();
    git(repo, &["add", "."]);
    git(repo, &["commit", "-m", &format!("Add {filename}")]);
}

struct Fixture {
    home: tempfile::TempDir,
    db: Arc<Db>,
    repo: PathBuf,
    locks: Arc<WorktreeLocks>,
}

impl Fixture {
    fn new() -> Self {
        let home = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().expect("open db");
        db.migrate().expect("migrate");
        db.create_team(TEAM).expect("create team");
        let repo = setup_repo(home.path());
        make_feature_branch(&repo, "feature.py", "# New\n");
        Self {
            home,
            db: Arc::new(db),
            repo,
            locks: WorktreeLocks::new(),
        }
    }

    fn register_repo(&self, pipeline: &[PipelineStep]) {
        self.db
            .register_repo(
                TEAM,
                REPO,
                &self.repo.to_string_lossy(),
                Approval::Auto,
                pipeline,
            )
            .unwrap();
    }

    fn coordinator(&self) -> MergeCoordinator {
        MergeCoordinator::new(
            Arc::clone(&self.db),
            self.home.path().to_path_buf(),
            Arc::clone(&self.locks),
            EventBus::new(),
        )
    }

    /// Task in `merging`, with the agent worktree checked out on the
    /// feature branch.
    fn merging_task(&self) -> Task {
        let wf = Workflow::new(Arc::clone(&self.db), EventBus::new());
        let task = self
            .db
            .create_task(
                TEAM,
                NewTask {
                    title: "Test".into(),
                    description: String::new(),
                    dri: None,
                },
            )
            .unwrap();
        wf.assign_task(TEAM, task.id, "tyson").unwrap();
        let base = git(&self.repo, &["rev-parse", "main"]);
        self.db
            .update_task(
                TEAM,
                task.id,
                TaskPatch {
                    branches: HashMap::from([(REPO.to_string(), "feature/test".to_string())]),
                    base_shas: HashMap::from([(REPO.to_string(), base)]),
                    ..Default::default()
                },
            )
            .unwrap();
        wf.accept_task(TEAM, task.id).unwrap();

        let worktree = paths::task_worktree_path(self.home.path(), TEAM, REPO, task.id);
        std::fs::create_dir_all(worktree.parent().unwrap()).unwrap();
        git(
            &self.repo,
            &[
                "worktree",
                "add",
                &worktree.to_string_lossy(),
                "feature/test",
            ],
        );

        wf.submit_for_review(TEAM, task.id).unwrap();
        wf.approve_review(TEAM, task.id).unwrap();
        wf.release_to_merge(TEAM, task.id, false).unwrap()
    }
}

#[tokio::test]
async fn clean_merge_fast_forwards_main_and_completes_the_task() {
    let fx = Fixture::new();
    fx.register_repo(&[]);
    let task = fx.merging_task();
    let feature_tip = git(&fx.repo, &["rev-parse", "feature/test"]);

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success, "merge failed: {}", outcomes[0].detail);

    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Done);
    assert_eq!(updated.merge_tips.get(REPO).unwrap(), &feature_tip);
    assert!(updated.retry_after.is_none());

    // main now points at the feature tip.
    assert_eq!(git(&fx.repo, &["rev-parse", "main"]), feature_tip);
    assert!(fx.repo.join("feature.py").exists());
}

#[tokio::test]
async fn merge_after_main_advanced_rebases_and_updates_base_sha() {
    let fx = Fixture::new();
    fx.register_repo(&[]);
    let task = fx.merging_task();
    advance_main(&fx.repo, "main.py", "# Main change\n");
    let new_main = git(&fx.repo, &["rev-parse", "main"]);

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(outcomes[0].success, "merge failed: {}", outcomes[0].detail);

    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Done);
    // base_sha records the main HEAD captured before the fast-forward.
    assert_eq!(updated.base_shas.get(REPO).unwrap(), &new_main);

    // Both the main change and the feature change are in main's tree.
    git(&fx.repo, &["checkout", "main"]);
    assert!(fx.repo.join("main.py").exists());
    assert!(fx.repo.join("feature.py").exists());
}

#[tokio::test]
async fn rebase_conflict_is_non_retryable() {
    let fx = Fixture::new();
    fx.register_repo(&[]);
    let task = fx.merging_task();
    // Conflicting edit to the same file on main.
    advance_main(&fx.repo, "feature.py", "# Conflicting\n");

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(!outcomes[0].success);
    assert_eq!(outcomes[0].reason, Some(MergeFailureReason::RebaseConflict));

    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::MergeFailed);
}

#[tokio::test]
async fn failing_pipeline_step_blocks_the_merge() {
    let fx = Fixture::new();
    fx.register_repo(&[PipelineStep {
        name: "test".into(),
        command: "exit 3".into(),
        timeout_seconds: None,
    }]);
    let task = fx.merging_task();
    let main_before = git(&fx.repo, &["rev-parse", "main"]);

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(!outcomes[0].success);
    assert_eq!(outcomes[0].reason, Some(MergeFailureReason::PreMergeFailed));
    assert!(outcomes[0].detail.contains("test"));

    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::MergeFailed);
    // main untouched.
    assert_eq!(git(&fx.repo, &["rev-parse", "main"]), main_before);
}

#[tokio::test]
async fn passing_pipeline_runs_in_the_agent_worktree() {
    let fx = Fixture::new();
    fx.register_repo(&[PipelineStep {
        name: "probe".into(),
        command: "test -f feature.py".into(),
        timeout_seconds: Some(30),
    }]);
    let task = fx.merging_task();

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(outcomes[0].success, "merge failed: {}", outcomes[0].detail);
    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Done);
}

#[tokio::test]
async fn timed_out_pipeline_step_fails_the_merge() {
    let fx = Fixture::new();
    fx.register_repo(&[PipelineStep {
        name: "slow".into(),
        command: "sleep 5".into(),
        timeout_seconds: Some(1),
    }]);
    let task = fx.merging_task();

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(!outcomes[0].success);
    assert_eq!(outcomes[0].reason, Some(MergeFailureReason::PreMergeFailed));
    assert!(outcomes[0].detail.contains("timed out"));

    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::MergeFailed);
}

#[tokio::test]
async fn fast_forward_race_is_retryable_and_succeeds_next_cycle() {
    let fx = Fixture::new();
    let marker = fx.home.path().join("race-ran");
    // The pipeline step runs between the HEAD capture and the
    // fast-forward; on its first run it pushes an unrelated commit to
    // main, reproducing the race.
    let race_cmd = format!(
        "if [ ! -f {marker} ]; then touch {marker}; git -C {repo} commit --allow-empty -m race; fi",
        marker = marker.to_string_lossy(),
        repo = fx.repo.to_string_lossy(),
    );
    fx.register_repo(&[PipelineStep {
        name: "race".into(),
        command: race_cmd,
        timeout_seconds: None,
    }]);
    let task = fx.merging_task();

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(!outcomes[0].success);
    assert_eq!(outcomes[0].reason, Some(MergeFailureReason::DirtyMain));

    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Merging);
    assert_eq!(updated.merge_attempts, 1);
    assert!(updated.retry_after.is_none(), "DIRTY_MAIN retries next poll");

    // Next cycle rebases over the new main commit and succeeds.
    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(outcomes[0].success, "retry failed: {}", outcomes[0].detail);
    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Done);
}

#[tokio::test]
async fn untracked_files_in_the_agent_worktree_survive_the_merge() {
    let fx = Fixture::new();
    fx.register_repo(&[]);
    let task = fx.merging_task();
    advance_main(&fx.repo, "main.py", "# Main change\n");

    let worktree = paths::task_worktree_path(fx.home.path(), TEAM, REPO, task.id);
    std::fs::write(worktree.join("scratch-notes.txt"), "keep me").unwrap();

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(outcomes[0].success, "merge failed: {}", outcomes[0].detail);

    assert!(worktree.join("scratch-notes.txt").exists());
    // The worktree was reset to the rebased tip, so the main change is
    // visible to the agent's next turn.
    assert!(worktree.join("main.py").exists());
}

#[tokio::test]
async fn dirty_main_checkout_is_a_retryable_failure() {
    let fx = Fixture::new();
    fx.register_repo(&[]);
    let task = fx.merging_task();
    std::fs::write(fx.repo.join("README.md"), "# dirtied\n").unwrap();

    let outcomes = fx.coordinator().merge_once(TEAM).await.unwrap();
    assert!(!outcomes[0].success);
    assert_eq!(outcomes[0].reason, Some(MergeFailureReason::DirtyMain));

    let updated = fx.db.get_task(TEAM, task.id).unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Merging);
    assert_eq!(updated.merge_attempts, 1);
}
