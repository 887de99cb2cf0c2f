//! Workflow state-machine transitions, guards and side effects.

use std::collections::HashMap;
use std::sync::Arc;

use crew_core::db::Db;
use crew_core::events::EventBus;
use crew_core::types::{NewTask, Task, TaskPatch, TaskStatus};
use crew_core::workflow::{validate_transition, Workflow};

fn open_db() -> Arc<Db> {
    let db = Db::open_in_memory().expect("open in-memory db");
    db.migrate().expect("migrate");
    db.create_team("alpha").expect("create team");
    Arc::new(db)
}

fn workflow(db: &Arc<Db>) -> Workflow {
    Workflow::new(Arc::clone(db), EventBus::new())
}

fn new_task(db: &Db, title: &str) -> Task {
    db.create_task(
        "alpha",
        NewTask {
            title: title.into(),
            description: "desc".into(),
            dri: None,
        },
    )
    .expect("create_task")
}

/// Walk a task to `in_progress` with everything the guard requires.
fn task_in_progress(db: &Arc<Db>) -> Task {
    let wf = workflow(db);
    let task = new_task(db, "T");
    wf.assign_task("alpha", task.id, "alice").unwrap();
    db.update_task(
        "alpha",
        task.id,
        TaskPatch {
            branches: HashMap::from([("myrepo".to_string(), "feature/t".to_string())]),
            base_shas: HashMap::from([("myrepo".to_string(), "abc123".to_string())]),
            ..Default::default()
        },
    )
    .unwrap();
    wf.accept_task("alpha", task.id).unwrap()
}

#[test]
fn new_tasks_start_unassigned() {
    let db = open_db();
    let task = new_task(&db, "T");
    assert_eq!(task.status, TaskStatus::Unassigned);
    assert_eq!(task.merge_attempts, 0);
    assert!(task.retry_after.is_none());
}

#[test]
fn full_happy_path_reaches_done() {
    let db = open_db();
    let wf = workflow(&db);
    let task = task_in_progress(&db);

    wf.submit_for_review("alpha", task.id).unwrap();
    wf.approve_review("alpha", task.id).unwrap();
    wf.release_to_merge("alpha", task.id, false).unwrap();
    let done = wf.complete_merge("alpha", task.id).unwrap();
    assert_eq!(done.status, TaskStatus::Done);
}

#[test]
fn undeclared_transitions_are_rejected() {
    let db = open_db();
    let task = new_task(&db, "T");

    // unassigned cannot jump to review, merging or done
    for target in [
        TaskStatus::InReview,
        TaskStatus::InApproval,
        TaskStatus::Merging,
        TaskStatus::Done,
        TaskStatus::MergeFailed,
    ] {
        let err = db.change_status("alpha", task.id, target).unwrap_err();
        assert!(
            err.to_string().contains("invalid transition"),
            "expected InvalidTransition for {target}, got: {err}"
        );
    }
}

#[test]
fn assignment_requires_a_dri() {
    let db = open_db();
    let task = new_task(&db, "T");
    let err = db
        .change_status("alpha", task.id, TaskStatus::Assigned)
        .unwrap_err();
    assert!(err.to_string().contains("DRI"), "got: {err}");
}

#[test]
fn in_progress_requires_repo_branch_and_base_sha() {
    let db = open_db();
    let wf = workflow(&db);
    let task = new_task(&db, "T");
    wf.assign_task("alpha", task.id, "alice").unwrap();

    let err = db
        .change_status("alpha", task.id, TaskStatus::InProgress)
        .unwrap_err();
    assert!(err.to_string().contains("branch"), "got: {err}");

    db.update_task(
        "alpha",
        task.id,
        TaskPatch {
            branches: HashMap::from([("r".to_string(), "b".to_string())]),
            base_shas: HashMap::from([("r".to_string(), "sha".to_string())]),
            ..Default::default()
        },
    )
    .unwrap();
    let task = db.change_status("alpha", task.id, TaskStatus::InProgress).unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
}

#[test]
fn reject_records_reason_and_notifies_manager() {
    let db = open_db();
    let wf = workflow(&db);
    let task = task_in_progress(&db);
    wf.submit_for_review("alpha", task.id).unwrap();

    let rejected = wf
        .reject("alpha", task.id, "tests are missing", Some("boss-bot"))
        .unwrap();
    assert_eq!(rejected.status, TaskStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("tests are missing"));

    let inbox = db.inbox("alpha", "boss-bot", true).unwrap();
    assert_eq!(inbox.len(), 1);
    assert!(inbox[0].body.contains("tests are missing"));
}

#[test]
fn rework_clears_the_rejection_reason() {
    let db = open_db();
    let wf = workflow(&db);
    let task = task_in_progress(&db);
    wf.submit_for_review("alpha", task.id).unwrap();
    wf.reject("alpha", task.id, "nope", None).unwrap();

    let reworked = wf.rework("alpha", task.id).unwrap();
    assert_eq!(reworked.status, TaskStatus::InProgress);
    assert!(reworked.rejection_reason.is_none());
}

#[test]
fn reject_is_only_valid_from_review_or_approval() {
    let db = open_db();
    let wf = workflow(&db);
    let task = task_in_progress(&db);
    let err = wf.reject("alpha", task.id, "too early", None).unwrap_err();
    assert!(err.to_string().contains("invalid transition"), "got: {err}");
}

#[test]
fn discard_is_allowed_from_any_non_terminal_state() {
    let db = open_db();
    let wf = workflow(&db);

    let fresh = new_task(&db, "fresh");
    assert_eq!(
        wf.discard("alpha", fresh.id).unwrap().status,
        TaskStatus::Discarded
    );

    let working = task_in_progress(&db);
    assert_eq!(
        wf.discard("alpha", working.id).unwrap().status,
        TaskStatus::Discarded
    );
}

#[test]
fn terminal_states_admit_nothing() {
    let db = open_db();
    let wf = workflow(&db);
    let task = task_in_progress(&db);
    wf.submit_for_review("alpha", task.id).unwrap();
    wf.reject("alpha", task.id, "no", None).unwrap();
    wf.rework("alpha", task.id).unwrap();
    let task = wf.discard("alpha", task.id).unwrap();
    assert!(task.status.is_terminal());

    for target in [
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Discarded,
        TaskStatus::Done,
    ] {
        assert!(db.change_status("alpha", task.id, target).is_err());
    }
}

#[test]
fn merging_may_loop_on_itself() {
    let db = open_db();
    let wf = workflow(&db);
    let task = task_in_progress(&db);
    wf.submit_for_review("alpha", task.id).unwrap();
    wf.approve_review("alpha", task.id).unwrap();
    wf.release_to_merge("alpha", task.id, false).unwrap();

    // Retryable merge failures keep the task in merging.
    let task = db.change_status("alpha", task.id, TaskStatus::Merging).unwrap();
    assert_eq!(task.status, TaskStatus::Merging);
}

#[test]
fn every_transition_writes_an_audit_event() {
    let db = open_db();
    let wf = workflow(&db);
    let task = new_task(&db, "T");
    wf.assign_task("alpha", task.id, "alice").unwrap();

    let feed = db.feed("alpha", 10).unwrap();
    assert!(feed.iter().any(|e| e.body.contains("assigned to alice")));
}

#[test]
fn validate_transition_is_pure_table_lookup() {
    let db = open_db();
    let task = new_task(&db, "T");
    assert!(validate_transition(&task, TaskStatus::Discarded).is_ok());
    assert!(validate_transition(&task, TaskStatus::Done).is_err());
}

#[test]
fn unknown_task_surfaces_a_typed_error() {
    let db = open_db();
    let err = db
        .change_status("alpha", 9999, TaskStatus::Assigned)
        .unwrap_err();
    assert!(err.to_string().contains("not found"), "got: {err}");
}
