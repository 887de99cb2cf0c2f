//! Dispatcher eligibility, admission and turn accounting.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{BlockingExecutor, StubExecutor, StubTurn};
use crew_core::bootstrap;
use crew_core::db::Db;
use crew_core::dispatcher::{Dispatcher, DispatcherConfig};
use crew_core::events::{EventBus, EventKind};
use crew_core::merge::WorktreeLocks;
use crew_core::types::{AgentProfile, NewTask, TaskPatch};
use crew_core::workflow::Workflow;

const TEAM: &str = "alpha";

struct Fixture {
    home: tempfile::TempDir,
    db: Arc<Db>,
    bus: EventBus,
    locks: Arc<WorktreeLocks>,
}

impl Fixture {
    fn new() -> Self {
        let home = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().expect("open db");
        db.migrate().expect("migrate");
        let db = Arc::new(db);
        let fx = Self {
            home,
            db,
            bus: EventBus::new(),
            locks: WorktreeLocks::new(),
        };
        fx.add_team(TEAM, &["tyson", "ada"]);
        fx
    }

    fn add_team(&self, team: &str, agents: &[&str]) {
        let profiles: Vec<AgentProfile> = agents
            .iter()
            .map(|name| AgentProfile {
                name: name.to_string(),
                role: "engineer".into(),
                model: String::new(),
            })
            .collect();
        bootstrap::bootstrap(self.home.path(), &self.db, team, &profiles).unwrap();
    }

    fn dispatcher(
        &self,
        executor: Arc<dyn crew_core::agent::TurnExecutor>,
        max_concurrent: usize,
    ) -> Arc<Dispatcher> {
        Dispatcher::new(
            Arc::clone(&self.db),
            self.bus.clone(),
            Arc::clone(&self.locks),
            executor,
            self.home.path().to_path_buf(),
            DispatcherConfig {
                max_concurrent,
                interval: Duration::from_millis(10),
                token_budget: None,
            },
        )
    }

    fn merging_task_for(&self, team: &str, dri: &str) -> i64 {
        let wf = Workflow::new(Arc::clone(&self.db), self.bus.clone());
        let task = self
            .db
            .create_task(
                team,
                NewTask {
                    title: "merge me".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        wf.assign_task(team, task.id, dri).unwrap();
        self.db
            .update_task(
                team,
                task.id,
                TaskPatch {
                    branches: HashMap::from([("r".to_string(), "b".to_string())]),
                    base_shas: HashMap::from([("r".to_string(), "sha".to_string())]),
                    ..Default::default()
                },
            )
            .unwrap();
        wf.accept_task(team, task.id).unwrap();
        wf.submit_for_review(team, task.id).unwrap();
        wf.approve_review(team, task.id).unwrap();
        wf.release_to_merge(team, task.id, false).unwrap();
        task.id
    }
}

async fn drain(dispatcher: &Arc<Dispatcher>) {
    for _ in 0..500 {
        if dispatcher.in_flight_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("in-flight turns did not drain");
}

#[tokio::test]
async fn idle_agents_are_not_dispatched() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(StubExecutor::new(vec![]), 32);
    assert_eq!(dispatcher.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn unread_mail_triggers_a_turn_and_is_processed() {
    let fx = Fixture::new();
    let exec = StubExecutor::new(vec![StubTurn::text("on it")]);
    let dispatcher = fx.dispatcher(Arc::clone(&exec) as _, 32);
    let mut events = fx.bus.subscribe();

    let id = fx.db.send_message(TEAM, "boss", "tyson", "please fix the login bug").unwrap();

    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    drain(&dispatcher).await;

    // The message body made it into the turn prompt.
    let prompts = exec.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("please fix the login bug"));
    assert!(prompts[0].contains("From boss"));

    // Seen before the turn, processed at turn end.
    let msg = fx.db.get_message(TEAM, id).unwrap().unwrap();
    assert!(msg.seen_at.is_some());
    assert!(msg.processed_at.is_some());

    // turn_started then turn_ended without error.
    let first = events.recv().await.unwrap();
    assert_eq!(first.kind, EventKind::TurnStarted);
    assert_eq!(first.agent.as_deref(), Some("tyson"));
    let second = events.recv().await.unwrap();
    assert_eq!(second.kind, EventKind::TurnEnded);
    assert!(second.error.is_none());
}

#[tokio::test]
async fn open_tasks_trigger_dispatch_without_mail() {
    let fx = Fixture::new();
    let exec = StubExecutor::new(vec![StubTurn::text("working")]);
    let dispatcher = fx.dispatcher(Arc::clone(&exec) as _, 32);

    let wf = Workflow::new(Arc::clone(&fx.db), fx.bus.clone());
    let task = fx
        .db
        .create_task(
            TEAM,
            NewTask {
                title: "implement retries".into(),
                description: "with backoff".into(),
                ..Default::default()
            },
        )
        .unwrap();
    wf.assign_task(TEAM, task.id, "ada").unwrap();

    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    drain(&dispatcher).await;

    let prompts = exec.prompts();
    assert!(prompts[0].contains("implement retries"));
}

#[tokio::test]
async fn merge_state_gate_blocks_the_dri() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(StubExecutor::new(vec![]), 32);

    fx.merging_task_for(TEAM, "tyson");
    fx.db.send_message(TEAM, "boss", "tyson", "ping").unwrap();
    // A second agent with mail stays eligible.
    fx.db.send_message(TEAM, "boss", "ada", "ping").unwrap();

    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    drain(&dispatcher).await;

    // tyson's mail is untouched by the gate.
    assert_eq!(fx.db.count_unread(TEAM, "tyson").unwrap(), 1);
    assert_eq!(fx.db.count_unread(TEAM, "ada").unwrap(), 0);
}

#[tokio::test]
async fn global_cap_limits_admission() {
    let fx = Fixture::new();
    let exec = BlockingExecutor::new();
    let dispatcher = fx.dispatcher(Arc::clone(&exec) as _, 1);

    fx.db.send_message(TEAM, "boss", "tyson", "a").unwrap();
    fx.db.send_message(TEAM, "boss", "ada", "b").unwrap();

    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(exec.started_count(), 1);
    assert_eq!(dispatcher.in_flight_count(), 1);

    exec.release.notify_waiters();
    drain(&dispatcher).await;
}

#[tokio::test]
async fn an_agent_never_has_two_turns_in_flight() {
    let fx = Fixture::new();
    let exec = BlockingExecutor::new();
    let dispatcher = fx.dispatcher(Arc::clone(&exec) as _, 32);

    fx.db.send_message(TEAM, "boss", "tyson", "a").unwrap();
    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Another message while the turn is running must not double-dispatch.
    fx.db.send_message(TEAM, "boss", "tyson", "b").unwrap();
    assert_eq!(dispatcher.tick().await.unwrap(), 0);
    assert_eq!(exec.started_count(), 1);

    exec.release.notify_waiters();
    drain(&dispatcher).await;
}

#[tokio::test]
async fn admission_round_robins_across_teams() {
    let fx = Fixture::new();
    fx.add_team("beta", &["grace", "ken"]);
    let exec = BlockingExecutor::new();
    let dispatcher = fx.dispatcher(Arc::clone(&exec) as _, 2);

    for agent in ["tyson", "ada"] {
        fx.db.send_message(TEAM, "boss", agent, "go").unwrap();
    }
    for agent in ["grace", "ken"] {
        fx.db.send_message("beta", "boss", agent, "go").unwrap();
    }

    assert_eq!(dispatcher.tick().await.unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // One slot per team, not two from the first team.
    let cwds = exec.started_cwds();
    let teams: Vec<bool> = vec![
        cwds.iter().any(|c| c.ends_with("projects/alpha")),
        cwds.iter().any(|c| c.ends_with("projects/beta")),
    ];
    assert_eq!(teams, [true, true], "got cwds: {cwds:?}");

    exec.release.notify_waiters();
    drain(&dispatcher).await;
}

#[tokio::test]
async fn failed_turns_leave_messages_seen_but_unprocessed() {
    let fx = Fixture::new();
    let exec = StubExecutor::new(vec![StubTurn::failing()]);
    let dispatcher = fx.dispatcher(Arc::clone(&exec) as _, 32);
    let mut events = fx.bus.subscribe();

    let id = fx.db.send_message(TEAM, "boss", "tyson", "doomed").unwrap();
    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    drain(&dispatcher).await;

    let msg = fx.db.get_message(TEAM, id).unwrap().unwrap();
    assert!(msg.seen_at.is_some());
    assert!(msg.processed_at.is_none());

    let first = events.recv().await.unwrap();
    assert_eq!(first.kind, EventKind::TurnStarted);
    let second = events.recv().await.unwrap();
    assert_eq!(second.kind, EventKind::TurnEnded);
    assert!(second.error.is_some());
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_turns() {
    let fx = Fixture::new();
    let exec = BlockingExecutor::new();
    let dispatcher = fx.dispatcher(Arc::clone(&exec) as _, 32);

    fx.db.send_message(TEAM, "boss", "tyson", "long turn").unwrap();
    assert_eq!(dispatcher.tick().await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Release the turn shortly after shutdown begins.
    let exec2 = Arc::clone(&exec);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        exec2.release.notify_waiters();
    });

    assert!(dispatcher.shutdown(Duration::from_secs(5)).await);
    assert_eq!(dispatcher.in_flight_count(), 0);

    // A stopped dispatcher launches nothing new.
    fx.db.send_message(TEAM, "boss", "ada", "late").unwrap();
    assert_eq!(dispatcher.tick().await.unwrap(), 0);
}
