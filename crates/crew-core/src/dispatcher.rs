//! Dispatcher — the daemon's main control loop.
//!
//! Each cycle selects eligible agents (no in-flight turn, not gated by a
//! pending merge, with unread mail or an open task), admits them under the
//! global concurrency cap with round-robin across teams, and runs one
//! session turn per admitted agent.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::agent::TurnExecutor;
use crate::config;
use crate::db::Db;
use crate::events::{Event, EventBus};
use crate::merge::WorktreeLocks;
use crate::paths;
use crate::session::Session;
use crate::types::{Message, Task, TaskStatus};

pub const DEFAULT_MAX_CONCURRENT: usize = 32;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub interval: Duration,
    /// Session rotation threshold override.
    pub token_budget: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            interval: DEFAULT_INTERVAL,
            token_budget: None,
        }
    }
}

type AgentKey = (String, String);

pub struct Dispatcher {
    db: Arc<Db>,
    bus: EventBus,
    locks: Arc<WorktreeLocks>,
    executor: Arc<dyn TurnExecutor>,
    home: PathBuf,
    config: DispatcherConfig,
    sessions: Mutex<HashMap<AgentKey, Session>>,
    in_flight: std::sync::Mutex<HashSet<AgentKey>>,
    stopping: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Db>,
        bus: EventBus,
        locks: Arc<WorktreeLocks>,
        executor: Arc<dyn TurnExecutor>,
        home: PathBuf,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            locks,
            executor,
            home,
            config,
            sessions: Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn is_in_flight(&self, key: &AgentKey) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// State gate: an agent that is DRI of any task in `merging` must not
    /// be dispatched — its next turn could race the pending merge.
    fn gated_by_merge(&self, merging: &[Task], agent: &str) -> bool {
        merging.iter().any(|t| t.dri.as_deref() == Some(agent))
    }

    fn has_work(&self, team: &str, agent: &str) -> Result<bool> {
        if self.db.count_unread(team, agent)? > 0 {
            return Ok(true);
        }
        let open = self
            .db
            .list_tasks_for_dri(team, agent)?
            .into_iter()
            .any(|t| {
                matches!(
                    t.status,
                    TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Rejected
                )
            });
        Ok(open)
    }

    /// One scheduling cycle.  Returns the number of turns launched.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        if self.stopping.load(Ordering::Acquire) {
            return Ok(0);
        }

        // Eligible agents, grouped per team for round-robin admission.
        let mut queues: Vec<Vec<AgentKey>> = Vec::new();
        for team in self.db.list_teams()? {
            let merging = self.db.list_tasks(&team, Some(TaskStatus::Merging))?;
            let mut queue = Vec::new();
            for profile in config::read_roster(&self.home, &team)? {
                let key = (team.clone(), profile.name.clone());
                if self.is_in_flight(&key) {
                    continue;
                }
                if self.gated_by_merge(&merging, &profile.name) {
                    continue;
                }
                if !self.has_work(&team, &profile.name)? {
                    continue;
                }
                queue.push(key);
            }
            if !queue.is_empty() {
                queues.push(queue);
            }
        }

        // Interleave teams so one team cannot monopolise the worker pool.
        let mut selected = Vec::new();
        let mut round = 0usize;
        loop {
            let mut any = false;
            for queue in &queues {
                if let Some(key) = queue.get(round) {
                    selected.push(key.clone());
                    any = true;
                }
            }
            if !any {
                break;
            }
            round += 1;
        }

        let mut launched = 0usize;
        for key in selected {
            {
                let mut guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if guard.len() >= self.config.max_concurrent {
                    break;
                }
                if !guard.insert(key.clone()) {
                    continue;
                }
            }
            launched += 1;
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                let (team, agent) = key.clone();
                if let Err(e) = dispatcher.run_turn(&team, &agent).await {
                    error!("turn for {agent}@{team} error: {e}");
                }
                dispatcher
                    .in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
            });
        }
        Ok(launched)
    }

    /// Run one turn for one agent.  A failing turn is recorded on the
    /// event bus and goes no further.
    async fn run_turn(self: &Arc<Self>, team: &str, agent: &str) -> Result<()> {
        let dri_tasks: Vec<Task> = self
            .db
            .list_tasks_for_dri(team, agent)?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect();

        // Read locks on every worktree this turn might touch.
        let mut read_guards = Vec::new();
        for task in &dri_tasks {
            let lock = self.locks.get(team, task.id);
            read_guards.push(lock.read_owned().await);
        }

        let inbox = self.db.inbox(team, agent, true)?;
        let ids: Vec<i64> = inbox.iter().map(|m| m.id).collect();
        // Everything included in the turn is seen before the turn begins.
        self.db.mark_seen(team, &ids)?;

        let prompt = compose_turn_prompt(&dri_tasks, &inbox);
        self.bus.broadcast(Event::turn_started(team, agent));
        info!("turn start | team={team} | agent={agent} | inbox={}", ids.len());

        let key = (team.to_string(), agent.to_string());
        let mut session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.remove(&key) {
                Some(s) => s,
                None => self.build_session(team, agent)?,
            }
        };
        session.set_allowed_write_paths(self.write_paths_for(team, agent, &dri_tasks));

        let result = session.send(&prompt).await;
        drop(read_guards);

        match result {
            Ok(_) => {
                self.db.mark_processed(team, &ids)?;
                if let Err(e) = self.db.save_session_state(
                    team,
                    agent,
                    &session.id,
                    session.generation,
                    &session.usage,
                ) {
                    warn!("save_session_state for {agent}@{team}: {e}");
                }
                self.bus.broadcast(Event::turn_ended(team, agent, None));
            }
            Err(e) => {
                warn!("turn for {agent}@{team} failed: {e}");
                self.bus
                    .broadcast(Event::turn_ended(team, agent, Some(e.to_string())));
            }
        }

        self.sessions.lock().await.insert(key, session);
        Ok(())
    }

    fn build_session(&self, team: &str, agent: &str) -> Result<Session> {
        let profile = config::read_agent_state(&self.home, team, agent)
            .unwrap_or(crate::types::AgentProfile {
                name: agent.to_string(),
                role: "engineer".into(),
                model: String::new(),
            });
        let preamble = std::fs::read_to_string(paths::agent_bio_path(&self.home, team, agent))
            .unwrap_or_else(|_| format!("You are {agent}, an autonomous engineer."));
        let memory = std::fs::read_to_string(paths::agent_context_path(&self.home, team, agent))
            .unwrap_or_default();
        let cwd = paths::team_dir(&self.home, team);

        let context_path = paths::agent_context_path(&self.home, team, agent);
        let mut session = Session::new(Arc::clone(&self.executor), preamble, cwd)
            .with_memory(memory)
            .with_on_rotation(Box::new(move |memory| {
                if let Err(e) = std::fs::write(&context_path, memory.unwrap_or("")) {
                    warn!("failed to persist rotated memory: {e}");
                }
            }))
            .with_denied_bash_patterns(vec!["git rebase".into(), "git push --force".into()]);
        if !profile.model.is_empty() {
            session = session.with_model(profile.model);
        }
        if let Some(budget) = self.config.token_budget {
            session = session.with_max_context_tokens(budget);
        }
        Ok(session)
    }

    /// Write isolation for this turn: engineers are confined to their task
    /// worktrees and their own agent directory; managers are unrestricted.
    fn write_paths_for(&self, team: &str, agent: &str, tasks: &[Task]) -> Option<Vec<PathBuf>> {
        let role = config::read_agent_state(&self.home, team, agent)
            .map(|p| p.role)
            .unwrap_or_else(|_| "engineer".into());
        if role == "manager" {
            return None;
        }
        let mut allowed = vec![paths::agent_dir(&self.home, team, agent)];
        for task in tasks {
            for repo in &task.repos {
                allowed.push(paths::task_worktree_path(&self.home, team, repo, task.id));
            }
        }
        Some(allowed)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Stop scheduling, then wait up to `deadline` for in-flight turns to
    /// drain.  Returns false when turns had to be abandoned.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.request_stop();
        let start = Instant::now();
        while start.elapsed() < deadline {
            if self.in_flight_count() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        warn!(
            "shutdown deadline reached with {} turn(s) in flight — abandoning",
            self.in_flight_count()
        );
        false
    }

    /// Main loop: tick, sleep, repeat until stopped.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = self.tick().await {
                error!("dispatcher tick error: {e}");
            }
            tokio::time::sleep(self.config.interval).await;
        }
        info!("dispatcher stopped");
    }
}

/// The turn's user message: open tasks first, then the fresh mail.
fn compose_turn_prompt(tasks: &[Task], inbox: &[Message]) -> String {
    let mut sections = Vec::new();
    if !tasks.is_empty() {
        let mut s = String::from("Your open tasks:\n");
        for task in tasks {
            s.push_str(&format!(
                "- #{} [{}] {}: {}\n",
                task.id, task.status, task.title, task.description
            ));
            if let Some(reason) = &task.rejection_reason {
                s.push_str(&format!("  (rejected: {reason})\n"));
            }
        }
        sections.push(s);
    }
    if !inbox.is_empty() {
        let mut s = String::from("New messages:\n");
        for msg in inbox {
            s.push_str(&format!("From {}:\n{}\n\n", msg.sender, msg.body));
        }
        sections.push(s);
    }
    if sections.is_empty() {
        sections.push("Check in on your work and report status.".to_string());
    }
    sections.join("\n")
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("home", &self.home)
            .field("max_concurrent", &self.config.max_concurrent)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
