use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{
    Approval, Message, MessageKind, NewTask, PipelineStep, RepoEntry, Task, TaskPatch, TaskStatus,
};
use crate::workflow;

/// Numbered schema migrations, applied in order at startup.  The current
/// version is tracked via `PRAGMA user_version`; re-running is a no-op.
const MIGRATIONS: &[&str] = &[
    // 1: initial schema
    "CREATE TABLE teams (
        name       TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL
     );
     CREATE TABLE tasks (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        team             TEXT NOT NULL REFERENCES teams(name),
        title            TEXT NOT NULL,
        description      TEXT NOT NULL DEFAULT '',
        dri              TEXT,
        status           TEXT NOT NULL,
        repos            TEXT NOT NULL DEFAULT '[]',
        branches         TEXT NOT NULL DEFAULT '{}',
        base_shas        TEXT NOT NULL DEFAULT '{}',
        merge_tips       TEXT NOT NULL DEFAULT '{}',
        merge_attempts   INTEGER NOT NULL DEFAULT 0,
        retry_after      INTEGER,
        rejection_reason TEXT,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL
     );
     CREATE INDEX idx_tasks_team_status ON tasks(team, status);
     CREATE TABLE messages (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        team         TEXT NOT NULL,
        sender       TEXT NOT NULL,
        recipient    TEXT NOT NULL,
        body         TEXT NOT NULL,
        kind         TEXT NOT NULL DEFAULT 'chat',
        created_at   INTEGER NOT NULL,
        delivered_at INTEGER,
        seen_at      INTEGER,
        processed_at INTEGER
     );
     CREATE INDEX idx_messages_team_recipient ON messages(team, recipient, delivered_at);
     CREATE TABLE feed (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        team       TEXT NOT NULL,
        kind       TEXT NOT NULL,
        actor      TEXT NOT NULL,
        body       TEXT NOT NULL,
        created_at INTEGER NOT NULL
     );
     CREATE TABLE repos (
        team     TEXT NOT NULL,
        name     TEXT NOT NULL,
        path     TEXT NOT NULL,
        approval TEXT NOT NULL DEFAULT 'auto',
        pipeline TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (team, name)
     );",
    // 2: per-agent session bookkeeping
    "CREATE TABLE sessions (
        team               TEXT NOT NULL,
        agent              TEXT NOT NULL,
        session_id         TEXT NOT NULL,
        generation         INTEGER NOT NULL DEFAULT 0,
        input_tokens       INTEGER NOT NULL DEFAULT 0,
        output_tokens      INTEGER NOT NULL DEFAULT 0,
        cache_read_tokens  INTEGER NOT NULL DEFAULT 0,
        cache_write_tokens INTEGER NOT NULL DEFAULT 0,
        cost_usd           REAL NOT NULL DEFAULT 0,
        updated_at         INTEGER NOT NULL,
        PRIMARY KEY (team, agent)
     );",
];

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn parse_map(raw: &str) -> HashMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(5)?;
    let repos: String = row.get(6)?;
    let branches: String = row.get(7)?;
    let base_shas: String = row.get(8)?;
    let merge_tips: String = row.get(9)?;
    Ok(Task {
        id: row.get(0)?,
        team: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        dri: row.get(4)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Unassigned),
        repos: parse_list(&repos),
        branches: parse_map(&branches),
        base_shas: parse_map(&base_shas),
        merge_tips: parse_map(&merge_tips),
        merge_attempts: row.get::<_, i64>(10)? as u32,
        retry_after: opt_from_millis(row.get(11)?),
        rejection_reason: row.get(12)?,
        created_at: from_millis(row.get(13)?),
        updated_at: from_millis(row.get(14)?),
    })
}

const TASK_COLUMNS: &str = "id, team, title, description, dri, status, repos, branches, \
                            base_shas, merge_tips, merge_attempts, retry_after, \
                            rejection_reason, created_at, updated_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind_str: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        team: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        body: row.get(4)?,
        kind: MessageKind::parse(&kind_str).unwrap_or(MessageKind::Chat),
        created_at: from_millis(row.get(6)?),
        delivered_at: opt_from_millis(row.get(7)?),
        seen_at: opt_from_millis(row.get(8)?),
        processed_at: opt_from_millis(row.get(9)?),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, team, sender, recipient, body, kind, created_at, delivered_at, seen_at, processed_at";

fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoEntry> {
    let approval_str: String = row.get(3)?;
    let pipeline_raw: String = row.get(4)?;
    Ok(RepoEntry {
        team: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        approval: Approval::parse(&approval_str).unwrap_or(Approval::Auto),
        pipeline: serde_json::from_str(&pipeline_raw).unwrap_or_default(),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply pending schema migrations in numbered order.  Idempotent.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .context("read user_version")?;
        for (i, sql) in MIGRATIONS.iter().enumerate() {
            let target = (i + 1) as i64;
            if version >= target {
                continue;
            }
            conn.execute_batch(sql)
                .with_context(|| format!("apply schema migration {target}"))?;
            conn.pragma_update(None, "user_version", target)
                .with_context(|| format!("bump user_version to {target}"))?;
        }
        Ok(())
    }

    // ── Teams ─────────────────────────────────────────────────────────────

    pub fn create_team(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO teams (name, created_at) VALUES (?1, ?2)",
            params![name, to_millis(Utc::now())],
        )
        .context("create_team")?;
        Ok(())
    }

    pub fn list_teams(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT name FROM teams ORDER BY name ASC")?;
        let names = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_teams")?;
        Ok(names)
    }

    pub fn team_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM teams WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .context("team_exists")?;
        Ok(n > 0)
    }

    pub fn remove_team(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM tasks WHERE team = ?1", params![name])
            .context("remove_team tasks")?;
        conn.execute("DELETE FROM messages WHERE team = ?1", params![name])
            .context("remove_team messages")?;
        conn.execute("DELETE FROM feed WHERE team = ?1", params![name])
            .context("remove_team feed")?;
        conn.execute("DELETE FROM repos WHERE team = ?1", params![name])
            .context("remove_team repos")?;
        conn.execute("DELETE FROM sessions WHERE team = ?1", params![name])
            .context("remove_team sessions")?;
        conn.execute("DELETE FROM teams WHERE name = ?1", params![name])
            .context("remove_team")?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub fn create_task(&self, team: &str, fields: NewTask) -> Result<Task> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = to_millis(Utc::now());
        conn.execute(
            "INSERT INTO tasks (team, title, description, dri, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                team,
                fields.title,
                fields.description,
                fields.dri,
                TaskStatus::Unassigned.as_str(),
                now,
            ],
        )
        .context("create_task")?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_task(team, id)?
            .ok_or_else(|| anyhow!("task #{id} vanished after insert"))
    }

    pub fn get_task(&self, team: &str, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE team = ?1 AND id = ?2"),
                params![team, id],
                row_to_task,
            )
            .optional()
            .context("get_task")?;
        Ok(result)
    }

    pub fn list_tasks(&self, team: &str, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE team = ?1 AND (?2 IS NULL OR status = ?2) \
             ORDER BY id ASC"
        ))?;
        let tasks = stmt
            .query_map(params![team, status.map(|s| s.as_str())], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_tasks")?;
        Ok(tasks)
    }

    pub fn list_tasks_for_dri(&self, team: &str, dri: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE team = ?1 AND dri = ?2 ORDER BY id ASC"
        ))?;
        let tasks = stmt
            .query_map(params![team, dri], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_tasks_for_dri")?;
        Ok(tasks)
    }

    /// Guarded status transition.  Invalid moves fail with
    /// [`workflow::WorkflowError::InvalidTransition`].
    pub fn change_status(&self, team: &str, id: i64, new_status: TaskStatus) -> Result<Task> {
        let task = self
            .get_task(team, id)?
            .ok_or_else(|| workflow::WorkflowError::UnknownTask { team: team.into(), id })?;
        workflow::validate_transition(&task, new_status)?;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE team = ?3 AND id = ?4",
            params![new_status.as_str(), to_millis(Utc::now()), team, id],
        )
        .context("change_status")?;
        drop(conn);
        self.get_task(team, id)?
            .ok_or_else(|| anyhow!("task #{id} vanished during status change"))
    }

    /// Merge the provided fields into the task.  Per-repo maps merge
    /// key-by-key; `repos` unions; absent fields are untouched.
    pub fn update_task(&self, team: &str, id: i64, patch: TaskPatch) -> Result<Task> {
        let mut task = self
            .get_task(team, id)?
            .ok_or_else(|| workflow::WorkflowError::UnknownTask { team: team.into(), id })?;

        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        patch.dri.apply(&mut task.dri);
        for repo in patch.repos {
            if !task.repos.contains(&repo) {
                task.repos.push(repo);
            }
        }
        for (k, v) in patch.branches {
            if !task.repos.contains(&k) {
                task.repos.push(k.clone());
            }
            task.branches.insert(k, v);
        }
        for (k, v) in patch.base_shas {
            task.base_shas.insert(k, v);
        }
        for (k, v) in patch.merge_tips {
            task.merge_tips.insert(k, v);
        }
        if let Some(attempts) = patch.merge_attempts {
            task.merge_attempts = attempts;
        }
        patch.retry_after.apply(&mut task.retry_after);
        patch.rejection_reason.apply(&mut task.rejection_reason);

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET title = ?1, description = ?2, dri = ?3, repos = ?4, \
             branches = ?5, base_shas = ?6, merge_tips = ?7, merge_attempts = ?8, \
             retry_after = ?9, rejection_reason = ?10, updated_at = ?11 \
             WHERE team = ?12 AND id = ?13",
            params![
                task.title,
                task.description,
                task.dri,
                serde_json::to_string(&task.repos)?,
                serde_json::to_string(&task.branches)?,
                serde_json::to_string(&task.base_shas)?,
                serde_json::to_string(&task.merge_tips)?,
                task.merge_attempts as i64,
                task.retry_after.map(to_millis),
                task.rejection_reason,
                to_millis(Utc::now()),
                team,
                id,
            ],
        )
        .context("update_task")?;
        drop(conn);
        self.get_task(team, id)?
            .ok_or_else(|| anyhow!("task #{id} vanished during update"))
    }

    // ── Messages ──────────────────────────────────────────────────────────

    /// Insert a message with immediate delivery, plus a chat feed row.
    /// Both writes happen in one transaction.
    pub fn send_message(
        &self,
        team: &str,
        sender: &str,
        recipient: &str,
        body: &str,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = to_millis(Utc::now());
        let tx = conn.transaction().context("send_message begin")?;
        tx.execute(
            "INSERT INTO messages (team, sender, recipient, body, kind, created_at, delivered_at) \
             VALUES (?1, ?2, ?3, ?4, 'chat', ?5, ?5)",
            params![team, sender, recipient, body, now],
        )
        .context("send_message insert")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO feed (team, kind, actor, body, created_at) \
             VALUES (?1, 'chat', ?2, ?3, ?4)",
            params![team, sender, format!("{sender} → {recipient}: {body}"), now],
        )
        .context("send_message feed")?;
        tx.commit().context("send_message commit")?;
        Ok(id)
    }

    /// Insert a message without delivering it (deferred-delivery producer).
    pub fn enqueue_message(
        &self,
        team: &str,
        sender: &str,
        recipient: &str,
        body: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO messages (team, sender, recipient, body, kind, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'chat', ?5)",
            params![team, sender, recipient, body, to_millis(Utc::now())],
        )
        .context("enqueue_message")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_message(&self, team: &str, id: i64) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE team = ?1 AND id = ?2"),
                params![team, id],
                row_to_message,
            )
            .optional()
            .context("get_message")?;
        Ok(result)
    }

    pub fn undelivered_messages(&self, team: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE team = ?1 AND delivered_at IS NULL ORDER BY created_at ASC, id ASC"
        ))?;
        let messages = stmt
            .query_map(params![team], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("undelivered_messages")?;
        Ok(messages)
    }

    pub fn mark_delivered(&self, team: &str, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE messages SET delivered_at = ?1 \
             WHERE team = ?2 AND id = ?3 AND delivered_at IS NULL",
            params![to_millis(Utc::now()), team, id],
        )
        .context("mark_delivered")?;
        Ok(())
    }

    pub fn inbox(&self, team: &str, agent: &str, unread_only: bool) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE team = ?1 AND recipient = ?2 AND delivered_at IS NOT NULL \
             AND (?3 = 0 OR processed_at IS NULL) \
             ORDER BY delivered_at ASC, id ASC"
        ))?;
        let messages = stmt
            .query_map(params![team, agent, unread_only as i64], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("inbox")?;
        Ok(messages)
    }

    pub fn outbox(&self, team: &str, agent: &str, pending_only: bool) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE team = ?1 AND sender = ?2 \
             AND (?3 = 0 OR delivered_at IS NULL) \
             ORDER BY created_at ASC, id ASC"
        ))?;
        let messages = stmt
            .query_map(params![team, agent, pending_only as i64], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("outbox")?;
        Ok(messages)
    }

    /// Idempotent: only stamps rows whose `seen_at` is still null.
    pub fn mark_seen(&self, team: &str, ids: &[i64]) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = to_millis(Utc::now());
        for id in ids {
            conn.execute(
                "UPDATE messages SET seen_at = ?1 \
                 WHERE team = ?2 AND id = ?3 AND seen_at IS NULL",
                params![now, team, id],
            )
            .context("mark_seen")?;
        }
        Ok(())
    }

    /// Idempotent; also backfills `seen_at` so lifecycle stays monotonic.
    pub fn mark_processed(&self, team: &str, ids: &[i64]) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = to_millis(Utc::now());
        for id in ids {
            conn.execute(
                "UPDATE messages SET seen_at = COALESCE(seen_at, ?1), processed_at = ?1 \
                 WHERE team = ?2 AND id = ?3 AND processed_at IS NULL",
                params![now, team, id],
            )
            .context("mark_processed")?;
        }
        Ok(())
    }

    pub fn count_unread(&self, team: &str, agent: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages \
                 WHERE team = ?1 AND recipient = ?2 \
                 AND delivered_at IS NOT NULL AND processed_at IS NULL",
                params![team, agent],
                |r| r.get(0),
            )
            .context("count_unread")?;
        Ok(n as u64)
    }

    pub fn agents_with_unread(&self, team: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT DISTINCT recipient FROM messages \
             WHERE team = ?1 AND delivered_at IS NOT NULL AND processed_at IS NULL \
             ORDER BY recipient ASC",
        )?;
        let agents = stmt
            .query_map(params![team], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("agents_with_unread")?;
        Ok(agents)
    }

    /// Merged inbox + outbox for one participant, ordered by time.
    pub fn recent_conversation(
        &self,
        team: &str,
        agent: &str,
        peer: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE team = ?1 AND (sender = ?2 OR recipient = ?2) \
             AND (?3 IS NULL OR sender = ?3 OR recipient = ?3) \
             ORDER BY created_at DESC, id DESC LIMIT ?4"
        ))?;
        let mut messages = stmt
            .query_map(params![team, agent, peer, limit], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent_conversation")?;
        messages.reverse();
        Ok(messages)
    }

    // ── Feed (audit log) ──────────────────────────────────────────────────

    pub fn log_event(&self, team: &str, actor: &str, body: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO feed (team, kind, actor, body, created_at) \
             VALUES (?1, 'event', ?2, ?3, ?4)",
            params![team, actor, body, to_millis(Utc::now())],
        )
        .context("log_event")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn feed(&self, team: &str, limit: u32) -> Result<Vec<crate::types::FeedEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, team, kind, actor, body, created_at FROM feed \
             WHERE team = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut entries = stmt
            .query_map(params![team, limit], |row| {
                let kind_str: String = row.get(2)?;
                Ok(crate::types::FeedEntry {
                    id: row.get(0)?,
                    team: row.get(1)?,
                    kind: MessageKind::parse(&kind_str).unwrap_or(MessageKind::Event),
                    actor: row.get(3)?,
                    body: row.get(4)?,
                    created_at: from_millis(row.get(5)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("feed")?;
        entries.reverse();
        Ok(entries)
    }

    // ── Repos ─────────────────────────────────────────────────────────────

    /// Register (or re-register) a repository.  Registering the same path
    /// twice keeps the original row and returns its name.
    pub fn register_repo(
        &self,
        team: &str,
        name: &str,
        path: &str,
        approval: Approval,
        pipeline: &[PipelineStep],
    ) -> Result<String> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let existing: Option<String> = conn
            .query_row(
                "SELECT name FROM repos WHERE team = ?1 AND path = ?2",
                params![team, path],
                |r| r.get(0),
            )
            .optional()
            .context("register_repo lookup")?;
        if let Some(name) = existing {
            return Ok(name);
        }
        conn.execute(
            "INSERT INTO repos (team, name, path, approval, pipeline) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                team,
                name,
                path,
                approval.as_str(),
                serde_json::to_string(pipeline)?,
            ],
        )
        .context("register_repo")?;
        Ok(name.to_string())
    }

    pub fn get_repo(&self, team: &str, name: &str) -> Result<Option<RepoEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT team, name, path, approval, pipeline FROM repos \
                 WHERE team = ?1 AND name = ?2",
                params![team, name],
                row_to_repo,
            )
            .optional()
            .context("get_repo")?;
        Ok(result)
    }

    pub fn list_repos(&self, team: &str) -> Result<Vec<RepoEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT team, name, path, approval, pipeline FROM repos \
             WHERE team = ?1 ORDER BY name ASC",
        )?;
        let repos = stmt
            .query_map(params![team], row_to_repo)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_repos")?;
        Ok(repos)
    }

    // ── Session bookkeeping ───────────────────────────────────────────────

    pub fn save_session_state(
        &self,
        team: &str,
        agent: &str,
        session_id: &str,
        generation: u32,
        usage: &crate::session::SessionUsage,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO sessions (team, agent, session_id, generation, input_tokens, \
             output_tokens, cache_read_tokens, cache_write_tokens, cost_usd, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(team, agent) DO UPDATE SET \
               session_id = excluded.session_id, \
               generation = excluded.generation, \
               input_tokens = excluded.input_tokens, \
               output_tokens = excluded.output_tokens, \
               cache_read_tokens = excluded.cache_read_tokens, \
               cache_write_tokens = excluded.cache_write_tokens, \
               cost_usd = excluded.cost_usd, \
               updated_at = excluded.updated_at",
            params![
                team,
                agent,
                session_id,
                generation as i64,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.cache_read_tokens as i64,
                usage.cache_write_tokens as i64,
                usage.cost_usd,
                to_millis(Utc::now()),
            ],
        )
        .context("save_session_state")?;
        Ok(())
    }
}
