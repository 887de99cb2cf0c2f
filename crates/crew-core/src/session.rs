//! Bounded-context conversation session.
//!
//! Deliberately independent of the domain model (teams, tasks, worktrees):
//! hand it a preamble and a working directory, call [`Session::send`]
//! repeatedly.  The session handles runtime resumption, token accounting,
//! permission enforcement, and automatic context-window rotation.
//!
//! On the first turn of each generation the outgoing user message is
//!
//! ```text
//! ## PREAMBLE
//!
//! {preamble}
//!
//! ## MEMORY          ← omitted when memory is empty
//!
//! {memory}
//!
//! {prompt}
//! ```
//!
//! On later turns only `{prompt}` is sent — preamble and memory are already
//! in the runtime's retained history.
//!
//! When cumulative input tokens exceed the budget the session auto-rotates:
//! ask the model for a summary, replace `memory` with it, notify the caller
//! via `on_rotation`, then hard-reset (fresh id, cleared handle, zeroed
//! usage, generation bump).  A failed summary turn still resets — losing
//! the summary beats a stuck session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::agent::{TurnExecutor, TurnOutcome, TurnRequest};

pub const DEFAULT_MAX_CONTEXT_TOKENS: u64 = 80_000;

pub const DEFAULT_ROTATION_PROMPT: &str = "Your session context is about to be rotated. \
Please write a concise summary of whatever you have learned - about \
the project, codebase, recent tasks, and any other information that may \
be useful to you in future sessions.\n\
This summary will be provided to you at the start of your \
next session so you can pick up where you left off.";

/// Cumulative token usage for one session generation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

// ── Permission guard ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDecision {
    Allow,
    Deny { message: String },
}

/// Per-turn tool-call policy, consulted by the runtime for every tool call.
///
/// `Edit`/`Write` are allowed iff the resolved target path is equal to or
/// under an allowed prefix (`None` = unrestricted).  `Bash` is denied iff
/// the command contains any denied substring.  All other tools pass.
#[derive(Debug, Clone, Default)]
pub struct PermissionGuard {
    pub allowed_write_paths: Option<Vec<PathBuf>>,
    pub denied_bash_patterns: Vec<String>,
}

impl PermissionGuard {
    pub fn is_empty(&self) -> bool {
        self.allowed_write_paths.is_none() && self.denied_bash_patterns.is_empty()
    }

    pub fn check(&self, tool_name: &str, tool_input: &Value) -> ToolDecision {
        if let Some(prefixes) = &self.allowed_write_paths {
            if matches!(tool_name, "Edit" | "Write") {
                let file_path = tool_input
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if !file_path.is_empty() {
                    let resolved = normalize(Path::new(file_path));
                    let allowed = prefixes
                        .iter()
                        .any(|p| resolved == normalize(p) || resolved.starts_with(normalize(p)));
                    if !allowed {
                        return ToolDecision::Deny {
                            message: format!(
                                "Write denied: {file_path} is outside allowed paths {:?}",
                                prefixes
                            ),
                        };
                    }
                }
            }
        }
        if tool_name == "Bash" && !self.denied_bash_patterns.is_empty() {
            let cmd = tool_input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            for pattern in &self.denied_bash_patterns {
                if cmd.contains(pattern.as_str()) {
                    return ToolDecision::Deny {
                        message: format!("Command denied: contains '{pattern}'"),
                    };
                }
            }
        }
        ToolDecision::Allow
    }
}

/// Lexically resolve `.` and `..` components.  Symlinks are not chased;
/// targets typically do not exist yet at check time.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

// ── Session ──────────────────────────────────────────────────────────────

pub type RotationHook = Box<dyn Fn(Option<&str>) + Send + Sync>;

pub struct Session {
    /// Fresh 32-hex id per generation.
    pub id: String,
    pub preamble: String,
    pub memory: String,
    pub cwd: PathBuf,
    pub max_context_tokens: u64,
    pub rotation_prompt: Option<String>,
    pub model: Option<String>,
    pub add_dirs: Vec<PathBuf>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: String,
    pub usage: SessionUsage,
    pub turns: u32,
    pub generation: u32,

    executor: Arc<dyn TurnExecutor>,
    on_rotation: Option<RotationHook>,
    allowed_write_paths: Option<Vec<PathBuf>>,
    denied_bash_patterns: Vec<String>,
    external_session_handle: Option<String>,
}

impl Session {
    pub fn new(
        executor: Arc<dyn TurnExecutor>,
        preamble: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: fresh_id(),
            preamble: preamble.into(),
            memory: String::new(),
            cwd: cwd.into(),
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            rotation_prompt: Some(DEFAULT_ROTATION_PROMPT.to_string()),
            model: None,
            add_dirs: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode: "bypassPermissions".to_string(),
            usage: SessionUsage::default(),
            turns: 0,
            generation: 0,
            executor,
            on_rotation: None,
            allowed_write_paths: None,
            denied_bash_patterns: Vec::new(),
            external_session_handle: None,
        }
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    pub fn with_max_context_tokens(mut self, max: u64) -> Self {
        self.max_context_tokens = max;
        self
    }

    /// `None` disables the summary turn: rotation is a hard reset only.
    pub fn with_rotation_prompt(mut self, prompt: Option<String>) -> Self {
        self.rotation_prompt = prompt;
        self
    }

    pub fn with_on_rotation(mut self, hook: RotationHook) -> Self {
        self.on_rotation = Some(hook);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// `None` = unrestricted writes (e.g. managers).
    pub fn with_allowed_write_paths(mut self, paths: Option<Vec<PathBuf>>) -> Self {
        self.allowed_write_paths = paths;
        self
    }

    pub fn with_denied_bash_patterns(mut self, patterns: Vec<String>) -> Self {
        self.denied_bash_patterns = patterns;
        self
    }

    pub fn with_add_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.add_dirs = dirs;
        self
    }

    pub fn with_disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.disallowed_tools = tools;
        self
    }

    pub fn with_permission_mode(mut self, mode: impl Into<String>) -> Self {
        self.permission_mode = mode.into();
        self
    }

    pub fn set_allowed_write_paths(&mut self, paths: Option<Vec<PathBuf>>) {
        self.allowed_write_paths = paths;
    }

    // ── Properties ────────────────────────────────────────────────────────

    /// Whether a resumable runtime session exists.
    pub fn is_active(&self) -> bool {
        self.external_session_handle.is_some()
    }

    /// Whether cumulative input tokens exceed the budget.
    pub fn needs_rotation(&self) -> bool {
        self.usage.input_tokens > self.max_context_tokens
    }

    pub fn guard(&self) -> Option<PermissionGuard> {
        let guard = PermissionGuard {
            allowed_write_paths: self.allowed_write_paths.clone(),
            denied_bash_patterns: self.denied_bash_patterns.clone(),
        };
        if guard.is_empty() {
            None
        } else {
            Some(guard)
        }
    }

    // ── Core API ──────────────────────────────────────────────────────────

    /// Send a prompt, rotating first when the context window is full.
    pub async fn send(&mut self, prompt: &str) -> Result<TurnOutcome> {
        if self.needs_rotation() {
            self.rotate().await;
        }
        self.run_turn(prompt).await
    }

    /// Rotate using the configured rotation prompt.  Returns the summary
    /// that became the new memory, if one was produced.
    pub async fn rotate(&mut self) -> Option<String> {
        let prompt = self.rotation_prompt.clone();
        self.rotate_with(prompt.as_deref()).await
    }

    /// Rotate with an explicit summary prompt (`None` = skip the summary
    /// turn and hard-reset only).
    pub async fn rotate_with(&mut self, summary_prompt: Option<&str>) -> Option<String> {
        let mut summary: Option<String> = None;

        if let Some(prompt) = summary_prompt {
            if self.is_active() {
                // The summary turn goes through the non-rotating inner path,
                // so it can never re-enter rotation.
                match self.run_turn(prompt).await {
                    Ok(outcome) => {
                        let text = outcome.text.trim().to_string();
                        if !text.is_empty() {
                            summary = Some(text);
                        }
                    }
                    Err(e) => {
                        warn!("rotation summary turn failed: {e}; resetting without summary");
                    }
                }
            }
        }

        info!(
            "session {} rotating (gen {} → {}, {} turns, {} input tokens)",
            &self.id[..8.min(self.id.len())],
            self.generation,
            self.generation + 1,
            self.turns,
            self.usage.input_tokens,
        );

        self.memory = summary.clone().unwrap_or_default();

        if let Some(hook) = &self.on_rotation {
            hook(summary.as_deref());
        }

        self.reset();
        summary
    }

    /// Hard reset: fresh id, cleared handle, zeroed usage and turns,
    /// generation bump.  `memory` persists across generations.
    pub fn reset(&mut self) {
        self.id = fresh_id();
        self.external_session_handle = None;
        self.usage = SessionUsage::default();
        self.turns = 0;
        self.generation += 1;
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn turn0_prompt(&self, prompt: &str) -> String {
        let mut parts = vec!["## PREAMBLE".to_string(), self.preamble.clone()];
        if !self.memory.trim().is_empty() {
            parts.push("## MEMORY".to_string());
            parts.push(self.memory.clone());
        }
        parts.push(prompt.to_string());
        parts.join("\n\n")
    }

    async fn run_turn(&mut self, prompt: &str) -> Result<TurnOutcome> {
        let effective = if self.turns == 0 {
            self.turn0_prompt(prompt)
        } else {
            prompt.to_string()
        };

        let req = TurnRequest {
            prompt: effective,
            cwd: self.cwd.clone(),
            model: self.model.clone(),
            resume: self.external_session_handle.clone(),
            add_dirs: self.add_dirs.clone(),
            disallowed_tools: self.disallowed_tools.clone(),
            permission_mode: self.permission_mode.clone(),
            guard: self.guard(),
        };

        let outcome = self.executor.execute(req).await?;

        if outcome.session_id.is_some() {
            self.external_session_handle = outcome.session_id.clone();
        }
        self.usage.input_tokens += outcome.usage.input_tokens;
        self.usage.output_tokens += outcome.usage.output_tokens;
        self.usage.cache_read_tokens += outcome.usage.cache_read_tokens;
        self.usage.cache_write_tokens += outcome.usage.cache_write_tokens;
        self.usage.cost_usd += outcome.usage.cost_usd;
        self.turns += 1;

        Ok(outcome)
    }
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ── Unit tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard_with(paths: Option<Vec<&str>>, bash: &[&str]) -> PermissionGuard {
        PermissionGuard {
            allowed_write_paths: paths.map(|ps| ps.iter().map(PathBuf::from).collect()),
            denied_bash_patterns: bash.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn write_inside_allowed_prefix_passes() {
        let g = guard_with(Some(vec!["/work/repo"]), &[]);
        let d = g.check("Write", &json!({"file_path": "/work/repo/src/main.rs"}));
        assert_eq!(d, ToolDecision::Allow);
    }

    #[test]
    fn write_at_exact_prefix_passes() {
        let g = guard_with(Some(vec!["/work/repo"]), &[]);
        assert_eq!(g.check("Edit", &json!({"file_path": "/work/repo"})), ToolDecision::Allow);
    }

    #[test]
    fn write_outside_prefix_is_denied() {
        let g = guard_with(Some(vec!["/work/repo"]), &[]);
        let d = g.check("Write", &json!({"file_path": "/etc/passwd"}));
        assert!(matches!(d, ToolDecision::Deny { .. }));
    }

    #[test]
    fn write_escaping_via_dotdot_is_denied() {
        let g = guard_with(Some(vec!["/work/repo"]), &[]);
        let d = g.check("Edit", &json!({"file_path": "/work/repo/../other/file"}));
        assert!(matches!(d, ToolDecision::Deny { .. }));
    }

    #[test]
    fn bash_with_denied_substring_is_denied() {
        let g = guard_with(None, &["git rebase"]);
        let d = g.check("Bash", &json!({"command": "cd /x && git rebase main"}));
        assert!(matches!(d, ToolDecision::Deny { .. }));
    }

    #[test]
    fn bash_without_denied_substring_passes() {
        let g = guard_with(None, &["git rebase"]);
        assert_eq!(g.check("Bash", &json!({"command": "git status"})), ToolDecision::Allow);
    }

    #[test]
    fn read_tools_are_always_allowed() {
        let g = guard_with(Some(vec!["/work/repo"]), &["rm"]);
        assert_eq!(g.check("Read", &json!({"file_path": "/etc/passwd"})), ToolDecision::Allow);
        assert_eq!(g.check("Grep", &json!({"pattern": "rm -rf"})), ToolDecision::Allow);
    }

    #[test]
    fn empty_guard_reports_empty() {
        assert!(guard_with(None, &[]).is_empty());
        assert!(!guard_with(Some(vec!["/x"]), &[]).is_empty());
        assert!(!guard_with(None, &["rm"]).is_empty());
    }
}
