//! Turn-executor contract.
//!
//! The model runtime is a black box behind this trait: one call runs one
//! turn and reports the text, an opaque resumption handle, and the turn's
//! token deltas.  Backends live in the `crew-agent` crate.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::session::PermissionGuard;

/// Per-turn token deltas as reported by the runtime.  Not cumulative —
/// the session accumulates them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    /// Opaque handle from a prior turn; absent on the first turn of a
    /// generation.
    pub resume: Option<String>,
    pub add_dirs: Vec<PathBuf>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: String,
    /// Consulted by the runtime for every tool call; `None` when there is
    /// nothing to enforce.
    pub guard: Option<PermissionGuard>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Concatenated assistant text blocks.
    pub text: String,
    /// Resumption handle for the next turn.
    pub session_id: Option<String>,
    pub usage: TurnUsage,
}

#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn execute(&self, req: TurnRequest) -> Result<TurnOutcome>;
}
