//! Deterministic scripted executor for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use crew_core::agent::{TurnExecutor, TurnOutcome, TurnRequest, TurnUsage};

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub text: String,
    pub session_id: Option<String>,
    pub usage: TurnUsage,
    /// When true this turn errors instead of replying.
    pub fail: bool,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: Some("scripted-session".into()),
            usage: TurnUsage::default(),
            fail: false,
        }
    }

    pub fn with_input_tokens(mut self, tokens: u64) -> Self {
        self.usage.input_tokens = tokens;
        self
    }

    pub fn failing() -> Self {
        Self {
            text: String::new(),
            session_id: None,
            usage: TurnUsage::default(),
            fail: true,
        }
    }
}

/// Pops scripted turns in order; records every request it saw.  When the
/// script runs dry it echoes the prompt with zero usage.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<ScriptedTurn>>,
    pub requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedExecutor {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl TurnExecutor for ScriptedExecutor {
    async fn execute(&self, req: TurnRequest) -> Result<TurnOutcome> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req.clone());
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(turn) if turn.fail => bail!("scripted turn failure"),
            Some(turn) => Ok(TurnOutcome {
                text: turn.text,
                session_id: turn.session_id,
                usage: turn.usage,
            }),
            None => Ok(TurnOutcome {
                text: req.prompt,
                session_id: Some("scripted-session".into()),
                usage: TurnUsage::default(),
            }),
        }
    }
}
