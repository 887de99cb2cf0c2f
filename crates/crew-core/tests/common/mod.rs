//! Shared test doubles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use crew_core::agent::{TurnExecutor, TurnOutcome, TurnRequest, TurnUsage};

#[derive(Debug, Clone, Default)]
pub struct StubTurn {
    pub text: String,
    pub input_tokens: u64,
    pub fail: bool,
}

impl StubTurn {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn with_input_tokens(mut self, tokens: u64) -> Self {
        self.input_tokens = tokens;
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

/// Replays scripted turns in order and records every request.  When the
/// script runs dry it echoes the prompt.
#[derive(Default)]
pub struct StubExecutor {
    script: Mutex<VecDeque<StubTurn>>,
    pub requests: Mutex<Vec<TurnRequest>>,
}

impl StubExecutor {
    pub fn new(turns: Vec<StubTurn>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl TurnExecutor for StubExecutor {
    async fn execute(&self, req: TurnRequest) -> Result<TurnOutcome> {
        self.requests.lock().unwrap().push(req.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(turn) if turn.fail => bail!("stubbed turn failure"),
            Some(turn) => Ok(TurnOutcome {
                text: turn.text,
                session_id: Some("stub-session".into()),
                usage: TurnUsage {
                    input_tokens: turn.input_tokens,
                    output_tokens: 1,
                    cache_read_tokens: 0,
                    cache_write_tokens: 0,
                    cost_usd: 0.0,
                },
            }),
            None => Ok(TurnOutcome {
                text: req.prompt,
                session_id: Some("stub-session".into()),
                usage: TurnUsage::default(),
            }),
        }
    }
}

/// Blocks every turn until released; used to observe in-flight state.
#[derive(Default)]
pub struct BlockingExecutor {
    pub release: tokio::sync::Notify,
    pub cwds: Mutex<Vec<std::path::PathBuf>>,
}

impl BlockingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started_count(&self) -> usize {
        self.cwds.lock().unwrap().len()
    }

    pub fn started_cwds(&self) -> Vec<std::path::PathBuf> {
        self.cwds.lock().unwrap().clone()
    }
}

#[async_trait]
impl TurnExecutor for BlockingExecutor {
    async fn execute(&self, req: TurnRequest) -> Result<TurnOutcome> {
        self.cwds.lock().unwrap().push(req.cwd.clone());
        self.release.notified().await;
        Ok(TurnOutcome {
            text: "done".into(),
            session_id: Some("blocking-session".into()),
            usage: TurnUsage::default(),
        })
    }
}
